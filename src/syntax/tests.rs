//! End-to-end exercises of the raw syntax core: source round-trips,
//! incremental reuse through the cache, and cross-arena liveness.

use crate::syntax::{
    RawSyntax, SourceEdit, SourcePresence, SyntaxArena, SyntaxKind, SyntaxParsingCache,
    SyntaxTreeCreator, TokenKind,
};
use anyhow::Result;
use std::sync::Arc;

/// Parses `if (x) ` the way a front-end would drive the creator.
fn record_if_condition(creator: &SyntaxTreeCreator) -> std::ptr::NonNull<RawSyntax> {
    let kw = creator.record_token(TokenKind::KwIf, 0, 1, 0..3);
    let open = creator.record_token(TokenKind::LeftParen, 0, 0, 3..4);
    let name = creator.record_token(TokenKind::Identifier, 0, 0, 4..5);
    let close = creator.record_token(TokenKind::RightParen, 0, 1, 5..7);
    creator.record_raw_syntax(
        SyntaxKind::Condition,
        &[kw.as_ptr(), open.as_ptr(), name.as_ptr(), close.as_ptr()],
    )
}

#[test]
fn layout_round_trips_the_exact_source_slice() -> Result<()> {
    let creator = SyntaxTreeCreator::new("if (x) ", None);
    let node = record_if_condition(&creator);
    let node = unsafe { node.as_ref() };

    // 3 ("if ") + 1 + 1 + 2 (") ") spelled bytes.
    assert_eq!(node.text_length(), 7);
    assert_eq!(node.source_text(), "if (x) ");
    Ok(())
}

#[test]
fn text_length_law_holds_recursively() -> Result<()> {
    fn check(node: &RawSyntax) -> usize {
        let expected = if node.is_token() {
            if node.is_missing() {
                0
            } else {
                node.leading_trivia().len() + node.token_text().len() + node.trailing_trivia().len()
            }
        } else {
            node.children().map(check).sum()
        };
        assert_eq!(node.text_length(), expected);
        expected
    }

    let creator = SyntaxTreeCreator::new("if (x) ", None);
    let condition = record_if_condition(&creator);
    let missing = creator.record_missing_token(TokenKind::Semicolon, 7);
    let root = creator.record_raw_syntax(
        SyntaxKind::SourceFile,
        &[condition.as_ptr(), missing.as_ptr()],
    );

    let root = unsafe { root.as_ref() };
    assert_eq!(check(root), 7);

    // Sub-node counting obeys its own law on the same tree.
    fn count(node: &RawSyntax) -> usize {
        node.children().map(|child| 1 + count(child)).sum()
    }
    assert_eq!(root.total_sub_node_count(), count(root));
    assert_eq!(root.total_sub_node_count(), 6);
    Ok(())
}

#[test]
fn incremental_reparse_reuses_the_unchanged_root() -> Result<()> {
    // First parse.
    let first = SyntaxTreeCreator::new("if (x) ", None);
    let condition = record_if_condition(&first);
    let root = first.record_raw_syntax(SyntaxKind::SourceFile, &[condition.as_ptr()]);
    let realized = first.realize_syntax_root(root, None);
    let root_id = realized.raw().node_id();
    let root_length = realized.raw().text_length();

    // Reparse of identical source, seeded from the first tree.
    let cache = Arc::new(SyntaxParsingCache::new(
        std::ptr::NonNull::from(realized.raw()),
        Arc::clone(realized.arena()),
    ));
    let second = SyntaxTreeCreator::new("if (x) ", Some(cache));

    let (skipped, reused) = second
        .lookup_node(0, SyntaxKind::SourceFile)
        .expect("unchanged tree should be reused");
    assert_eq!(skipped, root_length);

    let reused = unsafe { reused.as_ref() };
    assert_eq!(reused.node_id(), root_id, "identity survives the reparse");

    // The reused node is the new tree; realize it directly.
    let rerealized = second.realize_syntax_root(reused.into(), None);
    assert_eq!(rerealized.raw().source_text(), "if (x) ");
    Ok(())
}

#[test]
fn edited_reparse_reuses_only_clear_subtrees() -> Result<()> {
    let first = SyntaxTreeCreator::new("if (x) ", None);
    let condition = record_if_condition(&first);
    let root = first.record_raw_syntax(SyntaxKind::SourceFile, &[condition.as_ptr()]);
    let realized = first.realize_syntax_root(root, None);

    let mut cache = SyntaxParsingCache::new(
        std::ptr::NonNull::from(realized.raw()),
        Arc::clone(realized.arena()),
    );
    // Replace `x` with `yy`.
    cache.add_edit(SourceEdit::new(4, 5, 2));

    let second = SyntaxTreeCreator::new("if (yy) ", Some(Arc::new(cache)));
    assert!(
        second.lookup_node(0, SyntaxKind::SourceFile).is_none(),
        "an edit inside the tree blocks wholesale reuse"
    );
    Ok(())
}

#[test]
fn nodes_survive_their_birth_arena_being_dropped() -> Result<()> {
    let keeper = SyntaxArena::new();

    let root = {
        let nursery = SyntaxArena::new();
        let token = RawSyntax::token(
            TokenKind::Identifier,
            "alive",
            "",
            "",
            SourcePresence::Present,
            &nursery,
            None,
        );
        // Referencing the token from `keeper` retains `nursery`.
        RawSyntax::layout(
            SyntaxKind::SourceFile,
            &[token.as_ptr()],
            SourcePresence::Present,
            &keeper,
            None,
        )
        // `nursery`'s handle drops here.
    };

    let root = unsafe { root.as_ref() };
    assert_eq!(root.child(0).unwrap().token_text(), "alive");
    assert_eq!(root.source_text(), "alive");
    Ok(())
}
