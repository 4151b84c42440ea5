use crate::syntax::arena::SyntaxArena;
use crate::syntax::kind::SyntaxKind;
use crate::syntax::raw::RawSyntax;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::trace;

/// One textual edit between the tree a cache was seeded with and the source
/// being reparsed. Offsets are in pre-edit coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceEdit {
    /// First byte replaced by the edit.
    pub start: usize,
    /// Past-the-end byte of the replaced range.
    pub end: usize,
    /// Byte length of the replacement text.
    pub replacement_length: usize,
}

impl SourceEdit {
    pub fn new(start: usize, end: usize, replacement_length: usize) -> SourceEdit {
        assert!(start <= end, "edit range is inverted");
        SourceEdit {
            start,
            end,
            replacement_length,
        }
    }

    fn original_length(&self) -> usize {
        self.end - self.start
    }

    /// Whether the edit touches `[start, end]` (inclusive bounds: a node
    /// directly bordering an edit is affected through its next token).
    fn intersects(&self, start: usize, end: usize) -> bool {
        self.start <= end && start <= self.end
    }
}

/// Cache of a previously parsed tree, consulted during an incremental
/// reparse to reuse unchanged subtrees.
///
/// Keyed on `(lexer offset, kind)`. The cache owns the old tree's arena, so
/// every node it hands out stays alive at least as long as the cache; the
/// consumer retains the arena as a child of its own.
pub struct SyntaxParsingCache {
    root: NonNull<RawSyntax>,
    arena: Arc<SyntaxArena>,
    /// Edits made since `root` was parsed, sorted and non-overlapping.
    edits: Vec<SourceEdit>,
}

// Safety: immutable after seeding; the raw root points into `arena`.
unsafe impl Send for SyntaxParsingCache {}
unsafe impl Sync for SyntaxParsingCache {}

impl SyntaxParsingCache {
    /// Seeds a cache from the root of a previous parse and the arena that
    /// keeps it alive.
    pub fn new(root: NonNull<RawSyntax>, arena: Arc<SyntaxArena>) -> SyntaxParsingCache {
        SyntaxParsingCache {
            root,
            arena,
            edits: Vec::new(),
        }
    }

    /// Records an edit. Edits must be added sorted by position and must not
    /// overlap.
    pub fn add_edit(&mut self, edit: SourceEdit) {
        if let Some(last) = self.edits.last() {
            assert!(
                last.end <= edit.start,
                "edits must be sorted and disjoint"
            );
        }
        self.edits.push(edit);
    }

    pub fn arena(&self) -> &Arc<SyntaxArena> {
        &self.arena
    }

    /// Looks up a reusable node of `kind` at post-edit offset `new_offset`.
    pub fn lookup(&self, new_offset: usize, kind: SyntaxKind) -> Option<&RawSyntax> {
        let old_offset = self.translate_to_pre_edit_offset(new_offset)?;

        let root = unsafe { self.root.as_ref() };
        let node = self.lookup_from(root, 0, old_offset, kind);
        if let Some(node) = node {
            trace!(
                offset = new_offset,
                ?kind,
                node_id = node.node_id(),
                "incremental cache hit"
            );
        }
        node
    }

    fn lookup_from<'a>(
        &self,
        node: &'a RawSyntax,
        node_start: usize,
        position: usize,
        kind: SyntaxKind,
    ) -> Option<&'a RawSyntax> {
        if node_start == position && self.node_can_be_reused(node, node_start, kind) {
            return Some(node);
        }

        // Descend into the child spanning the position.
        let mut child_start = node_start;
        for child in node.children_ptrs() {
            let Some(child) = (unsafe { child.as_ref() }) else {
                continue;
            };
            let child_end = child_start + child.text_length();
            if child_start <= position && position < child_end {
                return self.lookup_from(child, child_start, position, kind);
            }
            child_start = child_end;
        }
        None
    }

    fn node_can_be_reused(&self, node: &RawSyntax, node_start: usize, kind: SyntaxKind) -> bool {
        if node.kind() != kind {
            return false;
        }

        // A node can also change if the edit landed directly behind it: the
        // lexer may have joined it with what follows. One byte of lookahead
        // covers that.
        let node_end = node_start + node.text_length();
        !self
            .edits
            .iter()
            .any(|edit| edit.intersects(node_start, node_end + 1))
    }

    fn translate_to_pre_edit_offset(&self, post_edit_offset: usize) -> Option<usize> {
        let mut offset = post_edit_offset;
        for edit in &self.edits {
            if edit.start > offset {
                // Remaining edits are behind the position.
                break;
            }
            if edit.start + edit.replacement_length > offset {
                // The position lies inside text an edit inserted.
                return None;
            }
            offset = offset - edit.replacement_length + edit.original_length();
        }
        Some(offset)
    }
}
