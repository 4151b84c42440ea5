use crate::syntax::arena::SyntaxArena;
use crate::syntax::cache::SyntaxParsingCache;
use crate::syntax::kind::{SyntaxKind, TokenKind};
use crate::syntax::raw::{RawSyntax, SourcePresence};
use std::ops::Range;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::debug;

/// Receiver for non-fatal problems found while verifying a realized tree.
pub trait DiagnosticSink {
    fn report(&mut self, offset: usize, message: &str);
}

/// A realized tree root: the raw root node plus the arena retention that
/// keeps it (and everything it references) alive.
pub struct SyntaxRoot {
    raw: NonNull<RawSyntax>,
    arena: Arc<SyntaxArena>,
}

// Safety: the nodes are immutable and the owned arena pins their storage.
unsafe impl Send for SyntaxRoot {}
unsafe impl Sync for SyntaxRoot {}

impl SyntaxRoot {
    pub fn raw(&self) -> &RawSyntax {
        unsafe { self.raw.as_ref() }
    }

    pub fn arena(&self) -> &Arc<SyntaxArena> {
        &self.arena
    }
}

/// Records the nodes a parser produces into raw syntax, backed by one arena
/// per source buffer.
///
/// The creator copies the source text into its arena up front and marks it
/// as the hot region, so token slices recorded against the buffer are
/// recognized as arena-resident and never copied again.
pub struct SyntaxTreeCreator {
    arena: Arc<SyntaxArena>,
    source_ptr: *const u8,
    source_len: usize,
    cache: Option<Arc<SyntaxParsingCache>>,
}

impl SyntaxTreeCreator {
    pub fn new(source: &str, cache: Option<Arc<SyntaxParsingCache>>) -> SyntaxTreeCreator {
        let arena = SyntaxArena::new();
        let resident = arena.intern_str(source);
        let (source_ptr, source_len) = (resident.as_ptr(), resident.len());
        arena.set_hot_use_region(source_ptr, unsafe { source_ptr.add(source_len) });

        SyntaxTreeCreator {
            arena,
            source_ptr,
            source_len,
            cache,
        }
    }

    pub fn arena(&self) -> &Arc<SyntaxArena> {
        &self.arena
    }

    fn source(&self) -> &str {
        // Safety: the slice was interned into our own arena at construction.
        unsafe {
            std::str::from_utf8_unchecked(std::slice::from_raw_parts(
                self.source_ptr,
                self.source_len,
            ))
        }
    }

    /// Records a token covering `range` of the source, of which the first
    /// `leading_len` and last `trailing_len` bytes are trivia.
    pub fn record_token(
        &self,
        kind: TokenKind,
        leading_len: usize,
        trailing_len: usize,
        range: Range<usize>,
    ) -> NonNull<RawSyntax> {
        let source = self.source();
        let text_range = range.start + leading_len..range.end - trailing_len;

        let leading = &source[range.start..text_range.start];
        let text = &source[text_range.clone()];
        let trailing = &source[text_range.end..range.end];

        RawSyntax::token_with_length(
            kind,
            text,
            leading,
            trailing,
            range.len(),
            SourcePresence::Present,
            &self.arena,
            None,
        )
    }

    /// Records a token the parser expected at `offset` but did not find.
    pub fn record_missing_token(&self, kind: TokenKind, offset: usize) -> NonNull<RawSyntax> {
        debug!(?kind, offset, "recording missing token");
        RawSyntax::missing_token(kind, &self.arena, None)
    }

    /// Records a layout node over already recorded children; null entries
    /// mark absent slots.
    pub fn record_raw_syntax(
        &self,
        kind: SyntaxKind,
        children: &[*const RawSyntax],
    ) -> NonNull<RawSyntax> {
        RawSyntax::layout(kind, children, SourcePresence::Present, &self.arena, None)
    }

    /// Consults the incremental cache for a reusable node of `kind` at
    /// `offset`. On a hit, returns how many bytes the parser may skip and
    /// the reused node, whose arena is retained as a child of ours.
    pub fn lookup_node(
        &self,
        offset: usize,
        kind: SyntaxKind,
    ) -> Option<(usize, NonNull<RawSyntax>)> {
        let cache = self.cache.as_ref()?;
        let node = cache.lookup(offset, kind)?;

        // The reused node lives in the old tree's arena; keep that arena
        // alive for as long as the new tree's.
        self.arena.add_child_arena(cache.arena());
        Some((node.text_length(), NonNull::from(node)))
    }

    /// Finalizes a parse: wraps the root with the arena retention and, when
    /// a sink is provided, verifies the tree, reporting unknown-kind nodes.
    /// Verification is non-fatal.
    pub fn realize_syntax_root(
        &self,
        root: NonNull<RawSyntax>,
        diagnostics: Option<&mut dyn DiagnosticSink>,
    ) -> SyntaxRoot {
        if let Some(sink) = diagnostics {
            verify(unsafe { root.as_ref() }, 0, sink);
        }
        SyntaxRoot {
            raw: root,
            arena: Arc::clone(&self.arena),
        }
    }
}

/// Walks the tree reporting unknown-kind nodes with their absolute offsets.
fn verify(node: &RawSyntax, offset: usize, sink: &mut dyn DiagnosticSink) {
    if let Some(entity) = node.kind().unknown_entity() {
        sink.report(offset, &format!("unknown {entity} syntax"));
    }

    let mut child_offset = offset;
    for child in node.children_ptrs() {
        let Some(child) = (unsafe { child.as_ref() }) else {
            continue;
        };
        verify(child, child_offset, sink);
        child_offset += child.text_length();
    }
}
