#![allow(unsafe_op_in_unsafe_fn)]

use crate::syntax::arena::SyntaxArena;
use crate::syntax::kind::{SyntaxKind, TokenKind};
use smallvec::SmallVec;
use std::fmt;
use std::mem;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// An ID of a node that is stable across incremental reparses.
pub type NodeId = u32;

/// The ID used for the next node created without a manually specified one.
static NEXT_FREE_NODE_ID: AtomicU32 = AtomicU32::new(0);

fn assign_node_id(requested: Option<NodeId>) -> NodeId {
    match requested {
        Some(id) => {
            // The caller owns this ID; the counter just has to stay ahead.
            NEXT_FREE_NODE_ID.fetch_max(id + 1, Ordering::Relaxed);
            id
        }
        None => NEXT_FREE_NODE_ID.fetch_add(1, Ordering::Relaxed),
    }
}

/// Whether a node was found or written in the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourcePresence {
    /// Authored and found, or generated.
    Present,
    /// Expected or optional, but not found in the source.
    Missing,
}

const FLAG_PRESENT: u8 = 1 << 0;
const FLAG_IS_TOKEN: u8 = 1 << 1;

#[repr(C)]
#[derive(Clone, Copy)]
struct TokenPayload {
    leading_ptr: *const u8,
    text_ptr: *const u8,
    trailing_ptr: *const u8,
    leading_len: u32,
    text_len: u32,
    trailing_len: u32,
    kind: TokenKind,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct LayoutPayload {
    num_children: u32,
    /// Number of transitive children of this node, not counting itself.
    total_sub_node_count: u32,
    kind: SyntaxKind,
}

#[repr(C)]
#[derive(Clone, Copy)]
union Payload {
    token: TokenPayload,
    layout: LayoutPayload,
}

/// The strictly immutable, structurally shared backbone node of a syntax
/// tree: either a token or a layout node over ordered children.
///
/// Nodes are allocated inside a [`SyntaxArena`] — layout nodes with a
/// trailing array of child pointers — and never freed individually. A node
/// does **not** retain its arena; holders of a tree keep the root arena
/// alive, and cross-arena child references are covered by child-arena
/// retention at construction time.
#[repr(C)]
pub struct RawSyntax {
    node_id: NodeId,
    /// Bytes this node takes up spelled out in the source. Always 0 for
    /// missing nodes.
    text_length: u32,
    arena: *const SyntaxArena,
    flags: u8,
    payload: Payload,
}

// Safety: nodes are immutable after construction and the arena outlives all
// published references by contract.
unsafe impl Send for RawSyntax {}
unsafe impl Sync for RawSyntax {}

impl RawSyntax {
    // ==== Factories ========================================================

    /// Makes a token node, computing its text length.
    pub fn token(
        kind: TokenKind,
        text: &str,
        leading_trivia: &str,
        trailing_trivia: &str,
        presence: SourcePresence,
        arena: &Arc<SyntaxArena>,
        node_id: Option<NodeId>,
    ) -> NonNull<RawSyntax> {
        let text_length = match presence {
            SourcePresence::Missing => 0,
            SourcePresence::Present => leading_trivia.len() + text.len() + trailing_trivia.len(),
        };
        Self::token_with_length(
            kind,
            text,
            leading_trivia,
            trailing_trivia,
            text_length,
            presence,
            arena,
            node_id,
        )
    }

    /// Makes a token node with a caller-computed text length.
    #[allow(clippy::too_many_arguments)]
    pub fn token_with_length(
        kind: TokenKind,
        text: &str,
        leading_trivia: &str,
        trailing_trivia: &str,
        text_length: usize,
        presence: SourcePresence,
        arena: &Arc<SyntaxArena>,
        node_id: Option<NodeId>,
    ) -> NonNull<RawSyntax> {
        match presence {
            SourcePresence::Missing => debug_assert_eq!(text_length, 0),
            SourcePresence::Present => debug_assert_eq!(
                text_length,
                leading_trivia.len() + text.len() + trailing_trivia.len()
            ),
        }

        let leading = arena.intern_str(leading_trivia);
        let text = arena.intern_str(text);
        let trailing = arena.intern_str(trailing_trivia);

        let node = Self::allocate(arena, 0);
        unsafe {
            node.write(RawSyntax {
                node_id: assign_node_id(node_id),
                text_length: text_length as u32,
                arena: Arc::as_ptr(arena),
                flags: FLAG_IS_TOKEN | presence_flag(presence),
                payload: Payload {
                    token: TokenPayload {
                        leading_ptr: leading.as_ptr(),
                        text_ptr: text.as_ptr(),
                        trailing_ptr: trailing.as_ptr(),
                        leading_len: leading.len() as u32,
                        text_len: text.len() as u32,
                        trailing_len: trailing.len() as u32,
                        kind,
                    },
                },
            });
        }
        node
    }

    /// Makes a missing token node with the kind's canonical spelling.
    pub fn missing_token(
        kind: TokenKind,
        arena: &Arc<SyntaxArena>,
        node_id: Option<NodeId>,
    ) -> NonNull<RawSyntax> {
        Self::token_with_length(
            kind,
            kind.canonical_text(),
            "",
            "",
            0,
            SourcePresence::Missing,
            arena,
            node_id,
        )
    }

    /// Makes a layout node, computing its text length from the children.
    pub fn layout(
        kind: SyntaxKind,
        children: &[*const RawSyntax],
        presence: SourcePresence,
        arena: &Arc<SyntaxArena>,
        node_id: Option<NodeId>,
    ) -> NonNull<RawSyntax> {
        let text_length = children
            .iter()
            .map(|&child| {
                if child.is_null() {
                    0
                } else {
                    unsafe { (*child).text_length() }
                }
            })
            .sum();
        Self::layout_with_length(kind, children, text_length, presence, arena, node_id)
    }

    /// Makes a layout node with a caller-computed aggregate text length.
    pub fn layout_with_length(
        kind: SyntaxKind,
        children: &[*const RawSyntax],
        text_length: usize,
        presence: SourcePresence,
        arena: &Arc<SyntaxArena>,
        node_id: Option<NodeId>,
    ) -> NonNull<RawSyntax> {
        assert!(
            kind != SyntaxKind::Token,
            "token nodes have a dedicated constructor"
        );

        let mut total_sub_node_count: u32 = 0;
        for &child in children {
            if child.is_null() {
                continue;
            }
            unsafe {
                total_sub_node_count += (*child).total_sub_node_count() as u32 + 1;
                // A child stored in a different arena has to stay alive as
                // long as this node's arena is alive.
                arena.add_child_arena_raw((*child).arena);
            }
        }

        let node = Self::allocate(arena, children.len());
        unsafe {
            node.write(RawSyntax {
                node_id: assign_node_id(node_id),
                text_length: text_length as u32,
                arena: Arc::as_ptr(arena),
                flags: presence_flag(presence),
                payload: Payload {
                    layout: LayoutPayload {
                        num_children: children.len() as u32,
                        total_sub_node_count,
                        kind,
                    },
                },
            });
            std::ptr::copy_nonoverlapping(
                children.as_ptr(),
                Self::trailing_children(node),
                children.len(),
            );
        }
        node
    }

    /// Makes a missing layout node.
    pub fn missing_layout(
        kind: SyntaxKind,
        arena: &Arc<SyntaxArena>,
        node_id: Option<NodeId>,
    ) -> NonNull<RawSyntax> {
        Self::layout_with_length(kind, &[], 0, SourcePresence::Missing, arena, node_id)
    }

    fn allocate(arena: &Arc<SyntaxArena>, num_children: usize) -> NonNull<RawSyntax> {
        let size = mem::size_of::<RawSyntax>() + num_children * mem::size_of::<*const RawSyntax>();
        arena.allocate(size, mem::align_of::<RawSyntax>()).cast()
    }

    unsafe fn trailing_children(node: NonNull<RawSyntax>) -> *mut *const RawSyntax {
        node.as_ptr().add(1).cast()
    }

    // ==== Common accessors =================================================

    /// An ID for this node that is stable across incremental parses.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Bytes this node takes when spelled out, trivia included.
    pub fn text_length(&self) -> usize {
        self.text_length as usize
    }

    pub fn presence(&self) -> SourcePresence {
        if self.flags & FLAG_PRESENT != 0 {
            SourcePresence::Present
        } else {
            SourcePresence::Missing
        }
    }

    pub fn is_missing(&self) -> bool {
        self.presence() == SourcePresence::Missing
    }

    pub fn is_present(&self) -> bool {
        self.presence() == SourcePresence::Present
    }

    pub fn is_token(&self) -> bool {
        self.flags & FLAG_IS_TOKEN != 0
    }

    pub fn kind(&self) -> SyntaxKind {
        if self.is_token() {
            SyntaxKind::Token
        } else {
            unsafe { self.payload.layout.kind }
        }
    }

    /// The arena this node was allocated in, as an owning handle. The node
    /// itself never holds one.
    pub fn arena(&self) -> Arc<SyntaxArena> {
        unsafe { SyntaxArena::handle_from_raw(self.arena) }
    }

    pub(crate) fn arena_ptr(&self) -> *const SyntaxArena {
        self.arena
    }

    // ==== Token accessors ==================================================

    fn token_payload(&self) -> &TokenPayload {
        assert!(self.is_token(), "not a token node");
        unsafe { &self.payload.token }
    }

    pub fn token_kind(&self) -> TokenKind {
        self.token_payload().kind
    }

    pub fn token_text(&self) -> &str {
        let token = self.token_payload();
        unsafe { str_from_parts(token.text_ptr, token.text_len) }
    }

    pub fn leading_trivia(&self) -> &str {
        let token = self.token_payload();
        unsafe { str_from_parts(token.leading_ptr, token.leading_len) }
    }

    pub fn trailing_trivia(&self) -> &str {
        let token = self.token_payload();
        unsafe { str_from_parts(token.trailing_ptr, token.trailing_len) }
    }

    // ==== Layout accessors =================================================

    pub fn num_children(&self) -> usize {
        if self.is_token() {
            0
        } else {
            unsafe { self.payload.layout.num_children as usize }
        }
    }

    /// Number of transitive children; the node itself is not counted.
    pub fn total_sub_node_count(&self) -> usize {
        if self.is_token() {
            0
        } else {
            unsafe { self.payload.layout.total_sub_node_count as usize }
        }
    }

    /// Number of nodes in the subtree spanned by this node, itself included.
    pub fn total_nodes(&self) -> usize {
        self.total_sub_node_count() + 1
    }

    /// The raw child pointer slice; entries may be null for absent slots.
    pub fn children_ptrs(&self) -> &[*const RawSyntax] {
        if self.is_token() {
            return &[];
        }
        unsafe {
            let first = (self as *const RawSyntax).add(1).cast::<*const RawSyntax>();
            std::slice::from_raw_parts(first, self.num_children())
        }
    }

    /// The child at `index`, if that slot is occupied.
    pub fn child(&self, index: usize) -> Option<&RawSyntax> {
        let ptr = *self
            .children_ptrs()
            .get(index)
            .expect("child index out of bounds");
        // Safety: children live at least as long as this node's arena, per
        // the child-arena retention done at construction.
        unsafe { ptr.as_ref() }
    }

    /// Iterates over occupied child slots.
    pub fn children(&self) -> impl Iterator<Item = &RawSyntax> {
        self.children_ptrs()
            .iter()
            .filter_map(|&ptr| unsafe { ptr.as_ref() })
    }

    // ==== Transforms =======================================================
    //
    // All transforms build a new node in this node's arena; nodes are never
    // mutated in place.

    /// A token like this one, but with the given leading trivia.
    pub fn with_leading_trivia(&self, leading_trivia: &str) -> NonNull<RawSyntax> {
        Self::token(
            self.token_kind(),
            self.token_text(),
            leading_trivia,
            self.trailing_trivia(),
            self.presence(),
            &self.arena(),
            None,
        )
    }

    /// A token like this one, but with the given trailing trivia.
    pub fn with_trailing_trivia(&self, trailing_trivia: &str) -> NonNull<RawSyntax> {
        Self::token(
            self.token_kind(),
            self.token_text(),
            self.leading_trivia(),
            trailing_trivia,
            self.presence(),
            &self.arena(),
            None,
        )
    }

    /// A layout node like this one with `child` appended.
    pub fn append_child(&self, child: *const RawSyntax) -> NonNull<RawSyntax> {
        assert!(!self.is_token(), "cannot append a child to a token");
        let mut children: SmallVec<[*const RawSyntax; 8]> =
            SmallVec::from_slice(self.children_ptrs());
        children.push(child);
        Self::layout(self.kind(), &children, self.presence(), &self.arena(), None)
    }

    /// A layout node like this one with the child at `index` replaced.
    pub fn replace_child_at(&self, index: usize, child: *const RawSyntax) -> NonNull<RawSyntax> {
        assert!(!self.is_token(), "cannot replace a child of a token");
        let mut children: SmallVec<[*const RawSyntax; 8]> =
            SmallVec::from_slice(self.children_ptrs());
        children[index] = child;
        Self::layout(self.kind(), &children, self.presence(), &self.arena(), None)
    }
}

impl fmt::Debug for RawSyntax {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_token() {
            f.debug_struct("RawSyntax")
                .field("node_id", &self.node_id)
                .field("token_kind", &self.token_kind())
                .field("text", &self.token_text())
                .finish_non_exhaustive()
        } else {
            f.debug_struct("RawSyntax")
                .field("node_id", &self.node_id)
                .field("kind", &self.kind())
                .field("num_children", &self.num_children())
                .finish_non_exhaustive()
        }
    }
}

fn presence_flag(presence: SourcePresence) -> u8 {
    match presence {
        SourcePresence::Present => FLAG_PRESENT,
        SourcePresence::Missing => 0,
    }
}

unsafe fn str_from_parts<'a>(ptr: *const u8, len: u32) -> &'a str {
    if len == 0 {
        return "";
    }
    std::str::from_utf8_unchecked(std::slice::from_raw_parts(ptr, len as usize))
}
