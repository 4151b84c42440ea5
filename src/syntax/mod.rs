//! The immutable raw syntax tree: arena-allocated, structurally shared
//! nodes with stable identity across incremental reparses.

// Public API
mod arena;
pub use self::arena::SyntaxArena;

mod cache;
pub use self::cache::{SourceEdit, SyntaxParsingCache};

mod kind;
pub use self::kind::{SyntaxKind, TokenKind};

mod print;
pub use self::print::SyntaxPrintOptions;

mod raw;
pub use self::raw::{NodeId, RawSyntax, SourcePresence};

mod tree_creator;
pub use self::tree_creator::{DiagnosticSink, SyntaxRoot, SyntaxTreeCreator};

#[cfg(test)]
mod tests;
