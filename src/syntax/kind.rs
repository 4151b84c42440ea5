/// The kind of a raw syntax node.
///
/// The grammar itself lives in the parser; the core only needs enough kinds
/// to classify nodes, route unknown-node diagnostics, and key the
/// incremental reuse cache.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyntaxKind {
    /// A token node. Never used for layout nodes.
    Token = 0,

    SourceFile,
    CodeBlock,
    StmtList,
    ExprList,
    Condition,

    UnknownDecl,
    UnknownExpr,
    UnknownStmt,
    UnknownType,
    UnknownPattern,
}

impl SyntaxKind {
    /// True for the unknown-* kinds the syntax verifier reports.
    pub fn is_unknown(self) -> bool {
        matches!(
            self,
            SyntaxKind::UnknownDecl
                | SyntaxKind::UnknownExpr
                | SyntaxKind::UnknownStmt
                | SyntaxKind::UnknownType
                | SyntaxKind::UnknownPattern
        )
    }

    /// What the verifier calls a node of this kind in diagnostics.
    pub(crate) fn unknown_entity(self) -> Option<&'static str> {
        match self {
            SyntaxKind::UnknownDecl => Some("declaration"),
            SyntaxKind::UnknownExpr => Some("expression"),
            SyntaxKind::UnknownStmt => Some("statement"),
            SyntaxKind::UnknownType => Some("type"),
            SyntaxKind::UnknownPattern => Some("pattern"),
            _ => None,
        }
    }
}

/// The kind of a token.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Eof = 0,
    Identifier,
    IntegerLiteral,

    KwIf,
    KwElse,
    KwLet,
    KwReturn,

    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    Comma,
    Colon,
    Semicolon,
    Equal,
    Arrow,

    Unknown,
}

impl TokenKind {
    /// Canonical spelling used when synthesizing a missing token. Tokens
    /// with free-form text (identifiers, literals) have none.
    pub fn canonical_text(self) -> &'static str {
        match self {
            TokenKind::KwIf => "if",
            TokenKind::KwElse => "else",
            TokenKind::KwLet => "let",
            TokenKind::KwReturn => "return",
            TokenKind::LeftParen => "(",
            TokenKind::RightParen => ")",
            TokenKind::LeftBrace => "{",
            TokenKind::RightBrace => "}",
            TokenKind::Comma => ",",
            TokenKind::Colon => ":",
            TokenKind::Semicolon => ";",
            TokenKind::Equal => "=",
            TokenKind::Arrow => "->",
            TokenKind::Eof
            | TokenKind::Identifier
            | TokenKind::IntegerLiteral
            | TokenKind::Unknown => "",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_kinds_classify() {
        assert!(SyntaxKind::UnknownExpr.is_unknown());
        assert!(!SyntaxKind::SourceFile.is_unknown());
        assert_eq!(
            SyntaxKind::UnknownStmt.unknown_entity(),
            Some("statement")
        );
        assert_eq!(SyntaxKind::CodeBlock.unknown_entity(), None);
    }

    #[test]
    fn punctuation_has_canonical_spelling() {
        assert_eq!(TokenKind::KwIf.canonical_text(), "if");
        assert_eq!(TokenKind::Arrow.canonical_text(), "->");
        assert_eq!(TokenKind::Identifier.canonical_text(), "");
    }
}
