use crate::syntax::raw::RawSyntax;
use std::fmt;

/// Options controlling [`RawSyntax::print`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SyntaxPrintOptions {
    /// Mark nodes that are not spelled in the source (missing nodes).
    pub visual: bool,
    /// Wrap layout nodes in `<Kind>…</Kind>` markers.
    pub print_syntax_kind: bool,
    /// Also wrap token nodes in kind markers. Only meaningful together
    /// with `print_syntax_kind`.
    pub print_trivial_node_kind: bool,
}

impl RawSyntax {
    /// Prints this node recursively.
    ///
    /// With default options the output is exactly the source slice this node
    /// spans, trivia included.
    pub fn print(&self, out: &mut dyn fmt::Write, opts: SyntaxPrintOptions) -> fmt::Result {
        if self.is_token() {
            let wrap = opts.print_syntax_kind && opts.print_trivial_node_kind;
            if wrap {
                write!(out, "<{:?}>", self.token_kind())?;
            }
            if self.is_present() {
                out.write_str(self.leading_trivia())?;
                out.write_str(self.token_text())?;
                out.write_str(self.trailing_trivia())?;
            } else if opts.visual {
                write!(out, "<missing {:?}>", self.token_kind())?;
            }
            if wrap {
                write!(out, "</{:?}>", self.token_kind())?;
            }
            return Ok(());
        }

        let wrap = opts.print_syntax_kind;
        if wrap {
            write!(out, "<{:?}>", self.kind())?;
        }
        for child in self.children() {
            child.print(out, opts)?;
        }
        if wrap {
            write!(out, "</{:?}>", self.kind())?;
        }
        Ok(())
    }

    /// Renders this node as a source string with default options.
    pub fn source_text(&self) -> String {
        let mut out = String::with_capacity(self.text_length());
        self.print(&mut out, SyntaxPrintOptions::default())
            .expect("writing to a String cannot fail");
        out
    }

    /// Dumps the structural form for debugging: one child per indented
    /// line.
    pub fn dump(&self, out: &mut dyn fmt::Write, indent: usize) -> fmt::Result {
        write!(out, "{:indent$}", "", indent = indent)?;

        if self.is_token() {
            write!(out, "(Token {:?}", self.token_kind())?;
            if self.is_missing() {
                write!(out, " missing")?;
            } else {
                write!(out, " {:?}", self.token_text())?;
            }
            return write!(out, ")");
        }

        write!(out, "({:?}", self.kind())?;
        if self.is_missing() {
            write!(out, " missing")?;
        }
        for child in self.children_ptrs() {
            writeln!(out)?;
            match unsafe { child.as_ref() } {
                Some(child) => child.dump(out, indent + 2)?,
                None => write!(out, "{:indent$}(null)", "", indent = indent + 2)?,
            }
        }
        write!(out, ")")
    }

    /// The [`dump`](Self::dump) output as a string.
    pub fn dump_string(&self) -> String {
        let mut out = String::new();
        self.dump(&mut out, 0)
            .expect("writing to a String cannot fail");
        out
    }
}
