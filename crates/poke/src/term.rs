//! The terminal affordance surface a host gives a [`crate::PokeCompiler`]:
//! the façade never writes directly to a TTY itself, it calls back into
//! whatever `TermIf` the host supplied at [`crate::PokeCompiler::new`]
//! time.
//!
//! Grounded on `libpoke.h`'s `pk_term_if` function-pointer table; here it is
//! a plain trait object rather than nine raw function pointers.

/// Host-supplied terminal callbacks. A CLI host implements this over real
/// ANSI escapes and a TTY; an embedding host (an editor, a test harness)
/// can implement it over a string buffer or simply no-op the decorative
/// calls.
pub trait TermIf {
    /// Flush any buffered output.
    fn flush(&mut self);
    /// Write `text` verbatim.
    fn puts(&mut self, text: &str);
    /// Write a single already-formatted line (callers build the string;
    /// this trait has no `printf`-style varargs of its own).
    fn printf(&mut self, text: &str);
    /// Adjust the current indentation by `step` at nesting `level`.
    fn indent(&mut self, level: u32, step: u32);
    /// Begin a named output class (used by poke's pretty-printer to tag
    /// spans for a host's syntax highlighter).
    fn class(&mut self, name: &str);
    /// End the named output class most recently opened.
    fn end_class(&mut self, name: &str);
    /// Begin a hyperlink (e.g. to a map source) wrapping following output.
    fn hyperlink(&mut self, url: &str, id: &str);
    /// End the most recently opened hyperlink.
    fn end_hyperlink(&mut self);

    /// Current foreground color, if the host tracks one.
    fn color(&self) -> Option<(u8, u8, u8)> {
        None
    }
    /// Current background color, if the host tracks one.
    fn bgcolor(&self) -> Option<(u8, u8, u8)> {
        None
    }
    fn set_color(&mut self, _rgb: (u8, u8, u8)) {}
    fn set_bgcolor(&mut self, _rgb: (u8, u8, u8)) {}
}

/// A `TermIf` that discards everything; the default for hosts that don't
/// care about decorative output (used by `PokeCompiler::new` callers who
/// just want `compile_expression`/`call` results).
#[derive(Debug, Default)]
pub struct NullTerm;

impl TermIf for NullTerm {
    fn flush(&mut self) {}
    fn puts(&mut self, _text: &str) {}
    fn printf(&mut self, _text: &str) {}
    fn indent(&mut self, _level: u32, _step: u32) {}
    fn class(&mut self, _name: &str) {}
    fn end_class(&mut self, _name: &str) {}
    fn hyperlink(&mut self, _url: &str, _id: &str) {}
    fn end_hyperlink(&mut self) {}
}
