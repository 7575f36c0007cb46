//! Error surface for the embedding API. Covers failures of the compiler
//! or the host's own requests (a bad path, an unknown declaration); a
//! raised-but-uncaught PVM exception is not one of these (see the note
//! on [`PokeError`] below).

use poke_runtime::IosError;

/// An uncaught PVM exception is not modeled here: it is not a failure of
/// the compiler or host, just another value a compiled program can
/// produce, so `compile_*`/`call` return it as
/// [`crate::Outcome::Exception`] inside `Ok`, not as an `Err` of this type.
#[derive(Debug, thiserror::Error)]
pub enum PokeError {
    #[error(transparent)]
    Compile(#[from] poke_compiler::CompilerError),

    #[error(transparent)]
    Ios(#[from] IosError),

    #[error("could not read {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("`{0}` is not declared")]
    NoSuchDecl(String),

    #[error("value is not a closure")]
    NotAClosure,

    #[error("no module named `{0}` found on the load path")]
    ModuleNotFound(String),

    #[error("native disassembly is not supported by this implementation")]
    Unsupported,
}
