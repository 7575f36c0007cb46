//! A small, non-interactive demonstration binary for the poke execution
//! core: compiles a file or an inline expression through
//! `poke_facade::PokeCompiler` and reports the resulting value or
//! exception. There is no REPL here — that stays out of scope — so this
//! is a build/run tool, not a shell.
//!
//! Grounded on the `seqc` binary's `clap`-derive CLI shape, simplified to
//! the two operations this core actually exposes to a standalone tool:
//! compile-and-run a file, or compile-and-run a bare expression.

use clap::Parser;
use poke_facade::{DeclKind, Outcome, PokeCompiler};
use poke_runtime::PvmValue;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "pokec")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Compile and run a poke program or expression", long_about = None)]
struct Cli {
    /// Source file to compile and run.
    input: Option<PathBuf>,

    /// Compile and run `expr` as a single expression instead of reading a file.
    #[arg(short, long, conflicts_with = "input")]
    expr: Option<String>,

    /// List global declarations (vars, funcs, types) after running, then exit.
    #[arg(long)]
    list_decls: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut compiler = match PokeCompiler::headless() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("pokec: failed to start the compiler: {e}");
            return ExitCode::FAILURE;
        }
    };

    let outcome = if let Some(expr) = &cli.expr {
        compiler.compile_expression(expr)
    } else if let Some(path) = &cli.input {
        compiler.compile_file(path)
    } else {
        eprintln!("pokec: pass a source file or --expr \"<expression>\"");
        return ExitCode::FAILURE;
    };

    let result = match outcome {
        Ok(outcome) => report(outcome),
        Err(e) => {
            eprintln!("pokec: {e}");
            ExitCode::FAILURE
        }
    };

    if cli.list_decls {
        list_decls(&compiler);
    }

    result
}

fn report(outcome: Outcome) -> ExitCode {
    match outcome {
        Outcome::Value(Some(v)) => {
            println!("{}", render(&v));
            ExitCode::SUCCESS
        }
        Outcome::Value(None) => ExitCode::SUCCESS,
        Outcome::Exception(v, status) => {
            eprintln!("unhandled exception: {}", render(&v));
            ExitCode::from(status.clamp(0, 255) as u8)
        }
    }
}

fn list_decls<T: poke_facade::TermIf>(compiler: &PokeCompiler<T>) {
    for kind in [DeclKind::Var, DeclKind::Func, DeclKind::Type] {
        compiler.decl_map(kind, |d| {
            println!("{:?} {}: {}", d.kind, d.name, d.type_desc);
        });
    }
}

/// A minimal human-readable rendering for CLI output. Not the full
/// pretty-printer the executor's own `print`/`printf` statements use
/// internally (that lives in `poke-runtime::exec`, private to that
/// crate) — just enough for a demo tool to show what a program returned.
fn render(v: &PvmValue) -> String {
    match v {
        PvmValue::Int { value, .. } => value.to_string(),
        PvmValue::Uint { value, .. } => value.to_string(),
        PvmValue::Long { value, .. } => value.to_string(),
        PvmValue::Ulong { value, .. } => value.to_string(),
        PvmValue::String(s) => format!("{:?}", s.borrow()),
        _ => format!("{v:?}"),
    }
}
