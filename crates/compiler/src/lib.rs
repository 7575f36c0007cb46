//! Incremental compiler front/middle-end for the poke execution core:
//! lexer, recursive-descent parser, a fixed sequence of typing/analysis
//! passes, and a code generator that lowers a typed AST straight to a
//! flat [`poke_runtime::PvmProgram`].
//!
//! The three parse entry points (`parse_program`, `parse_statement`,
//! `parse_expression`) and their matching `codegen::compile_*` functions
//! mirror libpoke's three incremental-compilation modes: a whole
//! compilation unit, a single statement typed at a prompt, and a bare
//! expression whose value is wanted back.

pub mod ast;
pub mod codegen;
pub mod lexer;
pub mod parser;
pub mod passes;
pub mod typecheck;

pub use ast::{Ast, NodeId};
pub use codegen::GlobalEnv;
pub use parser::{parse_expression, parse_program, parse_statement, ParseError};
pub use passes::{CompileError, PassContext};
pub use typecheck::run_all;

use poke_runtime::PvmProgram;
use tracing::{debug, instrument};

/// Either stage of compilation can fail: tokenizing/parsing the source, or
/// the fixed sequence of typing/analysis/codegen passes over its AST.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CompilerError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Compile(#[from] CompileError),
}

/// Compiles a whole compilation unit to a runnable program.
#[instrument(skip(src))]
pub fn compile_program(src: &str) -> Result<PvmProgram, CompilerError> {
    let (mut ast, root) = parse_program(src)?;
    let ctx = run_all(&mut ast, root)?;
    if let Some(first) = ctx.errors.first() {
        return Err(CompilerError::Compile(first.clone()));
    }
    debug!(nodes = ast.node_count(), warnings = ctx.warnings.len(), "typecheck complete");
    Ok(codegen::compile_program(&ast, root)?)
}

/// Compiles a single statement, for incremental/REPL-style use.
#[instrument(skip(src))]
pub fn compile_statement(src: &str) -> Result<PvmProgram, CompilerError> {
    let (mut ast, root) = parse_statement(src)?;
    let ctx = run_all(&mut ast, root)?;
    if let Some(first) = ctx.errors.first() {
        return Err(CompilerError::Compile(first.clone()));
    }
    Ok(codegen::compile_statement(&ast, root)?)
}

/// Compiles a single expression, leaving its value as the program's
/// result.
#[instrument(skip(src))]
pub fn compile_expression(src: &str) -> Result<PvmProgram, CompilerError> {
    let (mut ast, root) = parse_expression(src)?;
    let ctx = run_all(&mut ast, root)?;
    if let Some(first) = ctx.errors.first() {
        return Err(CompilerError::Compile(first.clone()));
    }
    Ok(codegen::compile_expression(&ast, root)?)
}

/// Incremental form of [`compile_program`]: resolves identifiers against
/// `globals` (accumulated from prior calls) and returns the names this
/// compilation itself declared, for the caller to fold in before the next
/// call. Used by `poke_facade::PokeCompiler` to give successive
/// `compile_buffer`/`compile_statement` calls a shared global namespace.
pub fn compile_program_incremental(
    src: &str,
    globals: &codegen::GlobalEnv,
) -> Result<(PvmProgram, codegen::GlobalEnv, Vec<CompileError>), CompilerError> {
    let (mut ast, root) = parse_program(src)?;
    let ctx = run_all(&mut ast, root)?;
    if let Some(first) = ctx.errors.first() {
        return Err(CompilerError::Compile(first.clone()));
    }
    let (program, globals) = codegen::compile_program_incremental(&ast, root, globals)?;
    Ok((program, globals, ctx.warnings))
}

/// Incremental form of [`compile_statement`]; see
/// [`compile_program_incremental`].
pub fn compile_statement_incremental(
    src: &str,
    globals: &codegen::GlobalEnv,
) -> Result<(PvmProgram, codegen::GlobalEnv, Vec<CompileError>), CompilerError> {
    let (mut ast, root) = parse_statement(src)?;
    let ctx = run_all(&mut ast, root)?;
    if let Some(first) = ctx.errors.first() {
        return Err(CompilerError::Compile(first.clone()));
    }
    let (program, globals) = codegen::compile_statement_incremental(&ast, root, globals)?;
    Ok((program, globals, ctx.warnings))
}

/// Incremental form of [`compile_expression`]; see
/// [`compile_program_incremental`].
pub fn compile_expression_incremental(
    src: &str,
    globals: &codegen::GlobalEnv,
) -> Result<(PvmProgram, codegen::GlobalEnv, Vec<CompileError>), CompilerError> {
    let (mut ast, root) = parse_expression(src)?;
    let ctx = run_all(&mut ast, root)?;
    if let Some(first) = ctx.errors.first() {
        return Err(CompilerError::Compile(first.clone()));
    }
    let (program, globals) = codegen::compile_expression_incremental(&ast, root, globals)?;
    Ok((program, globals, ctx.warnings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use poke_runtime::{Pvm, RunOutcome};
    use std::rc::Rc;

    #[test]
    fn compiles_and_runs_a_program() {
        let program = compile_program("var x = 1 + 2; print x;").unwrap();
        let mut pvm = Pvm::new();
        let outcome = pvm.run(Rc::new(program), 0, Vec::new());
        assert!(matches!(outcome, RunOutcome::Completed(_)));
    }

    #[test]
    fn reports_parse_errors() {
        let err = compile_program("var = ;").unwrap_err();
        assert!(matches!(err, CompilerError::Parse(_)));
    }

    #[test]
    fn reports_undeclared_variable_as_compile_error() {
        let err = compile_expression("nonexistent_name").unwrap_err();
        assert!(matches!(err, CompilerError::Compile(_)));
    }
}
