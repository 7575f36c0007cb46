//! Embedding API for the poke execution core: a single opaque handle —
//! [`PokeCompiler`] — bundling the PVM, the incremental compiler driver,
//! and transient completion-helper state. This is the only stable surface
//! a host program touches; everything in `poke-compiler`/`poke-runtime`
//! is an implementation detail reachable only through here.
//!
//! Grounded on `libpoke.h`'s `pk_compiler` handle and its flat C function
//! surface, reshaped into a `seq-runtime`-style "one struct,
//! method-per-operation" embedding API, the same shape a top-level engine
//! handle takes for any interpreted language.

pub mod completion;
pub mod decl;
pub mod disasm;
pub mod error;
pub mod report;
pub mod term;

pub use completion::Completion;
pub use decl::{DeclInfo, DeclKind};
pub use error::PokeError;
pub use term::{NullTerm, TermIf};

use poke_compiler::GlobalEnv;
use poke_runtime::{
    Endian, Iod, IosFlags, IosId, NegEncoding, OutputMode, Pvm, PvmProgram, PvmValue, RunOutcome,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, instrument};

const BOOTSTRAP_SOURCE: &str = include_str!("../resources/bootstrap.pk");

/// Construction-time tunables for `new(term_if, flags)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Flags {
    /// Skip loading the bootstrap runtime-support module. Exists for
    /// tests that want a bare compiler with no pre-declared `Exception`
    /// type to assert against.
    pub skip_std_types: bool,
}

/// The result of a successful `compile_*`/`call` operation: either the
/// program ran to completion (with an optional value, for an expression
/// statement or a function call) or it raised, in which case the caller
/// gets the exception value and exit status instead of an error — a
/// raised exception is not a failure of the *compiler*, just a value the
/// program produced.
#[derive(Debug)]
pub enum Outcome {
    Value(Option<PvmValue>),
    Exception(PvmValue, i32),
}

/// One opaque compiler/PVM handle. `T` is the host's terminal
/// implementation; `Send` but not `Sync` — this falls out for free since
/// nothing here uses interior-mutability-across-threads primitives, but
/// it is worth stating as a documented property rather than an accident.
pub struct PokeCompiler<T: TermIf> {
    pvm: Pvm,
    globals: GlobalEnv,
    term: T,
    flags: Flags,
    decls: decl::DeclTable,
    known_types: HashSet<String>,
    loaded_modules: HashSet<PathBuf>,
    load_path: Vec<PathBuf>,
    warnings: Vec<poke_compiler::CompileError>,
}

impl PokeCompiler<NullTerm> {
    /// Convenience constructor for hosts that don't care about terminal
    /// decoration (tests, `decl_val`-only embedders).
    pub fn headless() -> Result<Self, PokeError> {
        Self::new(NullTerm, Flags::default())
    }
}

impl<T: TermIf> PokeCompiler<T> {
    #[instrument(skip(term_if))]
    pub fn new(term_if: T, flags: Flags) -> Result<Self, PokeError> {
        let mut c = PokeCompiler {
            pvm: Pvm::new(),
            globals: GlobalEnv::default(),
            term: term_if,
            flags,
            decls: decl::DeclTable::default(),
            known_types: HashSet::new(),
            loaded_modules: HashSet::new(),
            load_path: vec![PathBuf::from(".")],
            warnings: Vec::new(),
        };
        if !flags.skip_std_types {
            c.compile_and_run_buffer(BOOTSTRAP_SOURCE, CompileMode::Program)?;
        }
        Ok(c)
    }

    /// `free(c)` has no analogue here: dropping the handle releases
    /// everything (the PVM's `Environment`, its loaded IO spaces, its
    /// compiled programs) through ordinary `Drop`.
    pub fn term_mut(&mut self) -> &mut T {
        &mut self.term
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    fn after_compile(&mut self, globals: GlobalEnv) {
        self.globals = globals;
        let generation = self.globals.generations.len() - 1;
        let func_sigs = &self.globals.func_sigs;
        let names = self.globals.generations[generation].clone();
        self.decls
            .record_generation(generation, &names, |n| func_sigs.contains_key(n));
        self.decls.record_types(self.globals.named_types.keys());
        for name in self.globals.named_types.keys() {
            self.known_types.insert(name.clone());
        }
    }

    fn run_program(&mut self, program: PvmProgram) -> Outcome {
        let outcome = self.pvm.run(Rc::new(program), 0, Vec::new());
        match outcome {
            RunOutcome::Completed(v) => Outcome::Value(v),
            RunOutcome::Exception(v, status) => Outcome::Exception(v, status),
        }
    }

    fn compile_and_run_buffer(&mut self, src: &str, mode: CompileMode) -> Result<Outcome, PokeError> {
        let (program, globals, warnings) = match mode {
            CompileMode::Program => poke_compiler::compile_program_incremental(src, &self.globals)?,
            CompileMode::Statement => poke_compiler::compile_statement_incremental(src, &self.globals)?,
            CompileMode::Expression => poke_compiler::compile_expression_incremental(src, &self.globals)?,
        };
        self.warnings = warnings;
        self.after_compile(globals);
        Ok(self.run_program(program))
    }

    /// Non-fatal diagnostics recorded by the most recent `compile_*` call.
    /// Feeds `report::dump_human`/`report::dump_json`; empty until the
    /// first successful compile.
    pub fn warnings(&self) -> &[poke_compiler::CompileError] {
        &self.warnings
    }

    /// `compile_file(c, path)`.
    #[instrument(skip(self))]
    pub fn compile_file(&mut self, path: impl AsRef<Path>) -> Result<Outcome, PokeError> {
        let path = path.as_ref();
        let src = std::fs::read_to_string(path).map_err(|source| PokeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.compile_and_run_buffer(&src, CompileMode::Program)
    }

    /// `compile_buffer(c, buf)`.
    pub fn compile_buffer(&mut self, src: &str) -> Result<Outcome, PokeError> {
        self.compile_and_run_buffer(src, CompileMode::Program)
    }

    /// `compile_statement(c, buf)`.
    pub fn compile_statement(&mut self, src: &str) -> Result<Outcome, PokeError> {
        self.compile_and_run_buffer(src, CompileMode::Statement)
    }

    /// `compile_expression(c, buf)`.
    pub fn compile_expression(&mut self, src: &str) -> Result<Outcome, PokeError> {
        self.compile_and_run_buffer(src, CompileMode::Expression)
    }

    /// `load(c, module)`: resolves `module` (a bare name, `.pk` appended)
    /// against the load path, compiles it, and remembers the resolved
    /// path so a repeat `load` of the same module is a no-op.
    #[instrument(skip(self))]
    pub fn load(&mut self, module: &str) -> Result<(), PokeError> {
        for dir in self.load_path.clone() {
            let candidate = dir.join(format!("{module}.pk"));
            if candidate.is_file() {
                let resolved = candidate.canonicalize().unwrap_or(candidate.clone());
                if self.loaded_modules.contains(&resolved) {
                    debug!(module, "already loaded, skipping");
                    return Ok(());
                }
                self.compile_file(&candidate)?;
                self.loaded_modules.insert(resolved);
                return Ok(());
            }
        }
        Err(PokeError::ModuleNotFound(module.to_string()))
    }

    pub fn add_load_path(&mut self, dir: impl Into<PathBuf>) {
        self.load_path.push(dir.into());
    }

    /// `disassemble_expression(c, src, native)`.
    pub fn disassemble_expression(&self, src: &str, native: bool) -> Result<String, PokeError> {
        if native {
            return Err(PokeError::Unsupported);
        }
        let (program, ..) = poke_compiler::compile_expression_incremental(src, &self.globals)?;
        Ok(disasm::disassemble(&program))
    }

    /// `disassemble_function(c, name, native)`.
    pub fn disassemble_function(&self, name: &str, native: bool) -> Result<String, PokeError> {
        if native {
            return Err(PokeError::Unsupported);
        }
        let slot = self
            .decls
            .slots
            .get(name)
            .filter(|s| s.is_func)
            .ok_or_else(|| PokeError::NoSuchDecl(name.to_string()))?;
        let back = self.back_for(slot.generation);
        let value = self
            .pvm
            .env
            .lookup(back, slot.over)
            .map_err(|_| PokeError::NoSuchDecl(name.to_string()))?;
        let PvmValue::Closure(closure) = value else {
            return Err(PokeError::NotAClosure);
        };
        Ok(disasm::disassemble_from(&closure.program, closure.entry_point))
    }

    /// `back` distance from the PVM's current frame to
    /// the frame that generation `generation` registered its declarations
    /// into. `self.globals.generations` has one entry per `Pvm::run` call
    /// made so far, including the anonymous entries `call()` pushes for
    /// its own never-popped frame, so this is just the distance between
    /// indices.
    fn back_for(&self, generation: usize) -> u32 {
        (self.globals.generations.len() - generation - 1) as u32
    }

    /// `decl_p(c, name, kind)`.
    pub fn decl_p(&self, name: &str, kind: DeclKind) -> bool {
        match kind {
            DeclKind::Type => self.known_types.contains(name),
            DeclKind::Var => self.decls.slots.get(name).is_some_and(|s| !s.is_func),
            DeclKind::Func => self.decls.slots.get(name).is_some_and(|s| s.is_func),
        }
    }

    /// `decl_val(c, name)`.
    pub fn decl_val(&self, name: &str) -> Result<PvmValue, PokeError> {
        if let Some(slot) = self.decls.slots.get(name) {
            let back = self.back_for(slot.generation);
            return self
                .pvm
                .env
                .lookup(back, slot.over)
                .map_err(|_| PokeError::NoSuchDecl(name.to_string()));
        }
        if let Some(ty) = self.globals.named_types.get(name) {
            return Ok(PvmValue::Type(ty.clone()));
        }
        Err(PokeError::NoSuchDecl(name.to_string()))
    }

    /// `decl_set_val(c, name, v)`.
    pub fn decl_set_val(&mut self, name: &str, value: PvmValue) -> Result<(), PokeError> {
        let slot = *self
            .decls
            .slots
            .get(name)
            .ok_or_else(|| PokeError::NoSuchDecl(name.to_string()))?;
        let back = self.back_for(slot.generation);
        self.pvm
            .env
            .set(back, slot.over, value)
            .map_err(|_| PokeError::NoSuchDecl(name.to_string()))
    }

    /// `defvar(c, name, v)`: declares a brand-new global and binds it to
    /// `v` in one step, the host-API equivalent of `var name = v;` typed
    /// at a prompt.
    pub fn defvar(&mut self, name: &str, value: PvmValue) -> Result<(), PokeError> {
        self.pvm.env.push_frame(1);
        self.pvm.env.register(value);
        let generation = self.globals.generations.len();
        self.globals.generations.push(vec![name.to_string()]);
        self.decls.record_generation(generation, &[name.to_string()], |_| false);
        Ok(())
    }

    /// `decl_map(c, kind, handler)`: `handler` is called once per
    /// declaration of `kind`, in declaration order.
    pub fn decl_map(&self, kind: DeclKind, mut handler: impl FnMut(DeclInfo)) {
        match kind {
            DeclKind::Type => {
                for name in &self.decls.type_order {
                    let Some(ty) = self.globals.named_types.get(name) else { continue };
                    handler(DeclInfo {
                        kind: DeclKind::Type,
                        name: name.clone(),
                        type_desc: decl::describe_type(ty),
                    });
                }
            }
            DeclKind::Var | DeclKind::Func => {
                for name in &self.decls.decl_order {
                    let Some(slot) = self.decls.slots.get(name) else { continue };
                    let is_func = slot.is_func;
                    if (kind == DeclKind::Func) != is_func {
                        continue;
                    }
                    let type_desc = if is_func {
                        self.globals
                            .func_sigs
                            .get(name)
                            .map(|args| format!("({} args)", args.len()))
                            .unwrap_or_default()
                    } else {
                        self.decl_val(name)
                            .map(|v| decl::describe_type(&value_type_desc(&v)))
                            .unwrap_or_default()
                    };
                    handler(DeclInfo { kind, name: name.clone(), type_desc });
                }
            }
        }
    }

    /// `call(c, closure, argv)`.
    #[instrument(skip(self, argv))]
    pub fn call(&mut self, closure: PvmValue, argv: Vec<PvmValue>) -> Result<Outcome, PokeError> {
        if !matches!(closure, PvmValue::Closure(_)) {
            return Err(PokeError::NotAClosure);
        }
        let nargs = argv.len() as u32;
        let mut instrs: Vec<poke_runtime::Instr> = argv.into_iter().map(poke_runtime::Instr::PushConst).collect();
        instrs.push(poke_runtime::Instr::PushConst(closure));
        instrs.push(poke_runtime::Instr::Call { nargs });
        instrs.push(poke_runtime::Instr::Halt);
        let program = PvmProgram { name: None, instrs };
        let outcome = self.run_program(program);
        // `Pvm::run` just pushed a frame it will never pop; fold it into
        // the generation chain as an anonymous (nameless) entry so later
        // compiles' `(back, over)` addressing stays aligned with the
        // runtime stack depth (see `back_for`).
        self.globals.generations.push(Vec::new());
        Ok(outcome)
    }

    /// `register_iod(c, iod)`.
    pub fn register_iod(&mut self, iod: Box<dyn Iod>) {
        self.pvm.ios.register_iod(iod);
    }

    pub fn ios_open(&mut self, handler: &str, flags: IosFlags, set_cur: bool) -> Result<IosId, PokeError> {
        Ok(self.pvm.ios.open(handler, flags, set_cur)?)
    }

    // ---- output settings -------------------------------------------

    pub fn obase(&self) -> u32 {
        self.pvm.obase
    }
    pub fn set_obase(&mut self, base: u32) {
        self.pvm.obase = base;
    }
    pub fn output_mode(&self) -> OutputMode {
        self.pvm.output_mode
    }
    pub fn set_output_mode(&mut self, mode: OutputMode) {
        self.pvm.output_mode = mode;
    }
    pub fn oindent(&self) -> u32 {
        self.pvm.oindent
    }
    pub fn set_oindent(&mut self, indent: u32) {
        self.pvm.oindent = indent;
    }
    pub fn odepth(&self) -> u32 {
        self.pvm.odepth
    }
    pub fn set_odepth(&mut self, depth: u32) {
        self.pvm.odepth = depth;
    }
    pub fn oacutoff(&self) -> u32 {
        self.pvm.oacutoff
    }
    pub fn set_oacutoff(&mut self, cutoff: u32) {
        self.pvm.oacutoff = cutoff;
    }
    pub fn endianness(&self) -> Endian {
        self.pvm.endianness
    }
    pub fn set_endianness(&mut self, endian: Endian) {
        self.pvm.endianness = endian;
    }
    pub fn neg_encoding(&self) -> NegEncoding {
        self.pvm.neg_encoding
    }
    pub fn set_neg_encoding(&mut self, enc: NegEncoding) {
        self.pvm.neg_encoding = enc;
    }
    pub fn pretty_print(&self) -> bool {
        self.pvm.pretty_print
    }
    pub fn set_pretty_print(&mut self, on: bool) {
        self.pvm.pretty_print = on;
    }
    pub fn omaps(&self) -> bool {
        self.pvm.omaps
    }
    pub fn set_omaps(&mut self, on: bool) {
        self.pvm.omaps = on;
    }

    // ---- completion helpers ---------------------------------------------

    /// Identifiers (vars, funcs, types) matching `prefix`.
    pub fn complete_identifier(&self, prefix: &str) -> Completion {
        let names = self
            .decls
            .decl_order
            .iter()
            .chain(self.decls.type_order.iter());
        completion::filter_prefix(names, prefix)
    }

    /// Struct fields of `base`'s static type reachable via `.`, matching
    /// `prefix`.
    pub fn complete_field(&self, base: &str, prefix: &str) -> Completion {
        match self.decl_val(base) {
            Ok(PvmValue::Struct(s)) => completion::struct_field_names(s.borrow().struct_type.as_ref(), prefix),
            _ => Completion::new_empty(),
        }
    }

    /// Attribute operators (`e'attr`) matching `prefix`.
    pub fn complete_attribute(&self, prefix: &str) -> Completion {
        completion::attribute_names(prefix)
    }

    /// Open IO space ids, as completion strings for `#<n>` syntax,
    /// matching `prefix`.
    pub fn complete_ios_tag(&self, prefix: &str) -> Completion {
        let mut ids = Vec::new();
        self.pvm.ios.map(|id| ids.push(id));
        completion::ios_tags(ids.into_iter(), prefix)
    }
}

enum CompileMode {
    Program,
    Statement,
    Expression,
}

/// `decl_map`'s `type_desc` for a plain value (not a type declaration
/// itself): renders the value's own runtime shape, since ordinary
/// variables have no separately-recorded static type once codegen
/// discards it (see "no runtime type metadata for plain values" in
/// DESIGN.md).
fn value_type_desc(v: &PvmValue) -> poke_runtime::PokeType {
    match v {
        PvmValue::Int { size, .. } => poke_runtime::PokeType::Integral { size: *size, signed: true },
        PvmValue::Uint { size, .. } => poke_runtime::PokeType::Integral { size: *size, signed: false },
        PvmValue::Long { size, .. } => poke_runtime::PokeType::Integral { size: *size, signed: true },
        PvmValue::Ulong { size, .. } => poke_runtime::PokeType::Integral { size: *size, signed: false },
        PvmValue::String(_) => poke_runtime::PokeType::String,
        PvmValue::Type(t) => (**t).clone(),
        PvmValue::Closure(_) => poke_runtime::PokeType::Closure {
            ret: Rc::new(poke_runtime::PokeType::Any),
            args: Vec::new(),
            vararg: false,
        },
        PvmValue::Array(a) => poke_runtime::PokeType::Array {
            elem: a.borrow().elem_type.clone(),
            bound: None,
        },
        PvmValue::Struct(s) => (*s.borrow().struct_type).clone(),
        PvmValue::Offset(o) => poke_runtime::PokeType::Offset {
            base: Rc::new(value_type_desc(&o.magnitude)),
            unit: o.unit,
        },
        PvmValue::Null => poke_runtime::PokeType::Void,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstraps_the_exception_type() {
        let c = PokeCompiler::headless().unwrap();
        assert!(c.decl_p("Exception", DeclKind::Type));
    }

    #[test]
    fn compiles_and_runs_a_statement() {
        let mut c = PokeCompiler::headless().unwrap();
        let outcome = c.compile_statement("1 + 1;").unwrap();
        assert!(matches!(outcome, Outcome::Value(Some(_))));
    }

    #[test]
    fn globals_persist_across_incremental_compiles() {
        let mut c = PokeCompiler::headless().unwrap();
        c.compile_buffer("var counter = 0;").unwrap();
        assert!(c.decl_p("counter", DeclKind::Var));
        let v = c.decl_val("counter").unwrap();
        assert!(matches!(v, PvmValue::Int { value: 0, .. }));
    }

    #[test]
    fn defvar_declares_and_binds_in_one_step() {
        let mut c = PokeCompiler::headless().unwrap();
        c.defvar("answer", PvmValue::make_int(42, 32).unwrap()).unwrap();
        let v = c.decl_val("answer").unwrap();
        assert!(matches!(v, PvmValue::Int { value: 42, .. }));
    }

    #[test]
    fn decl_set_val_updates_the_binding() {
        let mut c = PokeCompiler::headless().unwrap();
        c.compile_buffer("var counter = 0;").unwrap();
        c.decl_set_val("counter", PvmValue::make_int(7, 32).unwrap()).unwrap();
        let v = c.decl_val("counter").unwrap();
        assert!(matches!(v, PvmValue::Int { value: 7, .. }));
    }

    #[test]
    fn rejects_native_disassembly() {
        let c = PokeCompiler::headless().unwrap();
        let err = c.disassemble_expression("1 + 1", true).unwrap_err();
        assert!(matches!(err, PokeError::Unsupported));
    }
}
