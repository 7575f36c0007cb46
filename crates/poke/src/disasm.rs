//! Textual disassembly of a [`poke_runtime::PvmProgram`], backing
//! [`crate::PokeCompiler::disassemble_function`]/
//! [`crate::PokeCompiler::disassemble_expression`].
//!
//! This implementation targets the bytecode executor only and has no
//! native-code backend, so the `native` flag those two operations accept
//! is honoured only as `false`; a `true` request reports
//! [`crate::PokeError::Unsupported`] rather than silently falling back to
//! bytecode, so a host can't mistake one for the other.

use poke_runtime::{Instr, PvmProgram};
use std::fmt::Write as _;

pub fn disassemble(program: &PvmProgram) -> String {
    let mut out = String::new();
    if let Some(name) = &program.name {
        let _ = writeln!(out, "; {name}");
    }
    for (pc, instr) in program.instrs.iter().enumerate() {
        let _ = writeln!(out, "{pc:6}  {}", format_instr(instr));
    }
    out
}

/// Disassembles just the span of `program` reachable from `entry` down to
/// (and including) its matching `Return`/`Halt`, for a single function's
/// listing rather than the whole compilation unit it was compiled inside.
pub fn disassemble_from(program: &PvmProgram, entry: usize) -> String {
    let mut out = String::new();
    let mut pc = entry;
    while let Some(instr) = program.instrs.get(pc) {
        let _ = writeln!(out, "{pc:6}  {}", format_instr(instr));
        let stop = matches!(instr, Instr::Return | Instr::Halt);
        pc += 1;
        if stop {
            break;
        }
    }
    out
}

fn format_instr(instr: &Instr) -> String {
    match instr {
        Instr::PushConst(v) => format!("push {v:?}"),
        Instr::Pop => "pop".to_string(),
        Instr::Dup => "dup".to_string(),
        Instr::Swap => "swap".to_string(),
        Instr::Over => "over".to_string(),
        Instr::Add => "add".to_string(),
        Instr::Sub => "sub".to_string(),
        Instr::Mul => "mul".to_string(),
        Instr::Div => "div".to_string(),
        Instr::Mod => "mod".to_string(),
        Instr::Neg => "neg".to_string(),
        Instr::BAnd => "band".to_string(),
        Instr::BOr => "bor".to_string(),
        Instr::BXor => "bxor".to_string(),
        Instr::BNot => "bnot".to_string(),
        Instr::Shl => "shl".to_string(),
        Instr::Shr => "shr".to_string(),
        Instr::Lt => "lt".to_string(),
        Instr::Gt => "gt".to_string(),
        Instr::Le => "le".to_string(),
        Instr::Ge => "ge".to_string(),
        Instr::IsEqual => "eq".to_string(),
        Instr::NotEqual => "ne".to_string(),
        Instr::Jmp(pc) => format!("jmp {pc}"),
        Instr::Jz(pc) => format!("jz {pc}"),
        Instr::PushFrame(n) => format!("pushf {n}"),
        Instr::PopFrame => "popf".to_string(),
        Instr::PushVar { back, over } => format!("pushvar {back}, {over}"),
        Instr::PopVar { back, over } => format!("popvar {back}, {over}"),
        Instr::Register => "register".to_string(),
        Instr::Call { nargs } => format!("call {nargs}"),
        Instr::Return => "return".to_string(),
        Instr::MakeClosure { entry } => format!("closure {entry}"),
        Instr::Raise => "raise".to_string(),
        Instr::PushTry { handler } => format!("pushtry {handler}"),
        Instr::PopTry => "poptry".to_string(),
        Instr::Peek { size, signed } => format!("peek {size}, {signed}"),
        Instr::Poke { size } => format!("poke {size}"),
        Instr::SetCurIos => "setcurios".to_string(),
        Instr::PushCurIos => "pushcurios".to_string(),
        Instr::MapValue { ty } => format!("map {}", crate::decl::describe_type(ty)),
        Instr::MakeArray { elem_type, nelem } => format!("mkarray {}, {nelem}", crate::decl::describe_type(elem_type)),
        Instr::MakeStruct { struct_type, .. } => format!("mkstruct {}", crate::decl::describe_type(struct_type)),
        Instr::GetFieldIdx(i) => format!("getfield# {i}"),
        Instr::SetFieldIdx(i) => format!("setfield# {i}"),
        Instr::GetField(name) => format!("getfield {name}"),
        Instr::SetField(name) => format!("setfield {name}"),
        Instr::GetIndex => "getindex".to_string(),
        Instr::SetIndex => "setindex".to_string(),
        Instr::MakeOffset => "mkoffset".to_string(),
        Instr::ArrayLen => "arraylen".to_string(),
        Instr::Trim => "trim".to_string(),
        Instr::Incr => "incr".to_string(),
        Instr::Decr => "decr".to_string(),
        Instr::CastInt { size, signed } => format!("cast {size}, {signed}"),
        Instr::IsaCheck { ty } => format!("isa {}", crate::decl::describe_type(ty)),
        Instr::Print { newline } => format!("print {newline}"),
        Instr::Halt => "halt".to_string(),
    }
}
