//! Declaration bookkeeping for [`crate::PokeCompiler`]'s `decl_map`/
//! `decl_p`/`decl_val`/`decl_set_val`/`defvar`.
//!
//! `poke_compiler::GlobalEnv` already tracks, across incremental compiles,
//! which names were declared in each generation and what functions/types/
//! enum constants exist; what it does not track is *where in the PVM's
//! frame stack* a variable or function lives, because that depends on how
//! many [`poke_runtime::Pvm::run`] calls have happened since (each one
//! pushes a frame that is never popped — see `PokeCompiler::call`, which
//! pushes one such frame per invocation). This module is the façade-side
//! address book that turns a declaration name into a lexical `(back,
//! over)` pair good for `Environment::lookup`/`set`.

use poke_runtime::PokeType;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclKind {
    Var,
    Func,
    Type,
}

/// Where a `var`/`fun` declaration lives: which generation's frame it was
/// registered into, and its slot within that frame.
#[derive(Debug, Clone, Copy)]
pub struct Slot {
    pub generation: usize,
    pub over: u32,
    pub is_func: bool,
}

/// One row of a `decl_map` enumeration.
#[derive(Debug, Clone)]
pub struct DeclInfo {
    pub kind: DeclKind,
    pub name: String,
    pub type_desc: String,
}

/// Tracks slot addresses for every `var`/`fun` ever declared, plus the
/// order types were first seen, so `decl_map` can enumerate deterministically.
#[derive(Debug, Default)]
pub struct DeclTable {
    pub slots: HashMap<String, Slot>,
    pub decl_order: Vec<String>,
    pub type_order: Vec<String>,
}

impl DeclTable {
    /// Folds in the newest generation's declarations after a successful
    /// compile. `generation` is the index of `globals.generations.last()`;
    /// `names` is that generation's name list in declaration order;
    /// `is_func` classifies each by whether it also appears in `func_sigs`.
    pub fn record_generation(&mut self, generation: usize, names: &[String], is_func: impl Fn(&str) -> bool) {
        for (over, name) in names.iter().enumerate() {
            self.slots.insert(
                name.clone(),
                Slot {
                    generation,
                    over: over as u32,
                    is_func: is_func(name),
                },
            );
            if !self.decl_order.contains(name) {
                self.decl_order.push(name.clone());
            }
        }
    }

    pub fn record_types<'a>(&mut self, names: impl Iterator<Item = &'a String>) {
        for name in names {
            if !self.type_order.contains(name) {
                self.type_order.push(name.clone());
            }
        }
    }
}

/// Renders a [`PokeType`] the way a declaration-enumeration callback's
/// `type_desc` field expects: a short, human-readable type name. There is
/// no `Display` impl on `PokeType` itself (it lives in `poke-runtime`,
/// which has no reason to know about source-level type syntax), so this
/// stays a façade-local helper.
pub fn describe_type(ty: &PokeType) -> String {
    match ty {
        PokeType::Integral { size, signed } => {
            format!("{}int<{}>", if *signed { "" } else { "u" }, size)
        }
        PokeType::String => "string".to_string(),
        PokeType::Array { elem, bound } => match bound {
            Some(poke_runtime::ArrayBoundKind::Elements(n)) => format!("{}[{}]", describe_type(elem), n),
            Some(poke_runtime::ArrayBoundKind::Bits(n)) => format!("{}[{}#b]", describe_type(elem), n),
            None => format!("{}[]", describe_type(elem)),
        },
        PokeType::Struct { name, is_union, .. } => match name {
            Some(n) => n.clone(),
            None if *is_union => "union {}".to_string(),
            None => "struct {}".to_string(),
        },
        PokeType::Offset { base, unit } => format!("{}<{}>", describe_type(base), unit),
        PokeType::Closure { ret, args, vararg } => {
            let mut parts: Vec<String> = args.iter().map(|a| describe_type(a)).collect();
            if *vararg {
                parts.push("...".to_string());
            }
            format!("({}) {}", parts.join(", "), describe_type(ret))
        }
        PokeType::Void => "void".to_string(),
        PokeType::Any => "any".to_string(),
    }
}
