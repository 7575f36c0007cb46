//! Completion helpers: a stateful iterator a host's line editor can pull
//! candidates from one at a time, matching `repl`/`lsp`'s pattern of
//! handing back an iterator rather than a fully-materialized `Vec` the
//! caller must truncate itself.

use poke_runtime::PokeType;

/// The fixed vocabulary of attribute operators (`e'attr`) this
/// implementation recognizes. Not exhaustive of every attribute Poke
/// defines — just the ones with a value well-defined enough to complete
/// against (size/offset of a mapped value, an array's element count, an
/// offset's magnitude/unit).
pub const ATTRIBUTES: &[&str] = &[
    "size", "offset", "mapped", "elem", "length", "magnitude", "unit", "ename", "eval",
];

/// An in-progress completion: the full candidate list plus a cursor, so a
/// host can call `next()` repeatedly (as a line editor's Tab key would)
/// without the façade re-deriving anything.
#[derive(Debug, Clone)]
pub struct Completion {
    candidates: Vec<String>,
    pos: usize,
}

impl Completion {
    pub(crate) fn new(mut candidates: Vec<String>) -> Self {
        candidates.sort();
        candidates.dedup();
        Completion { candidates, pos: 0 }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn new_empty() -> Self {
        Completion { candidates: Vec::new(), pos: 0 }
    }
}

impl Iterator for Completion {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let item = self.candidates.get(self.pos).cloned();
        if item.is_some() {
            self.pos += 1;
        }
        item
    }
}

pub(crate) fn filter_prefix<'a>(names: impl Iterator<Item = &'a String>, prefix: &str) -> Completion {
    Completion::new(names.filter(|n| n.starts_with(prefix)).cloned().collect())
}

pub(crate) fn struct_field_names(ty: &PokeType, prefix: &str) -> Completion {
    let names = match ty {
        PokeType::Struct { fields, .. } => fields
            .iter()
            .filter_map(|f| f.name.as_ref())
            .filter(|n| n.starts_with(prefix))
            .cloned()
            .collect(),
        _ => Vec::new(),
    };
    Completion::new(names)
}

pub(crate) fn attribute_names(prefix: &str) -> Completion {
    Completion::new(
        ATTRIBUTES
            .iter()
            .filter(|a| a.starts_with(prefix))
            .map(|a| a.to_string())
            .collect(),
    )
}

pub(crate) fn ios_tags(ios_ids: impl Iterator<Item = i32>, prefix: &str) -> Completion {
    Completion::new(
        ios_ids
            .map(|id| id.to_string())
            .filter(|n| n.starts_with(prefix))
            .collect(),
    )
}
