//! Poke type values.
//!
//! Types are themselves boxed values at runtime (`PvmValue::Type`), so a
//! Poke program can reflect on `typeof(v)`. The variants here mirror
//! `original_source/libpoke/pkl.h`'s type-code set directly — a structural
//! type system with no close analogue among this workspace's other crates.

use std::rc::Rc;

/// Three-valued completeness, per `AstType.complete` in `pkl-ast.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completeness {
    Unknown,
    Complete,
    Incomplete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructField {
    pub name: Option<String>,
    pub ty: Rc<PokeType>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArrayBoundKind {
    /// A fixed element count known at the type level.
    Elements(u64),
    /// A fixed bit-size bound.
    Bits(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PokeType {
    Integral {
        size: u32,
        signed: bool,
    },
    String,
    Array {
        elem: Rc<PokeType>,
        bound: Option<ArrayBoundKind>,
    },
    Struct {
        name: Option<String>,
        fields: Vec<StructField>,
        is_union: bool,
        pinned: bool,
        /// Present for an "integral struct": the backing integer type it
        /// `integrate`s to and `deintegrate`s from.
        integral_backing: Option<Rc<PokeType>>,
    },
    Offset {
        base: Rc<PokeType>,
        unit: u64,
    },
    Closure {
        ret: Rc<PokeType>,
        args: Vec<Rc<PokeType>>,
        /// Whether the last argument is a vararg; the source spec requires
        /// at most one, and it must be last.
        vararg: bool,
    },
    Void,
    Any,
}

impl PokeType {
    pub fn completeness(&self) -> Completeness {
        match self {
            PokeType::Integral { .. }
            | PokeType::String
            | PokeType::Offset { .. }
            | PokeType::Void
            | PokeType::Any
            | PokeType::Closure { .. } => Completeness::Complete,
            PokeType::Array { bound, elem } => {
                if bound.is_some() {
                    elem.completeness()
                } else {
                    Completeness::Incomplete
                }
            }
            PokeType::Struct {
                fields, is_union, ..
            } => {
                if *is_union {
                    // A union's size depends on which alternative is
                    // selected at map time; treated as incomplete here.
                    return Completeness::Incomplete;
                }
                if fields
                    .iter()
                    .all(|f| f.ty.completeness() == Completeness::Complete)
                {
                    Completeness::Complete
                } else {
                    Completeness::Incomplete
                }
            }
        }
    }

    /// `true` for an "integral struct": a struct whose bit representation
    /// is an integer of declared width (supports `integrate`/`deintegrate`).
    pub fn is_integral_struct(&self) -> bool {
        matches!(
            self,
            PokeType::Struct {
                integral_backing: Some(_),
                ..
            }
        )
    }

    pub fn bit_size_hint(&self) -> Option<u64> {
        match self {
            PokeType::Integral { size, .. } => Some(*size as u64),
            PokeType::Offset { .. } | PokeType::Void | PokeType::Any | PokeType::Closure { .. } => {
                Some(0)
            }
            PokeType::Array {
                bound: Some(ArrayBoundKind::Bits(n)),
                ..
            } => Some(*n),
            PokeType::Array {
                bound: Some(ArrayBoundKind::Elements(n)),
                elem,
            } => elem.bit_size_hint().map(|es| es * n),
            PokeType::Array { bound: None, .. } => None,
            PokeType::String => None,
            PokeType::Struct {
                fields, is_union, ..
            } => {
                if *is_union {
                    return None;
                }
                let mut total = 0u64;
                for f in fields {
                    total += f.ty.bit_size_hint()?;
                }
                Some(total)
            }
        }
    }
}

/// Invariant checks for a struct type declaration, run by the `anal1`
/// compiler pass. Returns the first violated invariant's description, if
/// any.
pub fn check_struct_invariants(
    fields: &[StructField],
    is_union: bool,
    pinned: bool,
    integral_backing: Option<&Rc<PokeType>>,
) -> Result<(), String> {
    if integral_backing.is_some() && pinned {
        return Err("an integral struct may not be pinned".to_string());
    }
    if is_union {
        let mut seen = std::collections::HashSet::new();
        for f in fields {
            if let Some(name) = &f.name {
                if !seen.insert(name.clone()) {
                    return Err(format!("duplicate field name `{name}` in union"));
                }
            }
        }
    } else {
        let mut seen = std::collections::HashSet::new();
        for f in fields {
            if let Some(name) = &f.name {
                if !seen.insert(name.clone()) {
                    return Err(format!("duplicate field name `{name}` in struct"));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integral_struct_cannot_be_pinned() {
        let backing = Rc::new(PokeType::Integral {
            size: 16,
            signed: false,
        });
        let err = check_struct_invariants(&[], false, true, Some(&backing)).unwrap_err();
        assert!(err.contains("pinned"));
    }

    #[test]
    fn union_rejects_duplicate_field_names() {
        let f = |n: &str| StructField {
            name: Some(n.to_string()),
            ty: Rc::new(PokeType::Integral {
                size: 8,
                signed: false,
            }),
        };
        let err = check_struct_invariants(&[f("a"), f("a")], true, false, None).unwrap_err();
        assert!(err.contains("duplicate"));
    }

    #[test]
    fn complete_struct_sizes_sum_fields() {
        let u8t = Rc::new(PokeType::Integral {
            size: 8,
            signed: false,
        });
        let u16t = Rc::new(PokeType::Integral {
            size: 16,
            signed: false,
        });
        let s = PokeType::Struct {
            name: None,
            fields: vec![
                StructField {
                    name: Some("a".into()),
                    ty: u8t,
                },
                StructField {
                    name: Some("b".into()),
                    ty: u16t,
                },
            ],
            is_union: false,
            pinned: false,
            integral_backing: None,
        };
        assert_eq!(s.completeness(), Completeness::Complete);
        assert_eq!(s.bit_size_hint(), Some(24));
    }
}
