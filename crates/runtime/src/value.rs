//! The PVM's tagged value model.
//!
//! A PVM value is conceptually a 64-bit word whose low 3 bits are a tag
//! (`INT`/`UINT`/`LONG`/`ULONG`/`BOX`/`NULL`), with boxed objects carrying
//! their own 1-byte sub-tag. This crate represents that same contract as
//! a safe Rust enum (`seq-runtime::value::Value`'s shape; its sibling
//! `nanbox` module packs the same tags into a raw 64-bit word for
//! cross-language linking against LLVM-emitted code, a constraint that
//! doesn't apply here since this crate has no FFI boundary to stabilize).
//!
//! Boxed payloads are `Rc<RefCell<_>>` rather than GC-traced: cycles can
//! only arise through closure/environment edges, which this
//! implementation accepts rather than collects.

use crate::types::PokeType;
use std::cell::RefCell;
use std::rc::Rc;

/// An IO space identifier.
pub type IosId = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MapInfo {
    pub mapped_p: bool,
    pub strict_p: bool,
    pub ios: Option<IosId>,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArrayBound {
    Elements(u64),
    Bits(u64),
}

#[derive(Debug, Clone)]
pub struct ArrayCell {
    pub offset: u64,
    pub value: PvmValue,
    pub offset_back: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct PokeArray {
    pub elem_type: Rc<PokeType>,
    pub elements: Vec<ArrayCell>,
    pub bound: Option<ArrayBound>,
    pub mapper: Option<Rc<Closure>>,
    pub writer: Option<Rc<Closure>>,
    pub mapinfo: MapInfo,
    pub mapinfo_back: Option<MapInfo>,
}

/// A field cell in a struct value. `name == None && value == None` marks an
/// *absent* field: a union alternative not taken, or an optional field not
/// present.
#[derive(Debug, Clone)]
pub struct FieldCell {
    pub name: Option<String>,
    pub value: Option<PvmValue>,
    pub offset: u64,
    pub modified: bool,
    pub offset_back: Option<u64>,
    pub modified_back: Option<bool>,
}

impl FieldCell {
    pub fn is_absent(&self) -> bool {
        self.name.is_none() && self.value.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct PokeStruct {
    pub struct_type: Rc<PokeType>,
    pub fields: Vec<FieldCell>,
    pub methods: Vec<(String, PvmValue)>,
    pub mapper: Option<Rc<Closure>>,
    pub writer: Option<Rc<Closure>>,
    pub mapinfo: MapInfo,
    pub mapinfo_back: Option<MapInfo>,
}

#[derive(Debug, Clone)]
pub struct PokeOffset {
    pub magnitude: Box<PvmValue>,
    pub unit: u64,
}

/// A closure: a compiled program, an entry point within it, and a captured
/// environment frame. `Environment` and `PvmProgram` are defined in
/// sibling modules; `Closure` only needs their handles.
#[derive(Debug)]
pub struct Closure {
    pub program: Rc<crate::exec::PvmProgram>,
    pub entry_point: usize,
    pub env: Option<Rc<RefCell<crate::env::Frame>>>,
    pub name: Option<String>,
}

impl PartialEq for Closure {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.program, &other.program) && self.entry_point == other.entry_point
    }
}
impl Eq for Closure {}

/// No `PartialEq`/`Eq` derive: Poke value equality is `equal_p` below, not
/// Rust structural equality (mapped arrays/structs compare position too).
#[derive(Debug, Clone)]
pub enum PvmValue {
    /// Signed integer, declared size 1..=32.
    Int { value: i32, size: u32 },
    /// Unsigned integer, declared size 1..=32.
    Uint { value: u32, size: u32 },
    /// Signed integer, declared size 1..=64 (boxed conceptually; used for
    /// widths the unboxed `Int` case doesn't cover).
    Long { value: i64, size: u32 },
    /// Unsigned integer, declared size 1..=64.
    Ulong { value: u64, size: u32 },
    String(Rc<RefCell<String>>),
    Array(Rc<RefCell<PokeArray>>),
    Struct(Rc<RefCell<PokeStruct>>),
    Type(Rc<PokeType>),
    Closure(Rc<Closure>),
    Offset(Rc<PokeOffset>),
    Null,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum ValueError {
    #[error("invalid size {0} for integral value (must be 1..=32)")]
    InvalidIntSize(u32),
    #[error("invalid size {0} for long/ulong value (must be 1..=64)")]
    InvalidLongSize(u32),
}

impl PvmValue {
    pub fn make_int(value: i32, size: u32) -> Result<PvmValue, ValueError> {
        if !(1..=32).contains(&size) {
            return Err(ValueError::InvalidIntSize(size));
        }
        Ok(PvmValue::Int {
            value: sign_extend_i32(value, size),
            size,
        })
    }

    pub fn make_uint(value: u32, size: u32) -> Result<PvmValue, ValueError> {
        if !(1..=32).contains(&size) {
            return Err(ValueError::InvalidIntSize(size));
        }
        Ok(PvmValue::Uint {
            value: zero_extend_u32(value, size),
            size,
        })
    }

    pub fn make_long(value: i64, size: u32) -> Result<PvmValue, ValueError> {
        if !(1..=64).contains(&size) {
            return Err(ValueError::InvalidLongSize(size));
        }
        Ok(PvmValue::Long {
            value: poke_core::bits::sign_extend(value, size),
            size,
        })
    }

    pub fn make_ulong(value: u64, size: u32) -> Result<PvmValue, ValueError> {
        if !(1..=64).contains(&size) {
            return Err(ValueError::InvalidLongSize(size));
        }
        Ok(PvmValue::Ulong {
            value: poke_core::bits::zero_extend(value, size),
            size,
        })
    }

    pub fn make_string(s: impl Into<String>) -> PvmValue {
        PvmValue::String(Rc::new(RefCell::new(s.into())))
    }

    /// Fails (returns `None`) if `unit` is zero, mirroring the source
    /// spec's "fails if unit is not ulong<64> or is zero".
    pub fn make_offset(magnitude: PvmValue, unit: u64) -> Option<PvmValue> {
        if unit == 0 {
            return None;
        }
        Some(PvmValue::Offset(Rc::new(PokeOffset {
            magnitude: Box::new(magnitude),
            unit,
        })))
    }

    pub fn make_array(nelem: u64, elem_type: Rc<PokeType>) -> PvmValue {
        PvmValue::Array(Rc::new(RefCell::new(PokeArray {
            elem_type,
            elements: Vec::with_capacity((nelem as usize) + 16),
            bound: None,
            mapper: None,
            writer: None,
            mapinfo: MapInfo::default(),
            mapinfo_back: None,
        })))
    }

    pub fn make_struct(nfields: usize, struct_type: Rc<PokeType>) -> PvmValue {
        let mut fields = Vec::with_capacity(nfields);
        for _ in 0..nfields {
            fields.push(FieldCell {
                name: None,
                value: None,
                offset: 0,
                modified: false,
                offset_back: None,
                modified_back: None,
            });
        }
        PvmValue::Struct(Rc::new(RefCell::new(PokeStruct {
            struct_type,
            fields,
            methods: Vec::new(),
            mapper: None,
            writer: None,
            mapinfo: MapInfo::default(),
            mapinfo_back: None,
        })))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, PvmValue::Null)
    }

    /// `typeof(v)`: a type value reflecting `v`'s runtime shape.
    pub fn typeof_value(&self) -> PokeType {
        match self {
            PvmValue::Int { size, .. } => PokeType::Integral {
                size: *size,
                signed: true,
            },
            PvmValue::Uint { size, .. } => PokeType::Integral {
                size: *size,
                signed: false,
            },
            PvmValue::Long { size, .. } => PokeType::Integral {
                size: *size,
                signed: true,
            },
            PvmValue::Ulong { size, .. } => PokeType::Integral {
                size: *size,
                signed: false,
            },
            PvmValue::String(_) => PokeType::String,
            PvmValue::Array(a) => {
                let a = a.borrow();
                PokeType::Array {
                    elem: a.elem_type.clone(),
                    bound: a.bound.as_ref().map(|b| match b {
                        ArrayBound::Elements(n) => crate::types::ArrayBoundKind::Elements(*n),
                        ArrayBound::Bits(n) => crate::types::ArrayBoundKind::Bits(*n),
                    }),
                }
            }
            PvmValue::Struct(s) => (*s.borrow().struct_type).clone(),
            PvmValue::Type(_) => PokeType::Any,
            PvmValue::Closure(_) => PokeType::Closure {
                ret: Rc::new(PokeType::Any),
                args: Vec::new(),
                vararg: false,
            },
            PvmValue::Offset(o) => PokeType::Offset {
                base: Rc::new(o.magnitude.typeof_value()),
                unit: o.unit,
            },
            PvmValue::Null => PokeType::Any,
        }
    }

    /// Structural equality: same kind, same size for integrals,
    /// recursively equal payloads; for mapped values also compares
    /// IOS/offset/bounds.
    pub fn equal_p(&self, other: &PvmValue) -> bool {
        match (self, other) {
            (PvmValue::Int { value: a, size: sa }, PvmValue::Int { value: b, size: sb }) => {
                a == b && sa == sb
            }
            (PvmValue::Uint { value: a, size: sa }, PvmValue::Uint { value: b, size: sb }) => {
                a == b && sa == sb
            }
            (PvmValue::Long { value: a, size: sa }, PvmValue::Long { value: b, size: sb }) => {
                a == b && sa == sb
            }
            (PvmValue::Ulong { value: a, size: sa }, PvmValue::Ulong { value: b, size: sb }) => {
                a == b && sa == sb
            }
            (PvmValue::String(a), PvmValue::String(b)) => *a.borrow() == *b.borrow(),
            (PvmValue::Offset(a), PvmValue::Offset(b)) => {
                a.unit == b.unit && a.magnitude.equal_p(&b.magnitude)
            }
            (PvmValue::Array(a), PvmValue::Array(b)) => {
                let a = a.borrow();
                let b = b.borrow();
                if a.elements.len() != b.elements.len() {
                    return false;
                }
                if a.mapinfo.mapped_p != b.mapinfo.mapped_p
                    || (a.mapinfo.mapped_p
                        && (a.mapinfo.ios != b.mapinfo.ios
                            || a.mapinfo.offset != b.mapinfo.offset))
                {
                    return false;
                }
                a.elements.iter().zip(b.elements.iter()).all(|(ca, cb)| {
                    ca.value.equal_p(&cb.value)
                        && (!a.mapinfo.mapped_p || ca.offset == cb.offset)
                })
            }
            (PvmValue::Struct(a), PvmValue::Struct(b)) => {
                let a = a.borrow();
                let b = b.borrow();
                if a.mapinfo.mapped_p != b.mapinfo.mapped_p
                    || (a.mapinfo.mapped_p
                        && (a.mapinfo.ios != b.mapinfo.ios
                            || a.mapinfo.offset != b.mapinfo.offset))
                {
                    return false;
                }
                let af: Vec<&FieldCell> = a.fields.iter().filter(|f| !f.is_absent()).collect();
                let bf: Vec<&FieldCell> = b.fields.iter().filter(|f| !f.is_absent()).collect();
                if af.len() != bf.len() {
                    return false;
                }
                af.iter().zip(bf.iter()).all(|(fa, fb)| {
                    fa.name == fb.name
                        && fa
                            .value
                            .as_ref()
                            .unwrap()
                            .equal_p(fb.value.as_ref().unwrap())
                })
            }
            (PvmValue::Closure(a), PvmValue::Closure(b)) => a == b,
            (PvmValue::Type(a), PvmValue::Type(b)) => a == b,
            (PvmValue::Null, PvmValue::Null) => true,
            _ => false,
        }
    }

    /// Bit size. Closures and types are size 0.
    pub fn sizeof_bits(&self) -> u64 {
        match self {
            PvmValue::Int { size, .. } | PvmValue::Uint { size, .. } => *size as u64,
            PvmValue::Long { size, .. } | PvmValue::Ulong { size, .. } => *size as u64,
            PvmValue::String(s) => (s.borrow().as_bytes().len() as u64 + 1) * 8,
            PvmValue::Array(a) => {
                let a = a.borrow();
                a.elements.iter().map(|c| c.value.sizeof_bits()).sum()
            }
            PvmValue::Struct(s) => {
                let s = s.borrow();
                s.fields
                    .iter()
                    .filter(|f| !f.is_absent())
                    .map(|f| f.offset + f.value.as_ref().unwrap().sizeof_bits())
                    .max()
                    .unwrap_or(0)
            }
            PvmValue::Type(_) | PvmValue::Closure(_) => 0,
            PvmValue::Offset(_) => 0,
            PvmValue::Null => 0,
        }
    }

    fn mapinfo(&self) -> Option<MapInfo> {
        match self {
            PvmValue::Array(a) => Some(a.borrow().mapinfo),
            PvmValue::Struct(s) => Some(s.borrow().mapinfo),
            _ => None,
        }
    }

    /// `reloc(v, ios, boffset)`: rebind this mappable value (and,
    /// recursively, every child cell) to a new base, saving the previous
    /// offsets into `_back` so `ureloc` can restore them exactly.
    pub fn reloc(&self, ios: IosId, boffset: u64) {
        match self {
            PvmValue::Array(a) => {
                let mut a = a.borrow_mut();
                let old = a.mapinfo;
                a.mapinfo_back = Some(old);
                let delta = boffset as i128 - old.offset as i128;
                a.mapinfo.mapped_p = true;
                a.mapinfo.ios = Some(ios);
                a.mapinfo.offset = boffset;
                for cell in &mut a.elements {
                    cell.offset_back = Some(cell.offset);
                    cell.offset = (cell.offset as i128 + delta) as u64;
                    cell.value.reloc_child(ios, delta);
                }
            }
            PvmValue::Struct(s) => {
                let mut s = s.borrow_mut();
                let old = s.mapinfo;
                s.mapinfo_back = Some(old);
                let delta = boffset as i128 - old.offset as i128;
                s.mapinfo.mapped_p = true;
                s.mapinfo.ios = Some(ios);
                s.mapinfo.offset = boffset;
                for field in &mut s.fields {
                    if field.is_absent() {
                        continue;
                    }
                    field.offset_back = Some(field.offset);
                    field.offset = (field.offset as i128 + delta) as u64;
                    if let Some(v) = &field.value {
                        v.reloc_child(ios, delta);
                    }
                }
            }
            _ => {}
        }
    }

    /// Re-base an already-mapped child by `delta` bits (used while
    /// recursing through `reloc`); a child that isn't itself mapped has
    /// nothing to rebase.
    fn reloc_child(&self, ios: IosId, delta: i128) {
        match self {
            PvmValue::Array(a) => {
                let mut a = a.borrow_mut();
                if a.mapinfo.mapped_p {
                    a.mapinfo_back = Some(a.mapinfo);
                    a.mapinfo.ios = Some(ios);
                    a.mapinfo.offset = (a.mapinfo.offset as i128 + delta) as u64;
                    for cell in &mut a.elements {
                        cell.offset_back = Some(cell.offset);
                        cell.offset = (cell.offset as i128 + delta) as u64;
                        cell.value.reloc_child(ios, delta);
                    }
                }
            }
            PvmValue::Struct(s) => {
                let mut s = s.borrow_mut();
                if s.mapinfo.mapped_p {
                    s.mapinfo_back = Some(s.mapinfo);
                    s.mapinfo.ios = Some(ios);
                    s.mapinfo.offset = (s.mapinfo.offset as i128 + delta) as u64;
                    for field in &mut s.fields {
                        if field.is_absent() {
                            continue;
                        }
                        field.offset_back = Some(field.offset);
                        field.offset = (field.offset as i128 + delta) as u64;
                        if let Some(v) = &field.value {
                            v.reloc_child(ios, delta);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    /// `ureloc(v)`: restore the offsets saved by the last `reloc`.
    pub fn ureloc(&self) {
        match self {
            PvmValue::Array(a) => {
                let mut a = a.borrow_mut();
                if let Some(back) = a.mapinfo_back.take() {
                    a.mapinfo = back;
                }
                for cell in &mut a.elements {
                    if let Some(back) = cell.offset_back.take() {
                        cell.offset = back;
                    }
                    cell.value.ureloc();
                }
            }
            PvmValue::Struct(s) => {
                let mut s = s.borrow_mut();
                if let Some(back) = s.mapinfo_back.take() {
                    s.mapinfo = back;
                }
                for field in &mut s.fields {
                    if let Some(back) = field.offset_back.take() {
                        field.offset = back;
                    }
                    if let Some(v) = &field.value {
                        v.ureloc();
                    }
                }
            }
            _ => {}
        }
    }

    /// `unmap(v)`: clear `mapped_p` recursively.
    pub fn unmap(&self) {
        match self {
            PvmValue::Array(a) => {
                let mut a = a.borrow_mut();
                a.mapinfo = MapInfo::default();
                a.mapinfo_back = None;
                for cell in &mut a.elements {
                    cell.value.unmap();
                }
            }
            PvmValue::Struct(s) => {
                let mut s = s.borrow_mut();
                s.mapinfo = MapInfo::default();
                s.mapinfo_back = None;
                for field in &mut s.fields {
                    if let Some(v) = &field.value {
                        v.unmap();
                    }
                }
            }
            _ => {}
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.mapinfo().map(|m| m.mapped_p).unwrap_or(false)
    }
}

fn sign_extend_i32(v: i32, size: u32) -> i32 {
    if size == 32 {
        return v;
    }
    let shift = 32 - size;
    (v << shift) >> shift
}

fn zero_extend_u32(v: u32, size: u32) -> u32 {
    if size == 32 {
        return v;
    }
    v & ((1u32 << size) - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integral_round_trip_signed() {
        for size in 1..=32u32 {
            let min = if size == 32 {
                i32::MIN
            } else {
                -(1i32 << (size - 1))
            };
            let v = PvmValue::make_int(min, size).unwrap();
            match v {
                PvmValue::Int { value, size: s } => {
                    assert_eq!(s, size);
                    assert_eq!(value, min);
                }
                _ => panic!("wrong variant"),
            }
        }
    }

    #[test]
    fn integral_round_trip_unsigned() {
        let v = PvmValue::make_uint(0xFF, 4).unwrap();
        match v {
            PvmValue::Uint { value, .. } => assert_eq!(value, 0xF),
            _ => panic!(),
        }
    }

    #[test]
    fn make_int_rejects_bad_size() {
        assert!(PvmValue::make_int(0, 0).is_err());
        assert!(PvmValue::make_int(0, 33).is_err());
    }

    #[test]
    fn offset_normalisation() {
        let mag = PvmValue::make_uint(4, 32).unwrap();
        assert!(PvmValue::make_offset(mag.clone(), 0).is_none());
        let off = PvmValue::make_offset(mag, 8).unwrap();
        match off {
            PvmValue::Offset(o) => assert_eq!(o.unit, 8),
            _ => panic!(),
        }
    }

    #[test]
    fn value_equality_reflexive_and_structural() {
        let a = PvmValue::make_int(5, 32).unwrap();
        let b = PvmValue::make_int(5, 32).unwrap();
        assert!(a.equal_p(&a));
        assert!(a.equal_p(&b));
        let c = PvmValue::make_int(5, 16).unwrap();
        assert!(!a.equal_p(&c));
    }

    #[test]
    fn string_sizeof_includes_nul() {
        let s = PvmValue::make_string("abc");
        assert_eq!(s.sizeof_bits(), 32);
    }

    #[test]
    fn empty_array_sizeof_is_zero() {
        let elem = Rc::new(PokeType::Integral {
            size: 8,
            signed: false,
        });
        let arr = PvmValue::make_array(0, elem);
        assert_eq!(arr.sizeof_bits(), 0);
    }

    #[test]
    fn struct_sizeof_sums_fields() {
        let struct_type = Rc::new(PokeType::Struct {
            name: None,
            fields: vec![],
            is_union: false,
            pinned: false,
            integral_backing: None,
        });
        let v = PvmValue::make_struct(2, struct_type);
        if let PvmValue::Struct(s) = &v {
            let mut s = s.borrow_mut();
            s.fields[0] = FieldCell {
                name: Some("a".into()),
                value: Some(PvmValue::make_uint(1, 8).unwrap()),
                offset: 0,
                modified: false,
                offset_back: None,
                modified_back: None,
            };
            s.fields[1] = FieldCell {
                name: Some("b".into()),
                value: Some(PvmValue::make_uint(2, 16).unwrap()),
                offset: 8,
                modified: false,
                offset_back: None,
                modified_back: None,
            };
        }
        assert_eq!(v.sizeof_bits(), 24);
    }

    #[test]
    fn reloc_then_ureloc_restores_offsets_exactly() {
        let elem = Rc::new(PokeType::Integral {
            size: 8,
            signed: false,
        });
        let v = PvmValue::make_array(2, elem);
        if let PvmValue::Array(a) = &v {
            let mut a = a.borrow_mut();
            a.elements.push(ArrayCell {
                offset: 0,
                value: PvmValue::make_uint(1, 8).unwrap(),
                offset_back: None,
            });
            a.elements.push(ArrayCell {
                offset: 8,
                value: PvmValue::make_uint(2, 8).unwrap(),
                offset_back: None,
            });
        }
        v.reloc(3, 100);
        if let PvmValue::Array(a) = &v {
            let a = a.borrow();
            assert!(a.mapinfo.mapped_p);
            assert_eq!(a.mapinfo.ios, Some(3));
            assert_eq!(a.elements[0].offset, 100);
            assert_eq!(a.elements[1].offset, 108);
        }
        v.ureloc();
        if let PvmValue::Array(a) = &v {
            let a = a.borrow();
            assert!(!a.mapinfo.mapped_p);
            assert_eq!(a.elements[0].offset, 0);
            assert_eq!(a.elements[1].offset, 8);
        }
    }

    #[test]
    fn unmap_clears_recursively() {
        let elem = Rc::new(PokeType::Integral {
            size: 8,
            signed: false,
        });
        let v = PvmValue::make_array(1, elem);
        v.reloc(1, 0);
        v.unmap();
        assert!(!v.is_mapped());
    }
}
