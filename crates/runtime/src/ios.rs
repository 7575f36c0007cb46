//! The IO Space (IOS) layer.
//!
//! Grounded on `original_source/poke/pk-ios.c`/`pk-ios.h`'s registry
//! shape and `libpoke.h`'s `pk_ios_*` operation set; the Rust-level shape of
//! a pluggable backing device (a small trait implemented per driver, a
//! registry keyed by integer id) follows `seq-runtime::file`/
//! `seq-runtime::io` in spirit — buffered, `Result`-returning, no panics
//! on bad input — even though neither has any notion of a bit-addressed,
//! sub-space-composable registry itself.
//!
//! This implementation requires every `pread`/`pwrite` offset and length to
//! be byte-aligned (a multiple of 8 bits); a genuinely bit-granular backing
//! device is out of proportionate scope here, and every concrete driver
//! poke itself ships (file, memory, `/proc`) is byte-addressed internally
//! in any case. The executor's `peek`/`poke` instructions (`exec.rs`) are
//! the layer that would need sub-byte packing for, e.g., a `uint<3>`
//! field — that packing happens above this layer, against a byte-aligned
//! read/write of the smallest covering byte range.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::rc::Rc;

pub type IosId = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IosFlags(pub u64);

impl IosFlags {
    pub const READ: u64 = 1;
    pub const WRITE: u64 = 2;
    pub const TRUNCATE: u64 = 8;
    pub const CREATE: u64 = 16;

    pub fn has(self, bit: u64) -> bool {
        self.0 & bit != 0
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum IosError {
    #[error("generic IO space error")]
    Error,
    #[error("out of memory")]
    Enomem,
    #[error("end of file")]
    Eof,
    #[error("invalid argument")]
    Einval,
    #[error("could not open handler `{0}`")]
    Eopen(String),
    #[error("no such IO space")]
    NoIos,
    #[error("invalid IO flags")]
    InvalidFlags,
    #[error("wrong permissions for this operation")]
    Permissions,
}

/// A concrete backing device, once opened. Offsets/lengths are in bits but
/// must be byte-aligned (see module docs).
pub trait IoDevice: std::fmt::Debug {
    fn pread(&mut self, buf: &mut [u8], offset_bits: u64) -> Result<(), IosError>;
    fn pwrite(&mut self, buf: &[u8], offset_bits: u64) -> Result<(), IosError>;
    fn size_bits(&self) -> u64;
    fn flush(&mut self) -> Result<(), IosError>;
}

/// A driver: knows how to recognize and open handlers of one kind (e.g.
/// `memory://`, `file://`). Mirrors `libpoke`'s nine-function-pointer IOD
/// record as a small trait instead.
pub trait Iod {
    fn name(&self) -> &'static str;
    /// Returns `Some(canonical_handler)` if this driver recognizes `handler`.
    fn recognizes(&self, handler: &str) -> bool;
    fn open(&self, handler: &str, flags: IosFlags) -> Result<Box<dyn IoDevice>, IosError>;
}

#[derive(Debug)]
struct MemoryDevice {
    buf: Rc<RefCell<Vec<u8>>>,
}

impl IoDevice for MemoryDevice {
    fn pread(&mut self, buf: &mut [u8], offset_bits: u64) -> Result<(), IosError> {
        let (offset, len) = bit_range_to_bytes(offset_bits, buf.len())?;
        let src = self.buf.borrow();
        let end = offset + len;
        if end > src.len() {
            return Err(IosError::Eof);
        }
        buf.copy_from_slice(&src[offset..end]);
        Ok(())
    }

    fn pwrite(&mut self, buf: &[u8], offset_bits: u64) -> Result<(), IosError> {
        let (offset, len) = bit_range_to_bytes(offset_bits, buf.len())?;
        let mut dst = self.buf.borrow_mut();
        let end = offset + len;
        if end > dst.len() {
            dst.resize(end, 0);
        }
        dst[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn size_bits(&self) -> u64 {
        self.buf.borrow().len() as u64 * 8
    }

    fn flush(&mut self) -> Result<(), IosError> {
        Ok(())
    }
}

/// `memory://<name>` — an in-process growable byte buffer. Each distinct
/// `name` opened for the first time gets a fresh, empty buffer; opening the
/// same name again while it is still registered would be a `search` hit
/// handled by the registry, not by this driver.
pub struct MemoryIod;

impl Iod for MemoryIod {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn recognizes(&self, handler: &str) -> bool {
        handler.starts_with("memory://")
    }

    fn open(&self, _handler: &str, _flags: IosFlags) -> Result<Box<dyn IoDevice>, IosError> {
        Ok(Box::new(MemoryDevice {
            buf: Rc::new(RefCell::new(Vec::new())),
        }))
    }
}

#[derive(Debug)]
struct FileDevice {
    file: File,
}

impl IoDevice for FileDevice {
    fn pread(&mut self, buf: &mut [u8], offset_bits: u64) -> Result<(), IosError> {
        let (offset, _len) = bit_range_to_bytes(offset_bits, buf.len())?;
        self.file
            .seek(SeekFrom::Start(offset as u64))
            .map_err(|_| IosError::Error)?;
        self.file.read_exact(buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                IosError::Eof
            } else {
                IosError::Error
            }
        })
    }

    fn pwrite(&mut self, buf: &[u8], offset_bits: u64) -> Result<(), IosError> {
        let (offset, _len) = bit_range_to_bytes(offset_bits, buf.len())?;
        self.file
            .seek(SeekFrom::Start(offset as u64))
            .map_err(|_| IosError::Error)?;
        self.file.write_all(buf).map_err(|_| IosError::Error)
    }

    fn size_bits(&self) -> u64 {
        self.file.metadata().map(|m| m.len() * 8).unwrap_or(0)
    }

    fn flush(&mut self) -> Result<(), IosError> {
        self.file.flush().map_err(|_| IosError::Error)
    }
}

/// `file://<path>` — a real file on disk.
pub struct FileIod;

impl Iod for FileIod {
    fn name(&self) -> &'static str {
        "file"
    }

    fn recognizes(&self, handler: &str) -> bool {
        handler.starts_with("file://")
    }

    fn open(&self, handler: &str, flags: IosFlags) -> Result<Box<dyn IoDevice>, IosError> {
        let path = handler.strip_prefix("file://").unwrap_or(handler);
        let file = OpenOptions::new()
            .read(true)
            .write(flags.has(IosFlags::WRITE))
            .create(flags.has(IosFlags::CREATE))
            .truncate(flags.has(IosFlags::TRUNCATE))
            .open(path)
            .map_err(|_| IosError::Eopen(handler.to_string()))?;
        Ok(Box::new(FileDevice { file }))
    }
}

fn bit_range_to_bytes(offset_bits: u64, len_bytes: usize) -> Result<(usize, usize), IosError> {
    if offset_bits % 8 != 0 {
        return Err(IosError::Einval);
    }
    Ok(((offset_bits / 8) as usize, len_bytes))
}

type SharedDevice = Rc<RefCell<Box<dyn IoDevice>>>;

struct SubDevice {
    base: SharedDevice,
    base_offset_bits: u64,
    size_bits: u64,
}

impl std::fmt::Debug for SubDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SubDevice(base_offset_bits={})", self.base_offset_bits)
    }
}

impl IoDevice for SubDevice {
    fn pread(&mut self, buf: &mut [u8], offset_bits: u64) -> Result<(), IosError> {
        if offset_bits + (buf.len() as u64 * 8) > self.size_bits {
            return Err(IosError::Eof);
        }
        self.base
            .borrow_mut()
            .pread(buf, self.base_offset_bits + offset_bits)
    }

    fn pwrite(&mut self, buf: &[u8], offset_bits: u64) -> Result<(), IosError> {
        if offset_bits + (buf.len() as u64 * 8) > self.size_bits {
            return Err(IosError::Eof);
        }
        self.base
            .borrow_mut()
            .pwrite(buf, self.base_offset_bits + offset_bits)
    }

    fn size_bits(&self) -> u64 {
        self.size_bits
    }

    fn flush(&mut self) -> Result<(), IosError> {
        self.base.borrow_mut().flush()
    }
}

struct IosEntry {
    handler: String,
    flags: IosFlags,
    bias: u64,
    device: SharedDevice,
    base_id: Option<IosId>,
}

/// The registry of open IO spaces for one compiler instance.
pub struct IosRegistry {
    drivers: Vec<Box<dyn Iod>>,
    spaces: HashMap<IosId, IosEntry>,
    next_id: IosId,
    current: Option<IosId>,
}

impl Default for IosRegistry {
    fn default() -> Self {
        let mut reg = IosRegistry {
            drivers: Vec::new(),
            spaces: HashMap::new(),
            next_id: 0,
            current: None,
        };
        reg.register_iod(Box::new(MemoryIod));
        reg.register_iod(Box::new(FileIod));
        reg
    }
}

/// Handler grammar for a sub-space: `sub://<base_id>/<hex_base>/<hex_size>/<name>`.
fn parse_sub_handler(handler: &str) -> Option<(IosId, u64, u64, &str)> {
    let rest = handler.strip_prefix("sub://")?;
    let mut parts = rest.splitn(4, '/');
    let base_id: IosId = parts.next()?.parse().ok()?;
    let base = u64::from_str_radix(parts.next()?.trim_start_matches("0x"), 16).ok()?;
    let size = u64::from_str_radix(parts.next()?.trim_start_matches("0x"), 16).ok()?;
    let name = parts.next().unwrap_or("");
    Some((base_id, base, size, name))
}

impl IosRegistry {
    pub fn register_iod(&mut self, iod: Box<dyn Iod>) {
        self.drivers.push(iod);
    }

    pub fn open(
        &mut self,
        handler: &str,
        flags: IosFlags,
        set_cur: bool,
    ) -> Result<IosId, IosError> {
        let device: SharedDevice = if let Some((base_id, base, size, _name)) =
            parse_sub_handler(handler)
        {
            let base_entry = self.spaces.get(&base_id).ok_or(IosError::NoIos)?;
            Rc::new(RefCell::new(Box::new(SubDevice {
                base: base_entry.device.clone(),
                base_offset_bits: base,
                size_bits: size,
            })))
        } else {
            let driver = self
                .drivers
                .iter()
                .find(|d| d.recognizes(handler))
                .ok_or_else(|| IosError::Eopen(handler.to_string()))?;
            Rc::new(RefCell::new(driver.open(handler, flags)?))
        };

        let base_id = parse_sub_handler(handler).map(|(b, _, _, _)| b);
        let id = self.next_id;
        self.next_id += 1;
        self.spaces.insert(
            id,
            IosEntry {
                handler: handler.to_string(),
                flags,
                bias: 0,
                device,
                base_id,
            },
        );
        if set_cur {
            self.current = Some(id);
        }
        Ok(id)
    }

    /// Closes `io`, and recursively every open space whose handler begins
    /// `sub://<io>/`.
    pub fn close(&mut self, io: IosId) {
        let children: Vec<IosId> = self
            .spaces
            .iter()
            .filter(|(_, e)| e.base_id == Some(io))
            .map(|(id, _)| *id)
            .collect();
        for child in children {
            self.close(child);
        }
        self.spaces.remove(&io);
        if self.current == Some(io) {
            self.current = None;
        }
    }

    pub fn cur(&self) -> Option<IosId> {
        self.current
    }

    pub fn set_cur(&mut self, io: IosId) -> Result<(), IosError> {
        if !self.spaces.contains_key(&io) {
            return Err(IosError::NoIos);
        }
        self.current = Some(io);
        Ok(())
    }

    pub fn search(&self, handler: &str) -> Option<IosId> {
        self.spaces
            .iter()
            .find(|(_, e)| e.handler == handler)
            .map(|(id, _)| *id)
    }

    pub fn search_by_id(&self, id: IosId) -> Option<IosId> {
        self.spaces.contains_key(&id).then_some(id)
    }

    pub fn handler(&self, io: IosId) -> Option<&str> {
        self.spaces.get(&io).map(|e| e.handler.as_str())
    }

    pub fn size_bits(&self, io: IosId) -> Option<u64> {
        self.spaces.get(&io).map(|e| e.device.borrow().size_bits())
    }

    pub fn flags(&self, io: IosId) -> Option<IosFlags> {
        self.spaces.get(&io).map(|e| e.flags)
    }

    pub fn bias(&self, io: IosId) -> Option<u64> {
        self.spaces.get(&io).map(|e| e.bias)
    }

    pub fn map<F: FnMut(IosId)>(&self, mut callback: F) {
        for id in self.spaces.keys() {
            callback(*id);
        }
    }

    pub fn pread(&self, io: IosId, buf: &mut [u8], offset_bits: u64) -> Result<(), IosError> {
        let entry = self.spaces.get(&io).ok_or(IosError::NoIos)?;
        entry
            .device
            .borrow_mut()
            .pread(buf, entry.bias + offset_bits)
    }

    pub fn pwrite(&self, io: IosId, buf: &[u8], offset_bits: u64) -> Result<(), IosError> {
        let entry = self.spaces.get(&io).ok_or(IosError::NoIos)?;
        entry
            .device
            .borrow_mut()
            .pwrite(buf, entry.bias + offset_bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_ios_roundtrips_through_registry() {
        let mut reg = IosRegistry::default();
        let id = reg
            .open("memory://scratch", IosFlags(IosFlags::READ | IosFlags::WRITE), true)
            .unwrap();
        reg.pwrite(id, &0xdeadbeefu32.to_le_bytes(), 0).unwrap();
        let mut buf = [0u8; 4];
        reg.pread(id, &mut buf, 0).unwrap();
        assert_eq!(u32::from_le_bytes(buf), 0xdeadbeef);
    }

    #[test]
    fn sub_ios_bounds_and_offset() {
        let mut reg = IosRegistry::default();
        let base = reg.open("memory://base", IosFlags(IosFlags::WRITE), false).unwrap();
        reg.pwrite(base, &[1, 2, 3, 4, 5, 6, 7, 8], 0).unwrap();
        let sub_handler = format!("sub://{base}/0x8/0x4/window");
        let sub = reg.open(&sub_handler, IosFlags::default(), false).unwrap();
        let mut buf = [0u8; 4];
        reg.pread(sub, &mut buf, 0).unwrap();
        assert_eq!(buf, [5, 6, 7, 8]);
        // reading past `size` on the sub-IOS is EOF, not a read into the base
        let mut out = [0u8; 4];
        assert_eq!(reg.pread(sub, &mut out, 8).unwrap_err(), IosError::Eof);
    }

    #[test]
    fn closing_base_closes_subspaces() {
        let mut reg = IosRegistry::default();
        let base = reg.open("memory://base", IosFlags::default(), false).unwrap();
        let s1 = reg
            .open(&format!("sub://{base}/0x0/0x4/a"), IosFlags::default(), false)
            .unwrap();
        let s2 = reg
            .open(&format!("sub://{base}/0x4/0x4/b"), IosFlags::default(), false)
            .unwrap();
        reg.close(base);
        assert!(reg.search_by_id(base).is_none());
        assert!(reg.search_by_id(s1).is_none());
        assert!(reg.search_by_id(s2).is_none());
    }

    #[test]
    fn file_ios_roundtrips() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap().to_string();
        let mut reg = IosRegistry::default();
        let id = reg
            .open(
                &format!("file://{path}"),
                IosFlags(IosFlags::READ | IosFlags::WRITE),
                true,
            )
            .unwrap();
        reg.pwrite(id, b"poke", 0).unwrap();
        let mut buf = [0u8; 4];
        reg.pread(id, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"poke");
    }

    #[test]
    fn endianness_roundtrip_le_vs_be() {
        let mut reg = IosRegistry::default();
        let id = reg.open("memory://e", IosFlags(IosFlags::WRITE), false).unwrap();
        reg.pwrite(id, &0x1234u16.to_le_bytes(), 0).unwrap();
        let mut buf = [0u8; 2];
        reg.pread(id, &mut buf, 0).unwrap();
        assert_eq!(buf, [0x34, 0x12]);

        let id2 = reg.open("memory://e2", IosFlags(IosFlags::WRITE), false).unwrap();
        reg.pwrite(id2, &0x1234u16.to_be_bytes(), 0).unwrap();
        let mut buf2 = [0u8; 2];
        reg.pread(id2, &mut buf2, 0).unwrap();
        assert_eq!(buf2, [0x12, 0x34]);
    }
}
