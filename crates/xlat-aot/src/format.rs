//! On-disk layout of one module's AOT cache file (all integers little endian):
//!
//! ```text
//! magic:8
//! record*         { guest_start:8, guest_len:8, hash:8, ra_data, ir }
//! zero padding    to a 32 byte boundary
//! index           { count:8, base:8, { guest_start:8, data_offset:8 }*count }
//! index_size:8
//! module name bytes
//! name_len:8
//! ```
//!
//! `base` is the two's complement negation of the index position, so `index_pos + base +
//! data_offset` is the file offset of a record. Index entries are sorted by `guest_start`.

use std::collections::BTreeMap;
use std::io::Write;

use crate::error::{AotError, Result};

pub const AOT_MAGIC: [u8; 8] = *b"XLATAOT1";

pub const INDEX_ALIGN: u64 = 32;
pub const INDEX_ENTRY_SIZE: u64 = 16;
/// `count` and `base`.
pub const INDEX_HEADER_SIZE: u64 = 16;
/// `guest_start`, `guest_len` and `hash`.
pub const RECORD_HEADER_SIZE: usize = 24;

pub trait WriteLeExt: Write {
    fn write_u64_le(&mut self, v: u64) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_all(bytes)?;
        Ok(())
    }
}

impl<T: Write + ?Sized> WriteLeExt for T {}

/// One cached translation, as stored in a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Module-relative guest address.
    pub guest_start: u64,
    pub guest_len: u64,
    /// xxh3 of the guest bytes the IR was built from.
    pub hash: u64,
    pub ra_data: Vec<u8>,
    pub ir: Vec<u8>,
}

impl Record {
    pub fn encoded_len(&self) -> u64 {
        (RECORD_HEADER_SIZE + self.ra_data.len() + self.ir.len()) as u64
    }

    pub fn write_to<W: Write + ?Sized>(&self, out: &mut W) -> Result<()> {
        out.write_u64_le(self.guest_start)?;
        out.write_u64_le(self.guest_len)?;
        out.write_u64_le(self.hash)?;
        out.write_bytes(&self.ra_data)?;
        out.write_bytes(&self.ir)?;
        Ok(())
    }
}

/// Writes padding, the index and the trailer. `pos` is the current stream position; returns the
/// number of bytes written.
pub fn write_trailer<W: Write + ?Sized>(
    out: &mut W,
    pos: u64,
    index: &BTreeMap<u64, u64>,
    module: &str,
) -> Result<u64> {
    let pad = (INDEX_ALIGN - pos % INDEX_ALIGN) % INDEX_ALIGN;
    out.write_bytes(&[0u8; INDEX_ALIGN as usize][..pad as usize])?;

    let index_pos = pos + pad;
    let count = index.len() as u64;
    out.write_u64_le(count)?;
    out.write_u64_le(index_pos.wrapping_neg())?;
    for (&guest_start, &data_offset) in index {
        out.write_u64_le(guest_start)?;
        out.write_u64_le(data_offset)?;
    }

    let index_size = INDEX_HEADER_SIZE + count * INDEX_ENTRY_SIZE;
    out.write_u64_le(index_size)?;
    out.write_bytes(module.as_bytes())?;
    out.write_u64_le(module.len() as u64)?;

    Ok(pad + index_size + 8 + module.len() as u64 + 8)
}

/// Trailer fields located from the end of a complete file image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Trailer {
    pub index_pos: usize,
    pub count: usize,
    pub base: u64,
    pub module_pos: usize,
    pub module_len: usize,
}

pub(crate) fn read_u64(bytes: &[u8], at: usize) -> Result<u64> {
    let raw = at
        .checked_add(8)
        .and_then(|end| bytes.get(at..end))
        .ok_or(AotError::Corrupt("read past end of file"))?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(raw);
    Ok(u64::from_le_bytes(buf))
}

pub(crate) fn parse_trailer(bytes: &[u8]) -> Result<Trailer> {
    if bytes.len() < AOT_MAGIC.len() || bytes[..AOT_MAGIC.len()] != AOT_MAGIC {
        return Err(AotError::InvalidMagic);
    }
    let len = bytes.len();
    let module_len = usize::try_from(read_u64(bytes, len.saturating_sub(8))?)
        .map_err(|_| AotError::Corrupt("module name length"))?;
    let module_pos = len
        .checked_sub(8)
        .and_then(|n| n.checked_sub(module_len))
        .ok_or(AotError::Corrupt("module name length"))?;
    let index_size_pos = module_pos
        .checked_sub(8)
        .ok_or(AotError::Corrupt("missing index size"))?;
    let index_size = usize::try_from(read_u64(bytes, index_size_pos)?)
        .map_err(|_| AotError::Corrupt("index size"))?;
    let index_pos = index_size_pos
        .checked_sub(index_size)
        .filter(|&p| p >= AOT_MAGIC.len())
        .ok_or(AotError::Corrupt("index size"))?;

    let count = usize::try_from(read_u64(bytes, index_pos)?)
        .map_err(|_| AotError::Corrupt("index count"))?;
    let expected = count
        .checked_mul(INDEX_ENTRY_SIZE as usize)
        .and_then(|n| n.checked_add(INDEX_HEADER_SIZE as usize));
    if expected != Some(index_size) {
        return Err(AotError::Corrupt("index size does not match entry count"));
    }
    let base = read_u64(bytes, index_pos + 8)?;

    Ok(Trailer {
        index_pos,
        count,
        base,
        module_pos,
        module_len,
    })
}

impl Trailer {
    pub fn entry(&self, bytes: &[u8], i: usize) -> Result<(u64, u64)> {
        let at = self.index_pos + INDEX_HEADER_SIZE as usize + i * INDEX_ENTRY_SIZE as usize;
        Ok((read_u64(bytes, at)?, read_u64(bytes, at + 8)?))
    }

    /// Binary search over the sorted index.
    pub fn find(&self, bytes: &[u8], guest_start: u64) -> Result<Option<usize>> {
        let (mut lo, mut hi) = (0usize, self.count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let (start, _) = self.entry(bytes, mid)?;
            match start.cmp(&guest_start) {
                std::cmp::Ordering::Equal => return Ok(Some(mid)),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        Ok(None)
    }

    /// File offset of the record with index entry `data_offset`.
    pub fn record_pos(&self, data_offset: u64) -> Result<usize> {
        let pos = (self.index_pos as u64)
            .wrapping_add(self.base)
            .wrapping_add(data_offset);
        usize::try_from(pos)
            .ok()
            .filter(|&p| p >= AOT_MAGIC.len() && p < self.index_pos)
            .ok_or(AotError::Corrupt("record offset outside the record area"))
    }

    pub fn module<'a>(&self, bytes: &'a [u8]) -> Result<&'a str> {
        let raw = &bytes[self.module_pos..self.module_pos + self.module_len];
        std::str::from_utf8(raw).map_err(|_| AotError::Corrupt("module name is not utf-8"))
    }
}
