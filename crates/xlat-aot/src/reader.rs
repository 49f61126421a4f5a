use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::Path;

use xlat_ir::IrContainer;
use xlat_regalloc::RegisterAllocationData;

use crate::error::{AotError, Result};
use crate::format::{self, Record, Trailer, RECORD_HEADER_SIZE};

/// Read-only private mapping of a whole file.
struct Mapping {
    ptr: *mut libc::c_void,
    len: usize,
}

// SAFETY: the mapping is PROT_READ and private, nothing writes through `ptr`, and unmapping
// happens only in `Drop` with exclusive access.
unsafe impl Send for Mapping {}
// SAFETY: as above; shared access only ever reads.
unsafe impl Sync for Mapping {}

impl Mapping {
    fn map(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = usize::try_from(file.metadata()?.len())
            .map_err(|_| AotError::Corrupt("file too large to map"))?;
        if len == 0 {
            return Err(AotError::InvalidMagic);
        }
        // SAFETY: a fresh read-only private mapping of an open descriptor with a non-zero
        // length; the result is checked against MAP_FAILED below.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(AotError::Map {
                path: path.to_owned(),
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(Self { ptr, len })
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: `ptr` is a live PROT_READ mapping of exactly `len` bytes until drop.
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: `ptr` and `len` are exactly what mmap returned, and no slice from `bytes`
        // outlives `self`.
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}

enum Backing {
    Mapped(Mapping),
    Owned(Vec<u8>),
}

impl Backing {
    fn bytes(&self) -> &[u8] {
        match self {
            Backing::Mapped(m) => m.bytes(),
            Backing::Owned(v) => v,
        }
    }
}

/// A record decoded from a cache file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AotEntry {
    pub guest_start: u64,
    pub guest_len: u64,
    pub hash: u64,
    pub ra_data: RegisterAllocationData,
    pub ir: IrContainer,
    /// The serialized IR exactly as stored.
    pub ir_bytes: Vec<u8>,
}

impl AotEntry {
    pub fn to_record(&self) -> Record {
        Record {
            guest_start: self.guest_start,
            guest_len: self.guest_len,
            hash: self.hash,
            ra_data: self.ra_data.to_bytes(),
            ir: self.ir_bytes.clone(),
        }
    }
}

/// One loaded cache file. Lookups go straight to the mapped bytes; nothing is parsed up front
/// besides the fixed-size trailer fields.
pub struct AotModule {
    backing: Backing,
    trailer: Trailer,
}

impl std::fmt::Debug for AotModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AotModule")
            .field("module", &self.module())
            .field("entries", &self.len())
            .finish()
    }
}

impl AotModule {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mapping = Mapping::map(path.as_ref())?;
        let trailer = format::parse_trailer(mapping.bytes())?;
        Ok(Self {
            backing: Backing::Mapped(mapping),
            trailer,
        })
    }

    /// Opens `path` and checks that it was written for `file_id`.
    pub fn open_for(path: impl AsRef<Path>, file_id: &str) -> Result<Self> {
        let module = Self::open(path)?;
        let found = module.module();
        if found != file_id {
            return Err(AotError::ModuleMismatch {
                expected: file_id.to_owned(),
                found: found.to_owned(),
            });
        }
        Ok(module)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let trailer = format::parse_trailer(&bytes)?;
        Ok(Self {
            backing: Backing::Owned(bytes),
            trailer,
        })
    }

    pub fn module(&self) -> &str {
        self.trailer.module(self.backing.bytes()).unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.trailer.count
    }

    pub fn is_empty(&self) -> bool {
        self.trailer.count == 0
    }

    /// Looks up the record starting at module-relative `guest_start`.
    pub fn find(&self, guest_start: u64) -> Result<Option<AotEntry>> {
        let bytes = self.backing.bytes();
        let Some(i) = self.trailer.find(bytes, guest_start)? else {
            return Ok(None);
        };
        self.decode(i).map(Some)
    }

    /// Every entry in index order.
    pub fn entries(&self) -> impl Iterator<Item = Result<AotEntry>> + '_ {
        (0..self.trailer.count).map(move |i| self.decode(i))
    }

    fn decode(&self, i: usize) -> Result<AotEntry> {
        let bytes = self.backing.bytes();
        let (indexed_start, data_offset) = self.trailer.entry(bytes, i)?;
        let pos = self.trailer.record_pos(data_offset)?;
        let guest_start = format::read_u64(bytes, pos)?;
        if guest_start != indexed_start {
            return Err(AotError::Corrupt("record does not match its index entry"));
        }
        let guest_len = format::read_u64(bytes, pos + 8)?;
        let hash = format::read_u64(bytes, pos + 16)?;

        let body = bytes
            .get(pos + RECORD_HEADER_SIZE..self.trailer.index_pos)
            .ok_or(AotError::Corrupt("record header overlaps the index"))?;
        let (ra_data, ra_len) = RegisterAllocationData::deserialize(body)?;
        let (ir, ir_len) = IrContainer::deserialize(&body[ra_len..])?;
        let ir_bytes = body[ra_len..ra_len + ir_len].to_vec();

        Ok(AotEntry {
            guest_start,
            guest_len,
            hash,
            ra_data,
            ir,
            ir_bytes,
        })
    }
}
