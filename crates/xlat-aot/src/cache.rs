use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bitflags::bitflags;
use xxhash_rust::xxh3::xxh3_64;

use xlat_ir::IrContainer;
use xlat_regalloc::RegisterAllocationData;

use crate::error::Result;
use crate::format::Record;
use crate::queue::{WriteQueue, DEFAULT_FLUSH_THRESHOLD};
use crate::reader::{AotEntry, AotModule};
use crate::writer::AotFileWriter;

pub const AOT_EXTENSION: &str = "aotir";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AotConfig {
    /// Directory holding `<file id>.aotir` files and per-process parts.
    pub dir: PathBuf,
    /// Queue length past which a store triggers a background flush.
    pub flush_threshold: usize,
    pub load: bool,
    pub store: bool,
}

impl Default for AotConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("aotir"),
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            load: true,
            store: false,
        }
    }
}

bitflags! {
    /// Translation settings that change the generated IR. Files built under different settings
    /// get different ids.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct FileIdFlags: u32 {
        const SMC_FULL = 1 << 0;
        const TSO = 1 << 1;
        const ABI_LOCAL_FLAGS = 1 << 2;
        const ABI_NO_PF = 1 << 3;
    }
}

impl FileIdFlags {
    fn letters(self) -> String {
        let pick = |flag, set, clear| if self.contains(flag) { set } else { clear };
        [
            pick(Self::SMC_FULL, 'S', 's'),
            pick(Self::TSO, 'T', 't'),
            pick(Self::ABI_LOCAL_FLAGS, 'L', 'l'),
            pick(Self::ABI_NO_PF, 'p', 'P'),
        ]
        .into_iter()
        .collect()
    }
}

/// `<basename>-<xxh3 of the full path>-<flag letters>`.
pub fn file_id(path: &Path, flags: FileIdFlags) -> String {
    let base = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let hash = xxh3_64(path.as_os_str().as_bytes());
    format!("{base}-{hash}-{}", flags.letters())
}

/// Read access to live guest memory, used to hash guest code.
pub trait GuestMemory {
    fn read(&self, addr: u64, len: usize) -> Option<&[u8]>;
}

/// Guest memory backed by one contiguous slice starting at `base`.
#[derive(Debug, Clone, Copy)]
pub struct FlatMemory<'a> {
    pub base: u64,
    pub bytes: &'a [u8],
}

impl GuestMemory for FlatMemory<'_> {
    fn read(&self, addr: u64, len: usize) -> Option<&[u8]> {
        let start = usize::try_from(addr.checked_sub(self.base)?).ok()?;
        self.bytes.get(start..start.checked_add(len)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MappedRegion {
    file_id: String,
    start: u64,
    end: u64,
    /// Module offset that `start` corresponds to.
    offset: u64,
}

impl MappedRegion {
    fn module_offset(&self, guest: u64) -> u64 {
        guest - self.start + self.offset
    }
}

#[derive(Debug)]
struct PendingStore {
    file_id: String,
    record: Record,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Process-wide persistent IR cache.
///
/// Guest code regions are registered with [`AotCache::add_mapped_region`]; each region belongs
/// to a module whose cache file is loaded on first sight. Lookups are shared-lock reads over the
/// mapped files. Stores go through a [`WriteQueue`] and are appended to per-process part files,
/// which [`AotCache::shutdown`] merges into the module's main file.
#[derive(Debug)]
pub struct AotCache {
    config: AotConfig,
    modules: RwLock<HashMap<String, Arc<AotModule>>>,
    regions: RwLock<BTreeMap<u64, MappedRegion>>,
    writers: Mutex<HashMap<String, AotFileWriter>>,
    queue: WriteQueue<PendingStore>,
}

/// Distinguishes part files written by several caches in one process.
static PART_SEQ: AtomicU64 = AtomicU64::new(0);

impl AotCache {
    pub fn new(config: AotConfig) -> Self {
        let queue = WriteQueue::new(config.flush_threshold);
        Self {
            config,
            modules: RwLock::new(HashMap::new()),
            regions: RwLock::new(BTreeMap::new()),
            writers: Mutex::new(HashMap::new()),
            queue,
        }
    }

    pub fn config(&self) -> &AotConfig {
        &self.config
    }

    pub fn module_path(&self, file_id: &str) -> PathBuf {
        self.config.dir.join(format!("{file_id}.{AOT_EXTENSION}"))
    }

    pub fn loaded_modules(&self) -> usize {
        read(&self.modules).len()
    }

    pub fn pending_stores(&self) -> usize {
        self.queue.len()
    }

    /// Registers guest range `[start, end)` as the mapping of `path` at file offset `offset`,
    /// loading the module's cache file if loading is enabled. Returns the module's file id.
    pub fn add_mapped_region(
        &self,
        path: &Path,
        flags: FileIdFlags,
        start: u64,
        end: u64,
        offset: u64,
    ) -> String {
        let id = file_id(path, flags);
        write(&self.regions).insert(
            start,
            MappedRegion {
                file_id: id.clone(),
                start,
                end,
                offset,
            },
        );
        if self.config.load {
            self.load_module(&id);
        }
        id
    }

    pub fn remove_mapped_region(&self, start: u64) -> bool {
        write(&self.regions).remove(&start).is_some()
    }

    fn load_module(&self, id: &str) {
        if read(&self.modules).contains_key(id) {
            return;
        }
        let path = self.module_path(id);
        if !path.exists() {
            return;
        }
        match AotModule::open_for(&path, id) {
            Ok(module) => {
                tracing::info!(module = id, entries = module.len(), "loaded AOT cache file");
                write(&self.modules)
                    .entry(id.to_owned())
                    .or_insert_with(|| Arc::new(module));
            }
            Err(err) => {
                tracing::warn!(module = id, path = %path.display(), %err, "ignoring AOT cache file")
            }
        }
    }

    fn region_for(&self, guest: u64) -> Option<MappedRegion> {
        read(&self.regions)
            .range(..=guest)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| guest < region.end)
            .cloned()
    }

    /// Cached translation starting at `guest`, if one exists and the live guest bytes still
    /// hash to the stored value.
    pub fn lookup(&self, guest: u64, mem: &dyn GuestMemory) -> Option<AotEntry> {
        let region = self.region_for(guest)?;
        let module = read(&self.modules).get(&region.file_id).cloned()?;

        let entry = match module.find(region.module_offset(guest)) {
            Ok(entry) => entry?,
            Err(err) => {
                tracing::warn!(module = %region.file_id, guest, %err, "corrupt AOT cache entry");
                return None;
            }
        };
        let len = usize::try_from(entry.guest_len).ok()?;
        let hash = xxh3_64(mem.read(guest, len)?);
        if hash != entry.hash {
            tracing::warn!(
                module = %region.file_id,
                guest,
                stored = entry.hash,
                live = hash,
                "AOT cache hash mismatch, recompiling"
            );
            return None;
        }
        Some(entry)
    }

    /// Queues a translation of `[guest, guest + guest_len)` for writing. When the queue passes
    /// its threshold, one caller spawns a background flush. Returns whether the store was queued.
    pub fn store(
        self: &Arc<Self>,
        guest: u64,
        guest_len: u64,
        mem: &dyn GuestMemory,
        ir: &IrContainer,
        ra: &RegisterAllocationData,
    ) -> bool {
        if !self.config.store {
            return false;
        }
        let Some(region) = self.region_for(guest) else {
            return false;
        };
        let Some(bytes) = usize::try_from(guest_len)
            .ok()
            .and_then(|len| mem.read(guest, len))
        else {
            return false;
        };
        let hash = xxh3_64(bytes);
        let guest_start = region.module_offset(guest);

        let cached = read(&self.modules).get(&region.file_id).cloned();
        if let Some(module) = cached {
            if matches!(module.find(guest_start), Ok(Some(e)) if e.hash == hash) {
                return false;
            }
        }

        let pending = PendingStore {
            file_id: region.file_id,
            record: Record {
                guest_start,
                guest_len,
                hash,
                ra_data: ra.to_bytes(),
                ir: ir.to_bytes(),
            },
        };
        if self.queue.push(pending) {
            let cache = Arc::clone(self);
            let spawned = std::thread::Builder::new()
                .name("aot-flush".into())
                .spawn(move || cache.flush());
            if let Err(err) = spawned {
                tracing::warn!(%err, "failed to spawn AOT flush thread, flushing inline");
                self.flush();
            }
        }
        true
    }

    /// Drains the queue into the per-module part files. Returns the number of records drained.
    pub fn flush(&self) -> usize {
        let mut writers = lock(&self.writers);
        let drained = self.queue.flush(|pending| {
            if let Err(err) = self.append(&mut writers, &pending) {
                tracing::warn!(module = %pending.file_id, %err, "dropping AOT cache part file");
                writers.remove(&pending.file_id);
            }
        });
        if drained > 0 {
            tracing::debug!(records = drained, "flushed AOT store queue");
        }
        drained
    }

    fn append(
        &self,
        writers: &mut HashMap<String, AotFileWriter>,
        pending: &PendingStore,
    ) -> Result<()> {
        if !writers.contains_key(&pending.file_id) {
            fs::create_dir_all(&self.config.dir)?;
            let seq = PART_SEQ.fetch_add(1, Ordering::Relaxed);
            let part = self.config.dir.join(format!(
                "{}.{AOT_EXTENSION}.{}-{seq}",
                pending.file_id,
                std::process::id()
            ));
            let writer = AotFileWriter::create(part, pending.file_id.clone())?;
            writers.insert(pending.file_id.clone(), writer);
        }
        if let Some(writer) = writers.get_mut(&pending.file_id) {
            writer.append(&pending.record)?;
        }
        Ok(())
    }

    /// Flushes the queue, finishes every part file, and merges each touched module into its
    /// main cache file. Returns the merged file paths.
    pub fn shutdown(&self) -> Result<Vec<PathBuf>> {
        self.flush();
        let writers = std::mem::take(&mut *lock(&self.writers));
        let mut merged = Vec::new();
        for (id, writer) in writers {
            writer.finish()?;
            merged.push(merge_module(&self.config.dir, &id)?);
        }
        Ok(merged)
    }
}

fn part_file_id(name: &str) -> Option<&str> {
    if name.ends_with(".tmp") {
        return None;
    }
    let (id, tag) = name.rsplit_once(&format!(".{AOT_EXTENSION}."))?;
    (!tag.is_empty()).then_some(id)
}

/// Merges every part file in `dir` into its module's main file. Returns the merged file paths.
pub fn merge(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut ids = Vec::new();
    for dirent in fs::read_dir(dir)? {
        let name = dirent?.file_name();
        if let Some(id) = part_file_id(&name.to_string_lossy()) {
            ids.push(id.to_owned());
        }
    }
    ids.sort_unstable();
    ids.dedup();
    ids.iter().map(|id| merge_module(dir, id)).collect()
}

/// Combines `<id>.aotir` with all of its part files. Records are keyed by guest start. The main
/// file is read first, then parts from oldest to newest modification time, and each file's
/// record replaces any earlier one for the same guest start. Part files are removed.
pub fn merge_module(dir: &Path, id: &str) -> Result<PathBuf> {
    let main = dir.join(format!("{id}.{AOT_EXTENSION}"));

    let mut parts = Vec::new();
    for dirent in fs::read_dir(dir)? {
        let dirent = dirent?;
        if part_file_id(&dirent.file_name().to_string_lossy()) == Some(id) {
            let modified = dirent.metadata()?.modified()?;
            parts.push((modified, dirent.path()));
        }
    }
    parts.sort();

    let mut records: BTreeMap<u64, Record> = BTreeMap::new();
    let sources = main
        .exists()
        .then(|| main.clone())
        .into_iter()
        .chain(parts.iter().map(|(_, p)| p.clone()));
    for source in sources {
        let module = match AotModule::open_for(&source, id) {
            Ok(module) => module,
            Err(err) => {
                tracing::warn!(path = %source.display(), %err, "skipping unreadable AOT cache file");
                continue;
            }
        };
        for entry in module.entries() {
            match entry {
                Ok(entry) => {
                    records.insert(entry.guest_start, entry.to_record());
                }
                Err(err) => {
                    tracing::warn!(path = %source.display(), %err, "skipping corrupt AOT entry");
                }
            }
        }
    }

    let mut writer = AotFileWriter::create(&main, id)?;
    for record in records.values() {
        writer.append(record)?;
    }
    let path = writer.finish()?;

    for (_, part) in parts {
        if let Err(err) = fs::remove_file(&part) {
            tracing::warn!(path = %part.display(), %err, "failed to remove merged part file");
        }
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_id_encodes_flags() {
        let path = Path::new("/usr/lib/libc.so.6");
        let id = file_id(path, FileIdFlags::TSO);
        assert!(id.starts_with("libc.so.6-"));
        assert!(id.ends_with("-sTlP"), "{id}");
        let all = file_id(path, FileIdFlags::all());
        assert!(all.ends_with("-STLp"), "{all}");
        assert_ne!(id, file_id(Path::new("/opt/libc.so.6"), FileIdFlags::TSO));
    }

    #[test]
    fn part_file_names_are_recognised() {
        assert_eq!(part_file_id("a.so-1-stlP.aotir.12-0"), Some("a.so-1-stlP"));
        assert_eq!(part_file_id("a.so-1-stlP.aotir"), None);
        assert_eq!(part_file_id("a.so-1-stlP.aotir.12-0.tmp"), None);
    }

    #[test]
    fn flat_memory_bounds() {
        let bytes = [1u8, 2, 3, 4];
        let mem = FlatMemory {
            base: 0x100,
            bytes: &bytes,
        };
        assert_eq!(mem.read(0x101, 2), Some(&bytes[1..3]));
        assert_eq!(mem.read(0x103, 2), None);
        assert_eq!(mem.read(0xff, 1), None);
    }
}
