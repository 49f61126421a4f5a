use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::format::{self, Record, WriteLeExt, AOT_MAGIC};

/// Streams records for one module into a temporary file; [`AotFileWriter::finish`] appends the
/// index and trailer and renames the file into place.
pub struct AotFileWriter {
    out: BufWriter<File>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    module: String,
    pos: u64,
    index: BTreeMap<u64, u64>,
}

impl std::fmt::Debug for AotFileWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AotFileWriter")
            .field("path", &self.final_path)
            .field("module", &self.module)
            .field("records", &self.index.len())
            .finish()
    }
}

impl AotFileWriter {
    pub fn create(final_path: impl Into<PathBuf>, module: impl Into<String>) -> Result<Self> {
        let final_path = final_path.into();
        let mut tmp_name = final_path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let mut out = BufWriter::new(File::create(&tmp_path)?);
        out.write_bytes(&AOT_MAGIC)?;
        Ok(Self {
            out,
            tmp_path,
            final_path,
            module: module.into(),
            pos: AOT_MAGIC.len() as u64,
            index: BTreeMap::new(),
        })
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn path(&self) -> &Path {
        &self.final_path
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, guest_start: u64) -> bool {
        self.index.contains_key(&guest_start)
    }

    /// Appends `record` unless one with the same start is already written. Returns whether it
    /// was appended.
    pub fn append(&mut self, record: &Record) -> Result<bool> {
        if self.index.contains_key(&record.guest_start) {
            return Ok(false);
        }
        record.write_to(&mut self.out)?;
        self.index.insert(record.guest_start, self.pos);
        self.pos += record.encoded_len();
        Ok(true)
    }

    /// Writes the trailer and atomically replaces the destination file.
    pub fn finish(mut self) -> Result<PathBuf> {
        format::write_trailer(&mut self.out, self.pos, &self.index, &self.module)?;
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        fs::rename(&self.tmp_path, &self.final_path)?;
        tracing::info!(
            module = %self.module,
            records = self.index.len(),
            path = %self.final_path.display(),
            "wrote AOT cache file"
        );
        Ok(self.final_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::AotModule;

    #[test]
    fn duplicate_starts_keep_the_first_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mod.aotir");
        let mut writer = AotFileWriter::create(&path, "mod-1-stLP").unwrap();

        let mut record = Record {
            guest_start: 0x20,
            guest_len: 4,
            hash: 1,
            ra_data: xlat_regalloc::RegisterAllocationData::default().to_bytes(),
            ir: xlat_ir::IrBuilder::new(0x20).finish().to_bytes(),
        };
        assert!(writer.append(&record).unwrap());
        record.hash = 2;
        assert!(!writer.append(&record).unwrap());
        assert!(!path.exists(), "nothing is visible before finish");
        writer.finish().unwrap();

        let module = AotModule::open_for(&path, "mod-1-stLP").unwrap();
        assert_eq!(module.len(), 1);
        assert_eq!(module.find(0x20).unwrap().unwrap().hash, 1);
    }
}
