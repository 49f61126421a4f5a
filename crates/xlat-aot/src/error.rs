use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AotError>;

#[derive(Debug, Error)]
pub enum AotError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to map {path}: {source}")]
    Map {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid AOT cache magic")]
    InvalidMagic,

    #[error("corrupt AOT cache: {0}")]
    Corrupt(&'static str),

    #[error("AOT cache file belongs to module {found:?}, expected {expected:?}")]
    ModuleMismatch { expected: String, found: String },

    #[error("cached IR is unusable: {0}")]
    Ir(#[from] xlat_ir::IrError),

    #[error("cached register allocation is unusable: {0}")]
    RaData(#[from] xlat_regalloc::RaDataError),
}
