//! Error types at module boundaries that callers need to match on.
//!
//! Everything else propagates as `anyhow::Error`, matching the teacher's
//! `anyhow::Result` idiom throughout its service layer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {source}\n{backtrace}")]
    Backend {
        source: sled::Error,
        backtrace: String,
    },
    #[error("failed to encode point: {0}")]
    Encode(#[from] bincode::Error),
    #[error("partition directory io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<sled::Error> for StoreError {
    fn from(source: sled::Error) -> Self {
        StoreError::Backend {
            source,
            backtrace: std::backtrace::Backtrace::force_capture().to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Error)]
pub enum PluginGrammarError {
    #[error("unknown output grammar: {0}")]
    UnknownGrammar(String),
    #[error("unparseable first line of plugin output: {0:?}")]
    UnparseableLine(String),
    #[error("unknown plugin exit state code: {0}")]
    UnknownStateCode(i32),
}

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("memory sampler: {0}")]
    Memory(#[from] crate::collectors::memory::MemoryError),
    #[error("cpu sampler: {0}")]
    Cpu(#[from] crate::collectors::cpu::CpuError),
    #[error("network sampler: {0}")]
    Network(#[from] crate::collectors::network::NetworkError),
    #[error("disk space sampler: {0}")]
    DiskSpace(#[from] crate::collectors::disk_space::DiskSpaceError),
    #[error("disk io sampler: {0}")]
    DiskIo(#[from] crate::collectors::disk_io::DiskIoError),
    #[error("process sampler: {0}")]
    Processes(#[from] crate::collectors::processes::ProcessesError),
}

#[derive(Debug, Error)]
pub enum ControlChannelError {
    #[error("frame decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("connection io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("read timed out")]
    ReadTimeout,
}
