use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("queue directory already exists: {}", .0.display())]
    DirectoryExists(PathBuf),
    #[error("illegal index transition for sequence id {seq_id}")]
    IllegalTransition { seq_id: u64 },
    #[error("corrupt recovery terms: {0}")]
    CorruptTerms(#[from] serde_json::Error),
    #[error("lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
