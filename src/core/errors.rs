use thiserror::Error;

use crate::core::constants::PageId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("failed to open index file {path:?}: {details}")]
    OpenFailed { path: String, details: String },

    #[error("failed to lock index file {path:?}: {details}")]
    LockFailed { path: String, details: String },

    #[error("invalid page id {0}")]
    InvalidPageId(PageId),

    #[error("page size must be 4096 bytes")]
    InvalidPageSize,

    #[error("data corruption in page {page_id}: {details}")]
    Corruption { page_id: PageId, details: String },

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
