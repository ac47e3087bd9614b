use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupted BRIN index \"{index}\" block {block}: {reason}")]
    IndexCorrupted {
        index: String,
        block: u32,
        reason: String,
    },

    #[error("unexpected page type 0x{page_type:04X} in BRIN index \"{index}\" block {block}")]
    UnexpectedPageType {
        index: String,
        block: u32,
        page_type: u16,
    },

    #[error("revmap does not cover heap block {0}")]
    RevmapNotCovering(u32),

    #[error("Invalid block number: {0}")]
    InvalidBlock(u32),

    #[error("Invalid concurrency slot: {0}")]
    InvalidSlot(usize),

    #[error("No room on page {0}")]
    PageFull(u32),

    #[error("cost model parameter {param} has invalid value {value}")]
    ConfigurationInvariantViolation { param: String, value: f64 },

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("No plan satisfies the requested properties: {0}")]
    NoPlanFound(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("WAL error: {0}")]
    Wal(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn error_code(&self) -> i32 {
        match self {
            Error::Io(_) => -1,
            Error::IndexCorrupted { .. } => -2,
            Error::UnexpectedPageType { .. } => -3,
            Error::RevmapNotCovering(_) => -4,
            Error::InvalidBlock(_) => -5,
            Error::InvalidSlot(_) => -6,
            Error::PageFull(_) => -7,
            Error::ConfigurationInvariantViolation { .. } => -8,
            Error::InvalidPlan(_) => -9,
            Error::NoPlanFound(_) => -10,
            Error::Cancelled => -11,
            Error::Wal(_) => -12,
            Error::Serialization(_) => -13,
            Error::Config(_) => -14,
        }
    }

    /// Corruption errors are fatal to the current query and must reach the user.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::IndexCorrupted { .. } | Error::UnexpectedPageType { .. }
        )
    }
}
