use thiserror::Error;

/// Non-hook-context failures only. Everything that can happen inside an
/// allocation hook degrades silently per the error taxonomy in `hooks` —
/// this type exists for init-time and configuration failures, which are
/// free to return a normal `Result`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("shard count must be a power of two, got {0}")]
    ShardsNotPowerOfTwo(u32),

    #[error("shard slot count must be a power of two, got {0}")]
    SlotsNotPowerOfTwo(u32),

    #[error("stack_capture_bytes {requested} exceeds compiled-in maximum {max}")]
    StackBudgetTooLarge { requested: usize, max: usize },

    #[error("tracker already installed")]
    AlreadyInstalled,
}

pub type Result<T> = std::result::Result<T, Error>;
