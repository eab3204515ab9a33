pub mod clock;
pub mod encryption;
pub mod error;
pub mod idempotency;
pub mod identity;
pub mod jobs;
pub mod journal;
pub mod kv;
pub mod ports;
pub mod spend;
pub mod util;

pub type DomainResult<T> = Result<T, error::DomainError>;
