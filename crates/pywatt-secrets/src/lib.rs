//! Secret management for PyWatt modules.
//!
//! Secrets come from the orchestrator over the stdio control plane. This
//! crate provides:
//!
//! - [`SecretValue`]: an in-memory value that zeroises on drop, compares
//!   in constant time, and debug-prints as `[REDACTED]`
//! - [`SecretClient`]: request, cache, and refresh secrets with rotation
//!   events and in-flight request coalescing
//! - The process-global [`redact`] registry: every secret value ever
//!   returned to a caller is registered there before it can reach a log
//!   line, and the logging stack scrubs stderr output through it
//!
//! # Example
//!
//! ```rust,ignore
//! use pywatt_secrets::{FetchMode, SecretClient};
//!
//! let database_url = client.get("DATABASE_URL", FetchMode::CacheThenRemote).await?;
//! let pool_size: u32 = client.get_typed("DB_POOL_SIZE", FetchMode::CacheThenRemote).await?;
//! ```

mod client;
mod error;
pub mod redact;
mod types;

pub use client::{FetchMode, RotationEvent, SecretClient};
pub use error::SecretError;
pub use types::SecretValue;
