#![doc = include_str!("../README.md")]

pub mod balance;
mod config;
mod context;
mod error;
mod grpc;
pub mod metrics;
mod pool;
pub mod retry;
mod router;
mod transport;

#[cfg(test)]
mod testing;

pub use crate::config::*;
pub use crate::context::*;
pub use crate::error::*;
pub use crate::grpc::*;
pub use crate::pool::*;
pub use crate::router::*;
pub use crate::transport::*;

// Re-exported so callers can name codecs, statuses and metadata without
// depending on a matching tonic version themselves.
pub use tonic;
