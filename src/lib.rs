//! Validator-side coordinator for Bitcoin bridge-out withdrawals
//!
//! Unlock events observed on the source chain are queued, delayed by a
//! per-validator submission slot, skipped when already attested, and
//! attested on the Ethereum bridge either directly or through a signature
//! collector. Submissions are tracked until finality and re-queued if they
//! did not hold.

pub mod bridge;
pub mod codec;
pub mod collector;
pub mod config;
pub mod contracts;
pub mod db;
pub mod error;
pub mod executor;
pub mod finality;
pub mod metrics;
pub mod processor;
pub mod queue;
pub mod relay;
pub mod scheduler;
pub mod server;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod types;
pub mod validator;
pub mod watcher;

pub use error::{BridgeOutError, Result};
pub use types::{DestinationChain, UnlockEvent};
