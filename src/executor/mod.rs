//! Submission paths for an unlock
//!
//! - [`individual`]: this validator submits `attestBridgeOut` itself
//! - [`batch`]: this validator signs off-chain and a collector submits
//! - [`retry`]: bounded, cancellable retry shared by both

pub mod batch;
pub mod individual;
pub mod retry;

pub use batch::{BatchAttestationOrchestrator, BatchConfig};
pub use individual::IndividualAttestationExecutor;
pub use retry::{classify_error, retry_with_backoff, ErrorClass, RetryConfig};
