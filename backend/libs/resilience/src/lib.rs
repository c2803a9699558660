//! Resilience helpers for calls to external backends
//!
//! - **Deadline**: bound every outbound call, keeping the caller's error type
//! - **Retry**: exponential backoff with jitter, only for errors the caller
//!   marks as transient
//!
//! Neither helper retries on its own initiative: mutating calls are wrapped in
//! a deadline only, reads and token fetches may opt into retry.
//!
//! # Example: bounded read with retry
//!
//! ```rust,no_run
//! use resilience::{retry::with_retry_if, timeout::with_deadline, RetryConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let result = with_retry_if(
//!         RetryConfig::default(),
//!         || with_deadline(Duration::from_secs(5), async { Ok::<_, String>(true) }),
//!         |e: &resilience::DeadlineError<String>| e.is_elapsed(),
//!     )
//!     .await;
//! }
//! ```

pub mod retry;
pub mod timeout;

pub use retry::{with_retry_if, RetryConfig, RetryError};
pub use timeout::{with_deadline, with_timeout, DeadlineError};
