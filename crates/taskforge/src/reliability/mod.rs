//! Reliability patterns for task execution
//!
//! This module provides:
//! - [`RetryPolicy`] - Delay before a failed task is retried

mod retry;

pub use retry::RetryPolicy;
