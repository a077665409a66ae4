//! Quotaguard - Fixed-Window Rate Limiting Engine
//!
//! This crate decides whether a client request is within its quota. Requests
//! are counted per key in fixed, non-overlapping windows, and the counts live
//! in MongoDB or Redis so that every process sharing the store enforces the
//! same limit. Storage failures during a check let the request through.

pub mod config;
pub mod error;
pub mod ratelimit;

pub use crate::config::{BackendConfig, RateLimiterConfig};
pub use crate::error::{RateLimitError, Result};
pub use crate::ratelimit::{RateLimitDecision, RateLimitRecord, RateLimiter};
