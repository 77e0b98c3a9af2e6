//! crosspost - multi-platform post fan-out and delivery
//!
//! One post request becomes a staged content bundle plus one delivery job per
//! target platform. Jobs travel through an at-least-once queue to the
//! delivery worker, which calls the target's delivery platform and records a
//! terminal state. Webhook callbacks from external services can synthesize
//! post requests through registered triggers.

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod platforms;
pub mod producer;
pub mod queue;
pub mod rate_limiter;
pub mod retry;
pub mod secrets;
pub mod service;
pub mod session;
pub mod staging;
pub mod storage;
pub mod triggers;
pub mod types;
pub mod webhook;
pub mod worker;

// Re-export commonly used types
pub use config::Config;
pub use db::Database;
pub use error::{CrosspostError, PlatformError, Result};
pub use producer::Producer;
pub use types::{DeliveryJob, JobStatus, PostContent, PostRequest, SubmitReceipt};
pub use worker::DeliveryWorker;
