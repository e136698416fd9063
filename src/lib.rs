#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod backend;
pub mod config;
mod middleware;
pub mod policy;

pub use middleware::builder::{HeaderCompatibleOutput, RateLimiterBuilder, DENIED_BODY};
pub use middleware::{RateLimitStatus, RateLimiter};
