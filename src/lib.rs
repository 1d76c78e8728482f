//! admission-dispatch: dynamic admission-control webhook dispatch
//!
//! This crate decides whether a resource write may proceed by consulting
//! externally registered validating webhooks, the way a Kubernetes API
//! server does for `ValidatingWebhookConfiguration` objects.

pub mod config;
pub mod error;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod telemetry;
pub mod tls;
pub mod webhook;

pub use crate::error::{Error, Result};
