//! Logs-Collector-K8s: provisioning and maintenance of a node-level log
//! collector on Kubernetes
//!
//! This crate deploys a log collector daemon set together with its namespace,
//! service account, RBAC and config map, and performs checkpoint cleanup on
//! the running collector without losing it.

pub mod backend;
pub mod collector;
pub mod error;
pub mod settings;

pub use crate::error::{Error, Result};
