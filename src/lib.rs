//! Worker Hub — ordered, retryable task chains run by config-driven workers.

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod logger;
pub mod tasks;
pub mod worker;
