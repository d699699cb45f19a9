//! Reactive query cache for the lead and contact management frontend.

pub mod cache;
pub mod config;
pub mod infra;
