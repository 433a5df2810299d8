//! Persistence layer for the task scheduling engine.
//!
//! Owns the database schema, connection pool setup, and the query functions
//! that express every mutating write as either a compare-and-swap on
//! `status` or an unconditional terminal write. Nothing in this crate
//! understands executors, retry policy, or the worker lifecycle -- those
//! live in `taskrelay-core` and call through the functions exposed here.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
