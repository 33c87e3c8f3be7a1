//! Postgres persistence layer for the apply status store.

pub mod config;
pub mod error;
pub mod models;
pub mod pool;
pub mod queries;
pub mod timefmt;
