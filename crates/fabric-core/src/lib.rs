//! Core executor for layout-change plans.
//!
//! A plan is a DAG of operations against external hardware-control and
//! workflow-manager services. The pieces:
//!
//! - [`plan`] -- plan model, validation, and per-operation results
//! - [`config`] -- driver/endpoint configuration envelopes
//! - [`client`] -- shared HTTP primitive with transport-level retry
//! - [`driver`] -- per-kind operation drivers (request, retry ladder,
//!   post-condition polling)
//! - [`scheduler`] -- DAG scheduler with bounded parallelism
//! - [`rollback`] / [`resume`] -- derived inverse and residual plans
//! - [`state`] -- durable apply-state store over `fabric-db`
//! - [`lifecycle`] -- one apply from admission to a terminal state

pub mod client;
pub mod config;
pub mod driver;
pub mod lifecycle;
pub mod liveness;
pub mod plan;
pub mod resume;
pub mod rollback;
pub mod scheduler;
pub mod state;
