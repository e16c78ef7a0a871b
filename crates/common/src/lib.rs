//! Common utilities, types, and configurations shared across Sluice crates.
//!
//! - **Configuration**: Strongly typed application configuration (`config`).
//! - **Data model**: Requests, metadata, plans, execution records (`models`).
//! - **Tenancy**: User/project context and quota keys (`tenant`).
//! - **Telemetry**: Logging and trace export setup (`telemetry`).
//! - **Resilience**: Circuit breakers and retries (`circuit_breaker`, `retry`).
//! - **Warnings**: Per-submission warning collection (`warnings`).
pub mod circuit_breaker;
pub mod config;
pub mod models;
pub mod retry;
pub mod telemetry;
pub mod tenant;
pub mod warnings;
