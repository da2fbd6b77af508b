//! Z-Metering HTTP API Service.
//!
//! This crate provides the HTTP API for the z-metering engine:
//!
//! - Plan catalog and subscription management
//! - Credit balance, usage history and reconciliation
//! - Credit reservations for feature call sites
//! - Payment gateway webhooks
//! - Background sweep of stranded reservations
//!
//! # Authentication
//!
//! The service supports two authentication methods:
//!
//! 1. **HS256 JWT tokens** - For end-user requests (dashboard, etc.)
//! 2. **Service API keys** - For feature call sites and the gateway adapter

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Allow some pedantic lints that are noisy for Axum handler functions
#![allow(clippy::missing_errors_doc)] // Axum handlers all return Result
#![allow(clippy::unused_async)] // Axum handlers must be async

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod sink;
pub mod state;
pub mod sweeper;

pub use config::{ConfigError, ServiceConfig, StorageBackend};
pub use error::ApiError;
pub use routes::create_router;
pub use sink::HttpSink;
pub use state::AppState;
pub use sweeper::spawn_sweeper;
