//! HTTP request handlers.

pub mod credits;
pub mod health;
pub mod plans;
pub mod reservations;
pub mod subscription;
pub mod usage;
pub mod webhooks;
