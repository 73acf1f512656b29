//! HTTP route handlers for the Tandem relay
//!
//! The relay itself speaks WebSocket on `/ws`; plain HTTP is only used for
//! health and status endpoints.

pub mod health;

pub use health::{health_router, HealthState};
