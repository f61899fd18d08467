#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Finflow shared crate
//!
//! Domain status enums with their legal-transition rules, plan types,
//! and database pool construction. Everything here is consumed by both
//! the API server and the background worker.

pub mod db;
pub mod types;

pub use db::{create_pool, run_migrations};
pub use types::{
    IntentStatus, PaymentStatus, Plan, StatusParseError, SubscriptionStatus, WebhookEventStatus,
};
