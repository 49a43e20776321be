//! # Calendar Sync
//!
//! Keeps internal calendar entries consistent with a user's external calendar:
//! OAuth-delegated access with encrypted credentials, an import/export
//! reconciliation engine, push-notification ingress and the HTTP lifecycle API.

pub mod audit;
pub mod auth;
pub mod calendar;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod oauth;
pub mod repositories;
pub mod server;
pub mod sync;
pub mod telemetry;
pub mod webhook;
pub use migration;
