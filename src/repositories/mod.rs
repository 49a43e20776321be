//! # Repository Layer
//!
//! Repository implementations that encapsulate SeaORM operations for the
//! calendar tables. Every method is tenant-aware.

pub mod calendar_connection;
pub mod calendar_entry;

pub use calendar_connection::{ConnectionRepository, NewConnection, WebhookChannel};
pub use calendar_entry::{EntryContent, EntryRepository, ExternalRef};
