//! # Data Models
//!
//! SeaORM entities for calendar connections and synced entries, plus small
//! response types shared by handlers.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod calendar_connection;
pub mod calendar_entry;

pub use calendar_connection::Entity as CalendarConnection;
pub use calendar_entry::Entity as CalendarEntry;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
    /// Whether the database answered a ping
    pub database: String,
}

impl ServiceInfo {
    pub fn with_database_status(healthy: bool) -> Self {
        Self {
            service: "calendar-sync".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            database: if healthy { "ok" } else { "unavailable" }.to_string(),
        }
    }
}
