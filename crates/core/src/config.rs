//! Core runtime configuration.
//!
//! Settings resolved once at process startup and handed to core services, such as the encounter
//! store path and whether destructive resets are allowed. Reading these eagerly rather than from
//! process-wide environment variables during request handling keeps behaviour consistent across
//! multi-threaded runtimes and test harnesses.

use crate::{EncounterError, EncounterResult};
use std::path::{Path, PathBuf};

/// Core configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    database_path: PathBuf,
    allow_drop_data: bool,
    rest_addr: String,
}

impl CoreConfig {
    /// Create a new `CoreConfig`.
    pub fn new(
        database_path: PathBuf,
        allow_drop_data: bool,
        rest_addr: String,
    ) -> EncounterResult<Self> {
        if database_path.as_os_str().is_empty() {
            return Err(EncounterError::InvalidRequest(
                "database_path cannot be empty".into(),
            ));
        }
        if rest_addr.trim().is_empty() {
            return Err(EncounterError::InvalidRequest(
                "rest_addr cannot be empty".into(),
            ));
        }

        Ok(Self {
            database_path,
            allow_drop_data,
            rest_addr,
        })
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    /// Whether the destructive administrative reset endpoint is enabled.
    pub fn allow_drop_data(&self) -> bool {
        self.allow_drop_data
    }

    pub fn rest_addr(&self) -> &str {
        &self.rest_addr
    }
}
