//! # Encounters Core
//!
//! Core business logic for the encounter tracking service.
//!
//! This crate owns the data model and every operation over it:
//! - Encounter creation, update, merge and soft deletion
//! - Location and score-system history
//! - Patient, location and EPR lookups, including the open-encounter views
//! - Outbound audit and change notifications
//!
//! **No API concerns**: HTTP routing, request authentication and OpenAPI
//! documentation belong in `api-rest`.

pub mod actor;
pub mod config;
pub mod encounter;
pub mod error;
pub mod history;
pub mod mutations;
pub mod publish;
pub mod queries;
pub mod store;

use std::sync::Arc;

pub use actor::{Actor, INTEGRATION_ACTOR_ID};
pub use config::CoreConfig;
pub use encounter::{
    CreateEncounter, Encounter, EncounterDetail, EncounterView, IdentifierView, MergeRecord,
    ProductRef, ViewOptions,
};
pub use error::{EncounterError, EncounterResult};
pub use history::{
    LocationHistoryView, NewLocationHistory, ScoreSystemHistoryPatch, ScoreSystemHistoryView,
};
pub use mutations::{
    EncounterPatch, MergeOutcome, MergeRequest, Modification, RemoveFields, ResetOutcome,
};
pub use publish::{EventPublisher, LoggingPublisher};
pub use store::Db;

/// Encounter operations over shared storage - no API concerns
///
/// The service is cheap to clone: it holds the database handle and the
/// publisher behind shared pointers. Query operations live in [`queries`] and
/// write operations in [`mutations`].
#[derive(Clone)]
pub struct EncounterService {
    db: Db,
    publisher: Arc<dyn EventPublisher>,
}

impl EncounterService {
    pub fn new(db: Db, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { db, publisher }
    }
}
