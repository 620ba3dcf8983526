//! The identity on whose behalf a mutation runs.
//!
//! Every mutating operation takes an explicit [`Actor`] rather than reading ambient
//! request state: the acting identity ends up in `created_by`/`modified_by` stamps and
//! in audit events, and the `can_edit_ews` capability gates early-warning-score changes.

/// Identity and capabilities of the caller performing an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Actor {
    /// Stable identifier of the caller, usually a clinician UUID.
    pub id: String,

    /// Whether the caller may change the early-warning-score configuration
    /// (`score_system`, `spo2_scale`) of an encounter.
    pub can_edit_ews: bool,
}

/// Actor id used by the EPR integration adapter. Changes made under this identity
/// do not emit the `encounter_modified` audit event.
pub const INTEGRATION_ACTOR_ID: &str = "epr-integration-adapter";

impl Actor {
    /// An actor without the EWS capability.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            can_edit_ews: false,
        }
    }

    /// Grant or withdraw the EWS capability.
    pub fn with_ews_permission(mut self, can_edit_ews: bool) -> Self {
        self.can_edit_ews = can_edit_ews;
        self
    }
}
