//! The encounter aggregate and its wire projections.
//!
//! An encounter is one tracked hospital stay. Soft deletion (`deleted_at`), discharge
//! (`discharged_at`) and parenting (`parent_uuid`) are all plain fields here; the
//! lifecycle rules around them live in the mutation and query layers.

use crate::actor::Actor;
use crate::history::{
    LocationHistory, LocationHistoryView, NewLocationHistory, ScoreSystemHistory,
    ScoreSystemHistoryView,
};
use encounter_types::Timestamp;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Placeholder used instead of an EPR encounter id in audit payloads for local encounters.
pub const LOCAL_ENCOUNTER_LABEL: &str = "Local Encounter";

/// One prior patient-record linkage, kept when records are merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRecord {
    pub record_uuid: String,
    pub patient_uuid: String,
    pub message_uuid: String,
}

/// A tracked hospital stay.
#[derive(Debug, Clone, PartialEq)]
pub struct Encounter {
    pub uuid: String,
    pub created: Timestamp,
    pub created_by: String,
    pub modified: Timestamp,
    pub modified_by: String,
    /// Free-form tag, e.g. "INPATIENT".
    pub encounter_type: Option<String>,
    pub admitted_at: Timestamp,
    /// Null means the stay is still open.
    pub discharged_at: Option<Timestamp>,
    /// Non-null means soft-deleted; the row stays queryable as history.
    pub deleted_at: Option<Timestamp>,
    /// Identifier in the external patient-record system, absent for local encounters.
    pub epr_encounter_id: Option<String>,
    pub location_uuid: String,
    pub patient_record_uuid: String,
    pub patient_uuid: String,
    pub dh_product_uuid: String,
    pub score_system: Option<String>,
    pub spo2_scale: Option<i64>,
    /// Weak self-reference forming a forest; may dangle after a parent is removed.
    pub parent_uuid: Option<String>,
    pub merge_history: Vec<MergeRecord>,
}

impl Encounter {
    /// Build a new encounter from creation data.
    ///
    /// An empty `epr_encounter_id` is normalized to absent so it cannot collide with
    /// other local encounters on the uniqueness index. `admitted_at` defaults to now
    /// and `spo2_scale` to 1 when the caller leaves them out.
    pub fn new(actor: &Actor, data: &CreateEncounter, now: Timestamp) -> Self {
        let epr_encounter_id = data.epr_encounter_id.clone().filter(|id| !id.is_empty());
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            created: now,
            created_by: actor.id.clone(),
            modified: now,
            modified_by: actor.id.clone(),
            encounter_type: data.encounter_type.clone(),
            admitted_at: data.admitted_at.unwrap_or(now),
            discharged_at: data.discharged_at,
            deleted_at: data.deleted_at,
            epr_encounter_id,
            location_uuid: data.location_uuid.clone(),
            patient_record_uuid: data.patient_record_uuid.clone(),
            patient_uuid: data.patient_uuid.clone(),
            dh_product_uuid: data.dh_product_uuid.clone(),
            score_system: data.score_system.clone(),
            spo2_scale: match data.spo2_scale {
                None => Some(1),
                Some(explicit) => explicit,
            },
            parent_uuid: data.child_of_encounter_uuid.clone(),
            merge_history: Vec::new(),
        }
    }

    pub fn is_local(&self) -> bool {
        self.epr_encounter_id.is_none()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// The EPR encounter id, or the local-encounter placeholder for audit payloads.
    pub fn epr_label(&self) -> &str {
        self.epr_encounter_id
            .as_deref()
            .unwrap_or(LOCAL_ENCOUNTER_LABEL)
    }

    /// The compact projection: core identifying fields only.
    pub fn compact_view(&self, expanded: bool) -> EncounterView {
        EncounterView {
            epr_encounter_id: self.epr_encounter_id.clone(),
            admitted_at: self.admitted_at,
            discharged_at: self.discharged_at,
            deleted_at: self.deleted_at,
            location_uuid: self.location_uuid.clone(),
            patient_record_uuid: self.patient_record_uuid.clone(),
            patient_uuid: self.patient_uuid.clone(),
            uuid: self.uuid.clone(),
            detail: None,
            identifier: expanded.then(|| IdentifierView {
                created: Some(self.created),
                created_by: self.created_by.clone(),
                modified: self.modified,
                modified_by: self.modified_by.clone(),
            }),
            child_encounter_uuids: None,
        }
    }

    /// The full projection, including score and location history views.
    pub fn detailed_view(
        &self,
        location_history: &[LocationHistory],
        score_system_history: &[ScoreSystemHistory],
        expanded: bool,
    ) -> EncounterView {
        let mut view = self.compact_view(false);
        view.detail = Some(EncounterDetail {
            encounter_type: self.encounter_type.clone(),
            score_system: self.score_system.clone(),
            spo2_scale: self.spo2_scale,
            dh_product: vec![ProductRef {
                uuid: self.dh_product_uuid.clone(),
            }],
            score_system_history: score_system_history
                .iter()
                .map(ScoreSystemHistory::to_view)
                .collect(),
            location_history: location_history.iter().map(LocationHistory::to_view).collect(),
            created: self.created,
            child_of_encounter_uuid: self.parent_uuid.clone(),
        });
        if expanded {
            // the detail block already carries `created`
            view.identifier = Some(IdentifierView {
                created: None,
                created_by: self.created_by.clone(),
                modified: self.modified,
                modified_by: self.modified_by.clone(),
            });
        }
        view
    }
}

/// Which projection of an encounter to serialize.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ViewOptions {
    /// Core identifying fields only; omits type, scores, histories and product.
    pub compact: bool,
    /// Additionally expose the audit identifier fields.
    pub expanded: bool,
}

/// Reference to a product the encounter is associated with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct ProductRef {
    pub uuid: String,
}

/// Wire projection of an encounter (see [`ViewOptions`]).
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct EncounterView {
    pub epr_encounter_id: Option<String>,
    #[schema(value_type = String)]
    pub admitted_at: Timestamp,
    #[schema(value_type = Option<String>)]
    pub discharged_at: Option<Timestamp>,
    #[schema(value_type = Option<String>)]
    pub deleted_at: Option<Timestamp>,
    pub location_uuid: String,
    pub patient_record_uuid: String,
    pub patient_uuid: String,
    pub uuid: String,
    #[serde(flatten)]
    pub detail: Option<EncounterDetail>,
    #[serde(flatten)]
    pub identifier: Option<IdentifierView>,
    /// Recursive descendant ids, attached only by the lookup endpoints.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_encounter_uuids: Option<Vec<String>>,
}

/// The non-compact portion of an encounter projection.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct EncounterDetail {
    pub encounter_type: Option<String>,
    pub score_system: Option<String>,
    pub spo2_scale: Option<i64>,
    pub dh_product: Vec<ProductRef>,
    pub score_system_history: Vec<ScoreSystemHistoryView>,
    pub location_history: Vec<LocationHistoryView>,
    #[schema(value_type = String)]
    pub created: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_of_encounter_uuid: Option<String>,
}

/// Audit identifier fields exposed by expanded projections.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct IdentifierView {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>)]
    pub created: Option<Timestamp>,
    pub created_by: String,
    #[schema(value_type = String)]
    pub modified: Timestamp,
    pub modified_by: String,
}

/// Payload for creating an encounter.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct CreateEncounter {
    #[serde(default)]
    pub encounter_type: Option<String>,
    /// Defaults to the time of creation.
    #[serde(default)]
    #[schema(value_type = Option<String>)]
    pub admitted_at: Option<Timestamp>,
    pub location_uuid: String,
    pub patient_record_uuid: String,
    /// Validated by the mutation layer rather than the deserializer so its absence
    /// surfaces as an unprocessable-input error, not a parse failure.
    #[serde(default)]
    pub patient_uuid: String,
    pub dh_product_uuid: String,
    #[serde(default)]
    pub score_system: Option<String>,
    /// Absent defaults to 1; an explicit null stores null.
    #[serde(default, deserialize_with = "double_option")]
    #[schema(value_type = Option<i64>)]
    pub spo2_scale: Option<Option<i64>>,
    #[serde(default)]
    pub epr_encounter_id: Option<String>,
    #[serde(default)]
    #[schema(value_type = Option<String>)]
    pub discharged_at: Option<Timestamp>,
    #[serde(default)]
    #[schema(value_type = Option<String>)]
    pub deleted_at: Option<Timestamp>,
    /// Not validated against existing encounters at creation time; the reference is weak.
    #[serde(default)]
    pub child_of_encounter_uuid: Option<String>,
    #[serde(default)]
    pub location_history: Vec<NewLocationHistory>,
}

/// Deserialize a field that distinguishes "absent" from "explicitly null".
pub(crate) fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}
