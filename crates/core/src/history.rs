//! History rows attached to an encounter: ward moves and scoring-system changes.

use encounter_types::Timestamp;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// One stay at a location within an encounter.
///
/// Rows are written at two points: when an encounter is created with explicit
/// history entries, and when a move to a different location is recorded. In the
/// latter case the row preserves the location being left.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationHistory {
    pub uuid: String,
    pub created: Timestamp,
    pub created_by: String,
    pub modified: Timestamp,
    pub modified_by: String,
    pub encounter_uuid: String,
    pub location_uuid: String,
    pub arrived_at: Option<Timestamp>,
    pub departed_at: Option<Timestamp>,
}

impl LocationHistory {
    pub fn to_view(&self) -> LocationHistoryView {
        LocationHistoryView {
            location_uuid: self.location_uuid.clone(),
            created_at: self.created,
            arrived_at: self.arrived_at,
            departed_at: self.departed_at,
        }
    }
}

/// A location-history entry supplied at encounter creation.
///
/// Arrival and departure default to the creation time when omitted.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct NewLocationHistory {
    pub location_uuid: String,
    #[serde(default)]
    #[schema(value_type = Option<String>)]
    pub arrived_at: Option<Timestamp>,
    #[serde(default)]
    #[schema(value_type = Option<String>)]
    pub departed_at: Option<Timestamp>,
}

/// Wire projection of a location-history entry.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct LocationHistoryView {
    pub location_uuid: String,
    #[schema(value_type = String)]
    pub created_at: Timestamp,
    #[schema(value_type = Option<String>)]
    pub arrived_at: Option<Timestamp>,
    #[schema(value_type = Option<String>)]
    pub departed_at: Option<Timestamp>,
}

/// One change to an encounter's scoring configuration.
///
/// Captures both the new and previous values of the score system and SpO2 scale
/// at the moment of the change. `changed_time` records when the change took
/// clinical effect, which may be corrected after the fact.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreSystemHistory {
    pub uuid: String,
    pub created: Timestamp,
    pub created_by: String,
    pub modified: Timestamp,
    pub modified_by: String,
    pub encounter_uuid: String,
    pub changed_time: Timestamp,
    pub score_system: Option<String>,
    pub previous_score_system: Option<String>,
    pub spo2_scale: Option<i64>,
    pub previous_spo2_scale: Option<i64>,
}

impl ScoreSystemHistory {
    pub fn to_view(&self) -> ScoreSystemHistoryView {
        ScoreSystemHistoryView {
            uuid: self.uuid.clone(),
            created_by: self.created_by.clone(),
            changed_time: self.changed_time,
            score_system: self.score_system.clone(),
            previous_score_system: self.previous_score_system.clone(),
            spo2_scale: self.spo2_scale,
            previous_spo2_scale: self.previous_spo2_scale,
            changed_by: self.created_by.clone(),
        }
    }
}

/// Wire projection of a score-system-history entry.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct ScoreSystemHistoryView {
    pub uuid: String,
    pub created_by: String,
    #[schema(value_type = String)]
    pub changed_time: Timestamp,
    pub score_system: Option<String>,
    pub previous_score_system: Option<String>,
    pub spo2_scale: Option<i64>,
    pub previous_spo2_scale: Option<i64>,
    pub changed_by: String,
}

/// Payload for correcting when a score-system change took effect.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ScoreSystemHistoryPatch {
    #[schema(value_type = String)]
    pub changed_time: Timestamp,
}
