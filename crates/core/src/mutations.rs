//! Write operations: create, update, merge, unlink and the data reset.
//!
//! Updates follow a fixed order so history rows are written against the values
//! being replaced, and every change notification goes out only after the
//! transaction has committed.

use crate::actor::{Actor, INTEGRATION_ACTOR_ID};
use crate::encounter::{
    double_option, CreateEncounter, Encounter, EncounterView, MergeRecord, ViewOptions,
};
use crate::history::{
    LocationHistory, ScoreSystemHistory, ScoreSystemHistoryPatch, ScoreSystemHistoryView,
};
use crate::{publish, queries, store};
use crate::{EncounterError, EncounterResult, EncounterService};
use encounter_types::Timestamp;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Instant;
use utoipa::ToSchema;

/// Payload for updating an encounter.
///
/// `epr_encounter_id`, `discharged_at` and `deleted_at` distinguish an explicit
/// null (clear the field) from an absent key (leave it alone). The parent
/// reference can only be set here; clearing it goes through
/// [`EncounterService::remove_from_encounter`].
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct EncounterPatch {
    #[serde(default)]
    pub encounter_type: Option<String>,
    #[serde(default)]
    #[schema(value_type = Option<String>)]
    pub admitted_at: Option<Timestamp>,
    #[serde(default)]
    pub location_uuid: Option<String>,
    #[serde(default)]
    pub patient_record_uuid: Option<String>,
    #[serde(default)]
    pub dh_product_uuid: Option<String>,
    #[serde(default)]
    pub score_system: Option<String>,
    #[serde(default)]
    pub spo2_scale: Option<i64>,
    #[serde(default, deserialize_with = "double_option")]
    #[schema(value_type = Option<String>)]
    pub epr_encounter_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    #[schema(value_type = Option<String>)]
    pub discharged_at: Option<Option<Timestamp>>,
    #[serde(default, deserialize_with = "double_option")]
    #[schema(value_type = Option<String>)]
    pub deleted_at: Option<Option<Timestamp>>,
    #[serde(default)]
    pub child_of_encounter_uuid: Option<String>,
}

/// Fields to remove from an encounter.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct RemoveFields {
    #[serde(default)]
    pub child_of_encounter_uuid: Option<String>,
}

/// Request to move all encounters from one patient record onto another.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct MergeRequest {
    pub child_record_uuid: String,
    pub parent_record_uuid: String,
    pub parent_patient_uuid: String,
    pub message_uuid: String,
}

/// Outcome of a merge: how many encounters were moved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct MergeOutcome {
    pub total: u64,
}

/// Outcome of a development data reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct ResetOutcome {
    pub complete: bool,
    pub time_taken: String,
}

/// One recorded difference between two encounter projections: the kind of
/// difference, the field, and the before and after values.
///
/// Serializes as `["change", "location_uuid", ["L1", "L2"]]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Modification(pub &'static str, pub String, pub (Value, Value));

/// Projection keys an update can affect. Used to decide whether an update
/// actually changed anything worth notifying about.
const UPDATABLE_VIEW_KEYS: [&str; 12] = [
    "epr_encounter_id",
    "encounter_type",
    "admitted_at",
    "discharged_at",
    "deleted_at",
    "location_uuid",
    "dh_product",
    "score_system",
    "score_system_history",
    "patient_record_uuid",
    "child_of_encounter_uuid",
    "spo2_scale",
];

pub(crate) fn encounter_has_changed(
    initial: &Map<String, Value>,
    updated: &Map<String, Value>,
) -> bool {
    UPDATABLE_VIEW_KEYS
        .iter()
        .any(|key| initial.get(*key) != updated.get(*key))
}

/// Field-level differences between two projections of the same encounter.
pub(crate) fn diff_views(
    initial: &Map<String, Value>,
    updated: &Map<String, Value>,
) -> Vec<Modification> {
    let mut modifications = Vec::new();
    for (key, old) in initial {
        match updated.get(key) {
            Some(new) if new != old => {
                modifications.push(Modification("change", key.clone(), (old.clone(), new.clone())));
            }
            Some(_) => {}
            None => modifications.push(Modification("remove", key.clone(), (old.clone(), Value::Null))),
        }
    }
    for (key, new) in updated {
        if !initial.contains_key(key) {
            modifications.push(Modification("add", key.clone(), (Value::Null, new.clone())));
        }
    }
    modifications
}

fn view_map(view: &EncounterView) -> EncounterResult<Map<String, Value>> {
    match serde_json::to_value(view).map_err(EncounterError::Serialization)? {
        Value::Object(map) => Ok(map),
        _ => Ok(Map::new()),
    }
}

/// Apply a patch to an encounter, writing history rows through `conn`.
///
/// The order matters: the location move is recorded against the location being
/// left, and the score-system history row captures the values in place before
/// the live fields change.
fn apply_patch(
    conn: &Connection,
    encounter: &mut Encounter,
    patch: &EncounterPatch,
    actor: &Actor,
    now: Timestamp,
) -> EncounterResult<()> {
    if let Some(new_location) = &patch.location_uuid {
        if *new_location != encounter.location_uuid {
            tracing::debug!(
                "Location history being created for location with UUID {}",
                encounter.location_uuid
            );
            store::insert_location_history(
                conn,
                &LocationHistory {
                    uuid: uuid::Uuid::new_v4().to_string(),
                    created: now,
                    created_by: actor.id.clone(),
                    modified: now,
                    modified_by: actor.id.clone(),
                    encounter_uuid: encounter.uuid.clone(),
                    location_uuid: encounter.location_uuid.clone(),
                    arrived_at: None,
                    departed_at: None,
                },
            )?;
        }
        encounter.location_uuid = new_location.clone();
    }

    if patch.spo2_scale.is_some() || patch.score_system.is_some() {
        let new_spo2 = patch.spo2_scale;
        let new_score = patch.score_system.clone();
        let spo2_differs = new_spo2.is_some() && new_spo2 != encounter.spo2_scale;
        let score_differs = new_score.is_some() && new_score != encounter.score_system;
        if spo2_differs || score_differs {
            tracing::debug!(
                "Score system history being created: {:?} {:?}",
                new_score,
                new_spo2
            );
            store::insert_score_history(
                conn,
                &ScoreSystemHistory {
                    uuid: uuid::Uuid::new_v4().to_string(),
                    created: now,
                    created_by: actor.id.clone(),
                    modified: now,
                    modified_by: actor.id.clone(),
                    encounter_uuid: encounter.uuid.clone(),
                    changed_time: now,
                    score_system: new_score.clone(),
                    previous_score_system: encounter.score_system.clone(),
                    spo2_scale: new_spo2,
                    previous_spo2_scale: encounter.spo2_scale,
                },
            )?;
        }
        // the live fields only take non-empty values; the history row above
        // still records whatever was asked for
        if let Some(spo2) = new_spo2 {
            if spo2 != 0 {
                encounter.spo2_scale = Some(spo2);
            }
        }
        if let Some(score) = new_score {
            if !score.is_empty() {
                encounter.score_system = Some(score);
            }
        }
    }

    if let Some(product) = &patch.dh_product_uuid {
        encounter.dh_product_uuid = product.clone();
    }
    if let Some(record) = &patch.patient_record_uuid {
        encounter.patient_record_uuid = record.clone();
    }

    if let Some(parent) = patch
        .child_of_encounter_uuid
        .as_deref()
        .filter(|id| !id.is_empty())
    {
        if !store::encounter_exists(conn, parent)? {
            return Err(EncounterError::UnprocessableInput(format!(
                "Parent encounter '{parent}' does not exist"
            )));
        }
        encounter.parent_uuid = Some(parent.to_owned());
    }

    if let Some(epr) = &patch.epr_encounter_id {
        encounter.epr_encounter_id = epr.clone();
    }
    if let Some(encounter_type) = &patch.encounter_type {
        encounter.encounter_type = Some(encounter_type.clone());
    }
    if let Some(admitted_at) = patch.admitted_at {
        encounter.admitted_at = admitted_at;
    }
    if let Some(discharged_at) = patch.discharged_at {
        encounter.discharged_at = discharged_at;
    }
    if let Some(deleted_at) = patch.deleted_at {
        encounter.deleted_at = deleted_at;
    }
    Ok(())
}

impl EncounterService {
    /// Create a new encounter and announce it.
    ///
    /// A patient may only hold one open local encounter at a time, and an EPR
    /// encounter id may only be live on one encounter at a time.
    pub fn create_encounter(
        &self,
        actor: &Actor,
        data: &CreateEncounter,
    ) -> EncounterResult<EncounterView> {
        if data.patient_uuid.is_empty() {
            return Err(EncounterError::UnprocessableInput(
                "Patient UUID not given".to_owned(),
            ));
        }
        if let Some(Some(scale)) = data.spo2_scale {
            if scale != 1 && !actor.can_edit_ews {
                return Err(EncounterError::PermissionDenied(format!(
                    "Cannot create encounter with spo2_scale set to {scale}"
                )));
            }
        }

        let now = Timestamp::now();
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        let epr_supplied = data
            .epr_encounter_id
            .as_deref()
            .is_some_and(|id| !id.is_empty());
        if !epr_supplied {
            let open_locals = queries::open_local_encounter_uuids(&tx, &data.patient_uuid)?;
            if let Some(existing) = open_locals.first() {
                return Err(EncounterError::DuplicateResource(format!(
                    "A local encounter '{existing}' already exists"
                )));
            }
        }

        let encounter = Encounter::new(actor, data, now);
        if let Err(err) = store::insert_encounter(&tx, &encounter) {
            if let EncounterError::Storage(inner) = &err {
                if store::is_epr_conflict(inner) {
                    let epr = data.epr_encounter_id.as_deref().unwrap_or_default();
                    return Err(EncounterError::DuplicateResource(format!(
                        "An EPR encounter '{epr}' already exists"
                    )));
                }
            }
            return Err(err);
        }

        for entry in &data.location_history {
            store::insert_location_history(
                &tx,
                &LocationHistory {
                    uuid: uuid::Uuid::new_v4().to_string(),
                    created: now,
                    created_by: actor.id.clone(),
                    modified: now,
                    modified_by: actor.id.clone(),
                    encounter_uuid: encounter.uuid.clone(),
                    location_uuid: entry.location_uuid.clone(),
                    arrived_at: Some(entry.arrived_at.unwrap_or(now)),
                    departed_at: Some(entry.departed_at.unwrap_or(now)),
                },
            )?;
        }
        tx.commit()?;

        let view = queries::render_view(&conn, &encounter, ViewOptions::default())?;
        publish::publish_encounter_update(self.publisher.as_ref(), &encounter.uuid);
        Ok(view)
    }

    /// Update an encounter, recording history and publishing change events.
    ///
    /// Changing the scoring configuration needs the EWS permission; a refused
    /// attempt is itself audited. Notifications go out only once the update has
    /// committed, and only when something observable actually changed.
    pub fn update_encounter(
        &self,
        actor: &Actor,
        encounter_id: &str,
        patch: &EncounterPatch,
    ) -> EncounterResult<EncounterView> {
        let mut conn = self.db.lock();
        let encounter = queries::encounter_or_not_found(&conn, encounter_id)?;

        let epr_label = encounter.epr_label().to_owned();
        let previous_spo2 = encounter.spo2_scale;
        let previous_score = encounter.score_system.clone();
        let requested_spo2 = patch.spo2_scale;
        let requested_score = patch.score_system.clone();

        let spo2_attempt = requested_spo2.is_some_and(|new| new != 0 && Some(new) != previous_spo2);
        let score_attempt = requested_score
            .as_deref()
            .is_some_and(|new| !new.is_empty() && Some(new) != previous_score.as_deref());

        if !actor.can_edit_ews && (spo2_attempt || score_attempt) {
            publish::publish_audit_event(
                self.publisher.as_ref(),
                "ews_change_failure",
                json!({
                    "clinician_id": actor.id,
                    "encounter_id": encounter_id,
                    "epr_encounter_id": epr_label,
                    "previous_spo2_scale": previous_spo2,
                    "previous_score_system": previous_score,
                    "new_spo2_scale": requested_spo2,
                    "new_score_system": requested_score,
                }),
            );
            return Err(EncounterError::PermissionDenied(
                "User does not have permission to change EWS".to_owned(),
            ));
        }

        let initial_view = queries::render_view(&conn, &encounter, ViewOptions::default())?;
        let initial_map = view_map(&initial_view)?;

        let now = Timestamp::now();
        let mut updated = encounter.clone();
        let tx = conn.transaction()?;
        apply_patch(&tx, &mut updated, patch, actor, now)?;
        if updated != encounter {
            updated.modified = now;
            updated.modified_by = actor.id.clone();
            store::update_encounter(&tx, &updated)?;
        }
        tx.commit()?;

        if spo2_attempt || score_attempt {
            publish::publish_audit_event(
                self.publisher.as_ref(),
                "score_system_changed",
                json!({
                    "clinician_id": actor.id,
                    "encounter_id": encounter_id,
                    "epr_encounter_id": epr_label,
                    "previous_score_system": previous_score,
                    "previous_spo2_scale": previous_spo2,
                    "new_score_system": requested_score,
                    "new_spo2_scale": requested_spo2,
                    "modified": updated.modified,
                    "modified_by": updated.modified_by,
                }),
            );
            let expanded = queries::render_view(
                &conn,
                &updated,
                ViewOptions {
                    compact: false,
                    expanded: true,
                },
            )?;
            let expanded = serde_json::to_value(&expanded).map_err(EncounterError::Serialization)?;
            publish::publish_score_system_change(self.publisher.as_ref(), &expanded)?;
        }

        let updated_view = queries::render_view(&conn, &updated, ViewOptions::default())?;
        let updated_map = view_map(&updated_view)?;
        if encounter_has_changed(&initial_map, &updated_map) {
            publish::publish_encounter_update(self.publisher.as_ref(), &updated.uuid);
            if updated.modified_by != INTEGRATION_ACTOR_ID {
                publish::publish_audit_event(
                    self.publisher.as_ref(),
                    "encounter_modified",
                    json!({
                        "clinician_id": actor.id,
                        "encounter_id": encounter_id,
                        "modifications": diff_views(&initial_map, &updated_map),
                    }),
                );
            }
        }
        Ok(updated_view)
    }

    /// Remove fields from an encounter. Currently only the parent reference can
    /// be removed, and only when the supplied value matches the current parent.
    pub fn remove_from_encounter(
        &self,
        actor: &Actor,
        encounter_id: &str,
        fields: &RemoveFields,
    ) -> EncounterResult<EncounterView> {
        let conn = self.db.lock();
        let mut encounter = queries::encounter_or_not_found(&conn, encounter_id)?;

        let matched = fields
            .child_of_encounter_uuid
            .as_deref()
            .filter(|id| !id.is_empty())
            .is_some_and(|requested| encounter.parent_uuid.as_deref() == Some(requested));
        if matched {
            encounter.parent_uuid = None;
            encounter.modified = Timestamp::now();
            encounter.modified_by = actor.id.clone();
            store::update_encounter(&conn, &encounter)?;
        }
        queries::render_view(&conn, &encounter, ViewOptions::default())
    }

    /// Move every encounter on one patient record onto another, keeping a merge
    /// record of the old linkage on each encounter.
    pub fn merge_encounters(
        &self,
        actor: &Actor,
        request: &MergeRequest,
    ) -> EncounterResult<MergeOutcome> {
        if request.child_record_uuid == request.parent_record_uuid {
            return Err(EncounterError::InvalidRequest(
                "Cannot merge identical patient records".to_owned(),
            ));
        }

        let now = Timestamp::now();
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let encounters = store::encounters_by_record_uuid(&tx, &request.child_record_uuid)?;
        let total = encounters.len() as u64;
        for mut encounter in encounters {
            encounter.merge_history.push(MergeRecord {
                record_uuid: encounter.patient_record_uuid.clone(),
                patient_uuid: encounter.patient_uuid.clone(),
                message_uuid: request.message_uuid.clone(),
            });
            encounter.patient_record_uuid = request.parent_record_uuid.clone();
            encounter.patient_uuid = request.parent_patient_uuid.clone();
            encounter.modified = now;
            encounter.modified_by = actor.id.clone();
            store::update_encounter(&tx, &encounter)?;

            match encounter.epr_encounter_id.as_deref().filter(|id| !id.is_empty()) {
                Some(epr) => tracing::info!(
                    child_record_uuid = %request.child_record_uuid,
                    parent_record_uuid = %request.parent_record_uuid,
                    parent_patient_uuid = %request.parent_patient_uuid,
                    message_uuid = %request.message_uuid,
                    "Merged encounter {}({})",
                    epr,
                    encounter.uuid
                ),
                None => tracing::info!(
                    child_record_uuid = %request.child_record_uuid,
                    parent_record_uuid = %request.parent_record_uuid,
                    parent_patient_uuid = %request.parent_patient_uuid,
                    message_uuid = %request.message_uuid,
                    "Merged local encounter ({})",
                    encounter.uuid
                ),
            }
        }
        tx.commit()?;
        Ok(MergeOutcome { total })
    }

    /// Correct when a score-system change took effect.
    pub fn update_score_system_history(
        &self,
        actor: &Actor,
        history_id: &str,
        patch: &ScoreSystemHistoryPatch,
    ) -> EncounterResult<ScoreSystemHistoryView> {
        let conn = self.db.lock();
        let mut entry = store::score_history_by_uuid(&conn, history_id)?.ok_or_else(|| {
            EncounterError::NotFound("Score system history not found".to_owned())
        })?;
        if entry.changed_time != patch.changed_time {
            entry.changed_time = patch.changed_time;
            entry.modified = Timestamp::now();
            entry.modified_by = actor.id.clone();
            store::update_score_history(&conn, &entry)?;
        }
        Ok(entry.to_view())
    }

    /// Delete every encounter and history row. Development use only; the REST
    /// layer refuses to expose this unless explicitly enabled.
    pub fn reset_database(&self) -> EncounterResult<ResetOutcome> {
        let start = Instant::now();
        let mut conn = self.db.lock();
        let result = (|| -> EncounterResult<()> {
            let tx = conn.transaction()?;
            store::purge_all(&tx)?;
            tx.commit()?;
            Ok(())
        })();
        if let Err(err) = result {
            tracing::error!("Failed to reset encounter database: {}", err);
            return Err(err);
        }
        tracing::info!("Dropped all encounter data");
        Ok(ResetOutcome {
            complete: true,
            time_taken: format!("{}s", start.elapsed().as_secs()),
        })
    }
}
