//! Outbound messages emitted when encounters change.
//!
//! The service publishes through the [`EventPublisher`] trait so deployments can
//! plug in a real broker client. The default [`LoggingPublisher`] writes each
//! message to the log instead, which is enough for local use and for tests.

use crate::{EncounterError, EncounterResult};
use serde_json::{json, Value};

/// Routing key for audit events.
pub const AUDIT_EVENT_ROUTE: &str = "audit.event";
/// Routing key for score-system change notifications.
pub const SCORE_SYSTEM_CHANGED_ROUTE: &str = "encounters.score-system-changed";
/// Routing key for encounter update notifications.
pub const ENCOUNTER_UPDATED_ROUTE: &str = "encounters.updated";

/// Sink for outbound messages.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, routing_key: &str, body: Value);
}

/// Publisher that logs messages rather than sending them anywhere.
pub struct LoggingPublisher;

impl EventPublisher for LoggingPublisher {
    fn publish(&self, routing_key: &str, body: Value) {
        tracing::info!(routing_key, body = %body, "Publishing message");
    }
}

pub(crate) fn publish_audit_event(
    publisher: &dyn EventPublisher,
    event_type: &str,
    event_data: Value,
) {
    publisher.publish(
        AUDIT_EVENT_ROUTE,
        json!({
            "event_type": event_type,
            "event_data": event_data,
        }),
    );
}

pub(crate) fn publish_encounter_update(publisher: &dyn EventPublisher, encounter_uuid: &str) {
    publisher.publish(
        ENCOUNTER_UPDATED_ROUTE,
        json!({ "encounter_id": encounter_uuid }),
    );
}

fn require_key<'a>(encounter: &'a Value, key: &'static str) -> EncounterResult<&'a Value> {
    encounter
        .get(key)
        .ok_or(EncounterError::MalformedEventPayload(key))
}

/// Publish a score-system change, wrapping the encounter in a synthetic
/// observation set that downstream scoring consumers expect.
///
/// The payload must be an expanded encounter projection. A projection missing
/// any required key is refused rather than sent incomplete.
pub(crate) fn publish_score_system_change(
    publisher: &dyn EventPublisher,
    encounter: &Value,
) -> EncounterResult<()> {
    require_key(encounter, "uuid")?;
    let score_system = require_key(encounter, "score_system")?;
    let spo2_scale = require_key(encounter, "spo2_scale")?;
    let modified = require_key(encounter, "modified")?;
    let modified_by = require_key(encounter, "modified_by")?;

    let observation_set = json!({
        "created": modified,
        "created_by": modified_by,
        "modified": modified,
        "modified_by": modified_by,
        "record_time": modified,
        "score_system": score_system,
        "spo2_scale": spo2_scale,
        "uuid": uuid::Uuid::new_v4().to_string(),
    });
    publisher.publish(
        SCORE_SYSTEM_CHANGED_ROUTE,
        json!({
            "actions": [{
                "name": "process_observation_set",
                "data": {
                    "encounter": encounter.clone(),
                    "observation_set": observation_set,
                },
            }],
        }),
    );
    Ok(())
}
