//! SQLite-backed storage for encounters and their history rows.
//!
//! Timestamps are stored as canonical millisecond-precision UTC text, so lexicographic
//! comparison in SQL matches chronological order. The `parent_uuid` and `encounter_uuid`
//! references are declared for documentation but foreign keys stay unenforced: a parent
//! encounter may be deleted, or never exist, without cascading into its children.

use crate::encounter::{Encounter, MergeRecord};
use crate::history::{LocationHistory, ScoreSystemHistory};
use crate::{EncounterError, EncounterResult};
use encounter_types::Timestamp;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// The sentinel deliberately uses a non-canonical text form so it can never collide
/// with a stored deletion timestamp. Live rows all coalesce onto it, which is what
/// makes the EPR id unique among live rows while deleted rows keep their history.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS encounter (
    uuid                TEXT PRIMARY KEY NOT NULL,
    created             TEXT NOT NULL,
    created_by          TEXT NOT NULL,
    modified            TEXT NOT NULL,
    modified_by         TEXT NOT NULL,
    encounter_type      TEXT,
    admitted_at         TEXT NOT NULL,
    discharged_at       TEXT,
    deleted_at          TEXT,
    epr_encounter_id    TEXT,
    location_uuid       TEXT NOT NULL,
    patient_record_uuid TEXT NOT NULL,
    patient_uuid        TEXT NOT NULL,
    dh_product_uuid     TEXT NOT NULL,
    score_system        TEXT,
    spo2_scale          INTEGER,
    parent_uuid         TEXT REFERENCES encounter (uuid),
    merge_history       TEXT NOT NULL DEFAULT '[]'
);

CREATE UNIQUE INDEX IF NOT EXISTS epr_encounter_id_deleted_at
    ON encounter (epr_encounter_id, COALESCE(deleted_at, '1970-01-01T00:00:00'));

CREATE INDEX IF NOT EXISTS encounter_patient_uuid ON encounter (patient_uuid);
CREATE INDEX IF NOT EXISTS encounter_location_uuid ON encounter (location_uuid);
CREATE INDEX IF NOT EXISTS encounter_patient_record_uuid ON encounter (patient_record_uuid);
CREATE INDEX IF NOT EXISTS encounter_parent_uuid ON encounter (parent_uuid);
CREATE INDEX IF NOT EXISTS encounter_modified ON encounter (modified);

CREATE TABLE IF NOT EXISTS location_history (
    uuid           TEXT PRIMARY KEY NOT NULL,
    created        TEXT NOT NULL,
    created_by     TEXT NOT NULL,
    modified       TEXT NOT NULL,
    modified_by    TEXT NOT NULL,
    encounter_uuid TEXT NOT NULL REFERENCES encounter (uuid),
    location_uuid  TEXT NOT NULL,
    arrived_at     TEXT,
    departed_at    TEXT
);

CREATE INDEX IF NOT EXISTS location_history_encounter_uuid ON location_history (encounter_uuid);
CREATE INDEX IF NOT EXISTS location_history_arrived_at ON location_history (arrived_at);

CREATE TABLE IF NOT EXISTS score_system_history (
    uuid                  TEXT PRIMARY KEY NOT NULL,
    created               TEXT NOT NULL,
    created_by            TEXT NOT NULL,
    modified              TEXT NOT NULL,
    modified_by           TEXT NOT NULL,
    encounter_uuid        TEXT NOT NULL REFERENCES encounter (uuid),
    changed_time          TEXT NOT NULL,
    score_system          TEXT,
    previous_score_system TEXT,
    spo2_scale            INTEGER,
    previous_spo2_scale   INTEGER
);

CREATE INDEX IF NOT EXISTS score_system_history_encounter_uuid
    ON score_system_history (encounter_uuid);
";

pub(crate) const ENCOUNTER_COLUMNS: &str = "uuid, created, created_by, modified, modified_by, \
    encounter_type, admitted_at, discharged_at, deleted_at, epr_encounter_id, location_uuid, \
    patient_record_uuid, patient_uuid, dh_product_uuid, score_system, spo2_scale, parent_uuid, \
    merge_history";

const LOCATION_HISTORY_COLUMNS: &str = "uuid, created, created_by, modified, modified_by, \
    encounter_uuid, location_uuid, arrived_at, departed_at";

const SCORE_HISTORY_COLUMNS: &str = "uuid, created, created_by, modified, modified_by, \
    encounter_uuid, changed_time, score_system, previous_score_system, spo2_scale, \
    previous_spo2_scale";

/// Shared handle to the encounter database.
///
/// The connection sits behind a mutex: each operation locks it, runs its statements
/// (usually inside a transaction), and releases. Cloning the handle is cheap.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open the database at `path`, creating the file and parent directory if needed,
    /// and apply the schema.
    pub fn open(path: &Path) -> EncounterResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(EncounterError::StorageDirCreation)?;
        }
        let conn = Connection::open(path).map_err(EncounterError::OpenDatabase)?;
        Self::from_connection(conn)
    }

    /// Open a throwaway in-memory database.
    pub fn open_in_memory() -> EncounterResult<Self> {
        let conn = Connection::open_in_memory().map_err(EncounterError::OpenDatabase)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> EncounterResult<Self> {
        conn.execute_batch(SCHEMA).map_err(EncounterError::Schema)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Whether a storage error is a violation of the EPR uniqueness index.
pub(crate) fn is_epr_conflict(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(error, Some(message)) => {
            error.code == rusqlite::ErrorCode::ConstraintViolation
                && message.contains("epr_encounter_id_deleted_at")
        }
        _ => false,
    }
}

fn column_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Timestamp> {
    let raw: String = row.get(idx)?;
    Timestamp::parse(&raw).map_err(|e| column_error(idx, e))
}

fn optional_timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Timestamp>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|value| Timestamp::parse(&value).map_err(|e| column_error(idx, e)))
        .transpose()
}

pub(crate) fn row_to_encounter(row: &Row<'_>) -> rusqlite::Result<Encounter> {
    let merge_history: String = row.get(17)?;
    let merge_history: Vec<MergeRecord> =
        serde_json::from_str(&merge_history).map_err(|e| column_error(17, e))?;
    Ok(Encounter {
        uuid: row.get(0)?,
        created: timestamp_column(row, 1)?,
        created_by: row.get(2)?,
        modified: timestamp_column(row, 3)?,
        modified_by: row.get(4)?,
        encounter_type: row.get(5)?,
        admitted_at: timestamp_column(row, 6)?,
        discharged_at: optional_timestamp_column(row, 7)?,
        deleted_at: optional_timestamp_column(row, 8)?,
        epr_encounter_id: row.get(9)?,
        location_uuid: row.get(10)?,
        patient_record_uuid: row.get(11)?,
        patient_uuid: row.get(12)?,
        dh_product_uuid: row.get(13)?,
        score_system: row.get(14)?,
        spo2_scale: row.get(15)?,
        parent_uuid: row.get(16)?,
        merge_history,
    })
}

fn row_to_location_history(row: &Row<'_>) -> rusqlite::Result<LocationHistory> {
    Ok(LocationHistory {
        uuid: row.get(0)?,
        created: timestamp_column(row, 1)?,
        created_by: row.get(2)?,
        modified: timestamp_column(row, 3)?,
        modified_by: row.get(4)?,
        encounter_uuid: row.get(5)?,
        location_uuid: row.get(6)?,
        arrived_at: optional_timestamp_column(row, 7)?,
        departed_at: optional_timestamp_column(row, 8)?,
    })
}

fn row_to_score_history(row: &Row<'_>) -> rusqlite::Result<ScoreSystemHistory> {
    Ok(ScoreSystemHistory {
        uuid: row.get(0)?,
        created: timestamp_column(row, 1)?,
        created_by: row.get(2)?,
        modified: timestamp_column(row, 3)?,
        modified_by: row.get(4)?,
        encounter_uuid: row.get(5)?,
        changed_time: timestamp_column(row, 6)?,
        score_system: row.get(7)?,
        previous_score_system: row.get(8)?,
        spo2_scale: row.get(9)?,
        previous_spo2_scale: row.get(10)?,
    })
}

pub(crate) fn insert_encounter(conn: &Connection, encounter: &Encounter) -> EncounterResult<()> {
    let merge_history =
        serde_json::to_string(&encounter.merge_history).map_err(EncounterError::Serialization)?;
    conn.execute(
        "INSERT INTO encounter (uuid, created, created_by, modified, modified_by, encounter_type, \
         admitted_at, discharged_at, deleted_at, epr_encounter_id, location_uuid, \
         patient_record_uuid, patient_uuid, dh_product_uuid, score_system, spo2_scale, \
         parent_uuid, merge_history) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            encounter.uuid,
            encounter.created.to_rfc3339(),
            encounter.created_by,
            encounter.modified.to_rfc3339(),
            encounter.modified_by,
            encounter.encounter_type,
            encounter.admitted_at.to_rfc3339(),
            encounter.discharged_at.map(|t| t.to_rfc3339()),
            encounter.deleted_at.map(|t| t.to_rfc3339()),
            encounter.epr_encounter_id,
            encounter.location_uuid,
            encounter.patient_record_uuid,
            encounter.patient_uuid,
            encounter.dh_product_uuid,
            encounter.score_system,
            encounter.spo2_scale,
            encounter.parent_uuid,
            merge_history,
        ],
    )?;
    Ok(())
}

pub(crate) fn update_encounter(conn: &Connection, encounter: &Encounter) -> EncounterResult<()> {
    let merge_history =
        serde_json::to_string(&encounter.merge_history).map_err(EncounterError::Serialization)?;
    conn.execute(
        "UPDATE encounter SET created = ?2, created_by = ?3, modified = ?4, modified_by = ?5, \
         encounter_type = ?6, admitted_at = ?7, discharged_at = ?8, deleted_at = ?9, \
         epr_encounter_id = ?10, location_uuid = ?11, patient_record_uuid = ?12, \
         patient_uuid = ?13, dh_product_uuid = ?14, score_system = ?15, spo2_scale = ?16, \
         parent_uuid = ?17, merge_history = ?18 \
         WHERE uuid = ?1",
        params![
            encounter.uuid,
            encounter.created.to_rfc3339(),
            encounter.created_by,
            encounter.modified.to_rfc3339(),
            encounter.modified_by,
            encounter.encounter_type,
            encounter.admitted_at.to_rfc3339(),
            encounter.discharged_at.map(|t| t.to_rfc3339()),
            encounter.deleted_at.map(|t| t.to_rfc3339()),
            encounter.epr_encounter_id,
            encounter.location_uuid,
            encounter.patient_record_uuid,
            encounter.patient_uuid,
            encounter.dh_product_uuid,
            encounter.score_system,
            encounter.spo2_scale,
            encounter.parent_uuid,
            merge_history,
        ],
    )?;
    Ok(())
}

pub(crate) fn encounter_by_uuid(
    conn: &Connection,
    uuid: &str,
) -> EncounterResult<Option<Encounter>> {
    let sql = format!("SELECT {ENCOUNTER_COLUMNS} FROM encounter WHERE uuid = ?1");
    let encounter = conn
        .query_row(&sql, params![uuid], row_to_encounter)
        .optional()?;
    Ok(encounter)
}

pub(crate) fn encounter_exists(conn: &Connection, uuid: &str) -> EncounterResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM encounter WHERE uuid = ?1",
            params![uuid],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub(crate) fn encounters_by_record_uuid(
    conn: &Connection,
    record_uuid: &str,
) -> EncounterResult<Vec<Encounter>> {
    let sql = format!(
        "SELECT {ENCOUNTER_COLUMNS} FROM encounter WHERE patient_record_uuid = ?1 \
         ORDER BY created, uuid"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![record_uuid], row_to_encounter)?;
    let encounters = rows.collect::<Result<Vec<_>, _>>()?;
    Ok(encounters)
}

pub(crate) fn insert_location_history(
    conn: &Connection,
    entry: &LocationHistory,
) -> EncounterResult<()> {
    conn.execute(
        "INSERT INTO location_history (uuid, created, created_by, modified, modified_by, \
         encounter_uuid, location_uuid, arrived_at, departed_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            entry.uuid,
            entry.created.to_rfc3339(),
            entry.created_by,
            entry.modified.to_rfc3339(),
            entry.modified_by,
            entry.encounter_uuid,
            entry.location_uuid,
            entry.arrived_at.map(|t| t.to_rfc3339()),
            entry.departed_at.map(|t| t.to_rfc3339()),
        ],
    )?;
    Ok(())
}

pub(crate) fn location_history_for(
    conn: &Connection,
    encounter_uuid: &str,
) -> EncounterResult<Vec<LocationHistory>> {
    // rows without an arrival time sort last
    let sql = format!(
        "SELECT {LOCATION_HISTORY_COLUMNS} FROM location_history WHERE encounter_uuid = ?1 \
         ORDER BY arrived_at IS NULL, arrived_at"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![encounter_uuid], row_to_location_history)?;
    let entries = rows.collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

pub(crate) fn insert_score_history(
    conn: &Connection,
    entry: &ScoreSystemHistory,
) -> EncounterResult<()> {
    conn.execute(
        "INSERT INTO score_system_history (uuid, created, created_by, modified, modified_by, \
         encounter_uuid, changed_time, score_system, previous_score_system, spo2_scale, \
         previous_spo2_scale) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            entry.uuid,
            entry.created.to_rfc3339(),
            entry.created_by,
            entry.modified.to_rfc3339(),
            entry.modified_by,
            entry.encounter_uuid,
            entry.changed_time.to_rfc3339(),
            entry.score_system,
            entry.previous_score_system,
            entry.spo2_scale,
            entry.previous_spo2_scale,
        ],
    )?;
    Ok(())
}

pub(crate) fn score_history_for(
    conn: &Connection,
    encounter_uuid: &str,
) -> EncounterResult<Vec<ScoreSystemHistory>> {
    let sql = format!(
        "SELECT {SCORE_HISTORY_COLUMNS} FROM score_system_history WHERE encounter_uuid = ?1 \
         ORDER BY created, uuid"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![encounter_uuid], row_to_score_history)?;
    let entries = rows.collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

pub(crate) fn score_history_by_uuid(
    conn: &Connection,
    uuid: &str,
) -> EncounterResult<Option<ScoreSystemHistory>> {
    let sql = format!("SELECT {SCORE_HISTORY_COLUMNS} FROM score_system_history WHERE uuid = ?1");
    let entry = conn
        .query_row(&sql, params![uuid], row_to_score_history)
        .optional()?;
    Ok(entry)
}

/// Persist a correction to a history entry. Only `changed_time` is mutable after creation.
pub(crate) fn update_score_history(
    conn: &Connection,
    entry: &ScoreSystemHistory,
) -> EncounterResult<()> {
    conn.execute(
        "UPDATE score_system_history SET modified = ?2, modified_by = ?3, changed_time = ?4 \
         WHERE uuid = ?1",
        params![
            entry.uuid,
            entry.modified.to_rfc3339(),
            entry.modified_by,
            entry.changed_time.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub(crate) fn purge_all(conn: &Connection) -> EncounterResult<()> {
    conn.execute("DELETE FROM location_history", [])?;
    conn.execute("DELETE FROM score_system_history", [])?;
    conn.execute("DELETE FROM encounter", [])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_encounter(uuid: &str, patient_uuid: &str, epr: Option<&str>) -> Encounter {
        let now = Timestamp::now();
        Encounter {
            uuid: uuid.into(),
            created: now,
            created_by: "tester".into(),
            modified: now,
            modified_by: "tester".into(),
            encounter_type: Some("INPATIENT".into()),
            admitted_at: now,
            discharged_at: None,
            deleted_at: None,
            epr_encounter_id: epr.map(Into::into),
            location_uuid: "L1".into(),
            patient_record_uuid: "R1".into(),
            patient_uuid: patient_uuid.into(),
            dh_product_uuid: "PRODUCT".into(),
            score_system: Some("news2".into()),
            spo2_scale: Some(1),
            parent_uuid: None,
            merge_history: Vec::new(),
        }
    }

    #[test]
    fn inserted_encounter_reads_back_identically() {
        let db = Db::open_in_memory().expect("open db");
        let conn = db.lock();
        let mut encounter = sample_encounter("E1", "P1", Some("epr-1"));
        encounter.merge_history.push(MergeRecord {
            record_uuid: "old-record".into(),
            patient_uuid: "old-patient".into(),
            message_uuid: "msg-1".into(),
        });
        insert_encounter(&conn, &encounter).expect("insert");

        let fetched = encounter_by_uuid(&conn, "E1")
            .expect("query")
            .expect("row present");
        assert_eq!(fetched, encounter);
    }

    #[test]
    fn missing_encounter_is_none() {
        let db = Db::open_in_memory().expect("open db");
        let conn = db.lock();
        assert!(encounter_by_uuid(&conn, "nope").expect("query").is_none());
        assert!(!encounter_exists(&conn, "nope").expect("query"));
    }

    #[test]
    fn live_epr_duplicates_are_rejected() {
        let db = Db::open_in_memory().expect("open db");
        let conn = db.lock();
        insert_encounter(&conn, &sample_encounter("E1", "P1", Some("epr-1"))).expect("insert");

        let err = insert_encounter(&conn, &sample_encounter("E2", "P2", Some("epr-1")))
            .expect_err("expected uniqueness violation");
        match err {
            EncounterError::Storage(inner) => assert!(is_epr_conflict(&inner)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn deleted_row_frees_its_epr_id() {
        let db = Db::open_in_memory().expect("open db");
        let conn = db.lock();
        let mut deleted = sample_encounter("E1", "P1", Some("epr-1"));
        deleted.deleted_at = Some(Timestamp::now());
        insert_encounter(&conn, &deleted).expect("insert deleted");

        insert_encounter(&conn, &sample_encounter("E2", "P1", Some("epr-1")))
            .expect("reinstated EPR id should insert");
    }

    #[test]
    fn local_encounters_are_not_constrained_by_the_index() {
        let db = Db::open_in_memory().expect("open db");
        let conn = db.lock();
        insert_encounter(&conn, &sample_encounter("E1", "P1", None)).expect("insert");
        insert_encounter(&conn, &sample_encounter("E2", "P1", None)).expect("insert");
    }

    #[test]
    fn update_persists_field_changes() {
        let db = Db::open_in_memory().expect("open db");
        let conn = db.lock();
        let mut encounter = sample_encounter("E1", "P1", None);
        insert_encounter(&conn, &encounter).expect("insert");

        encounter.location_uuid = "L2".into();
        encounter.discharged_at = Some(Timestamp::now());
        update_encounter(&conn, &encounter).expect("update");

        let fetched = encounter_by_uuid(&conn, "E1")
            .expect("query")
            .expect("row present");
        assert_eq!(fetched, encounter);
    }

    #[test]
    fn location_history_orders_missing_arrivals_last() {
        let db = Db::open_in_memory().expect("open db");
        let conn = db.lock();
        let encounter = sample_encounter("E1", "P1", None);
        insert_encounter(&conn, &encounter).expect("insert");

        let now = Timestamp::now();
        let make = |uuid: &str, arrived_at: Option<Timestamp>| LocationHistory {
            uuid: uuid.into(),
            created: now,
            created_by: "tester".into(),
            modified: now,
            modified_by: "tester".into(),
            encounter_uuid: "E1".into(),
            location_uuid: "L1".into(),
            arrived_at,
            departed_at: None,
        };
        let early = Timestamp::parse("2020-01-01T00:00:00.000Z").expect("parse");
        let late = Timestamp::parse("2021-01-01T00:00:00.000Z").expect("parse");
        insert_location_history(&conn, &make("LH1", None)).expect("insert");
        insert_location_history(&conn, &make("LH2", Some(late))).expect("insert");
        insert_location_history(&conn, &make("LH3", Some(early))).expect("insert");

        let entries = location_history_for(&conn, "E1").expect("query");
        let order: Vec<&str> = entries.iter().map(|e| e.uuid.as_str()).collect();
        assert_eq!(order, vec!["LH3", "LH2", "LH1"]);
    }

    #[test]
    fn purge_all_empties_every_table() {
        let db = Db::open_in_memory().expect("open db");
        let conn = db.lock();
        insert_encounter(&conn, &sample_encounter("E1", "P1", None)).expect("insert");
        purge_all(&conn).expect("purge");
        assert!(encounter_by_uuid(&conn, "E1").expect("query").is_none());
    }
}
