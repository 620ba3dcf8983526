//! Read operations: lookups, searches and the open-encounter views.

use crate::encounter::{Encounter, EncounterView, ViewOptions};
use crate::store::{self, ENCOUNTER_COLUMNS};
use crate::{EncounterError, EncounterResult, EncounterService};
use encounter_types::Timestamp;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection};
use std::collections::HashMap;

/// Sorts open encounters to the top, then most recent first.
const OPEN_FIRST_ORDER: &str = "CASE WHEN discharged_at IS NULL AND deleted_at IS NULL \
    THEN 0 ELSE 1 END, admitted_at DESC, created DESC";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SearchField {
    PatientUuid,
    LocationUuid,
    EprEncounterId,
}

impl SearchField {
    fn column(self) -> &'static str {
        match self {
            Self::PatientUuid => "patient_uuid",
            Self::LocationUuid => "location_uuid",
            Self::EprEncounterId => "epr_encounter_id",
        }
    }
}

/// Composable WHERE clause over the encounter table.
///
/// By default child encounters, deleted encounters and discharged encounters are
/// all excluded; each toggle loosens one of those filters. `open_as_of` widens
/// the discharge filter to anything still open at that instant.
#[derive(Debug, Default)]
struct EncounterFilter {
    fields: Vec<(SearchField, Vec<String>)>,
    open_as_of: Option<Timestamp>,
    modified_after: Option<Timestamp>,
    show_discharged: bool,
    show_deleted: bool,
    show_children: bool,
}

impl EncounterFilter {
    fn field_in(mut self, field: SearchField, values: Vec<String>) -> Self {
        self.fields.push((field, values));
        self
    }

    fn open_as_of(mut self, instant: Option<Timestamp>) -> Self {
        self.open_as_of = instant;
        self
    }

    fn modified_after(mut self, instant: Timestamp) -> Self {
        self.modified_after = Some(instant);
        self
    }

    fn show_discharged(mut self, show: bool) -> Self {
        self.show_discharged = show;
        self
    }

    fn show_deleted(mut self, show: bool) -> Self {
        self.show_deleted = show;
        self
    }

    fn show_children(mut self, show: bool) -> Self {
        self.show_children = show;
        self
    }

    fn build_where(&self) -> (String, Vec<SqlValue>) {
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();
        for (field, values) in &self.fields {
            // an empty value list matches nothing rather than everything
            if values.is_empty() {
                clauses.push("1 = 0".to_owned());
                continue;
            }
            let placeholders = vec!["?"; values.len()].join(", ");
            clauses.push(format!("{} IN ({placeholders})", field.column()));
            params.extend(values.iter().cloned().map(SqlValue::from));
        }
        if !self.show_discharged {
            match self.open_as_of {
                Some(instant) => {
                    clauses.push("(discharged_at IS NULL OR discharged_at > ?)".to_owned());
                    params.push(SqlValue::from(instant.to_rfc3339()));
                }
                None => clauses.push("discharged_at IS NULL".to_owned()),
            }
        }
        if !self.show_deleted {
            clauses.push("deleted_at IS NULL".to_owned());
        }
        if !self.show_children {
            clauses.push("parent_uuid IS NULL".to_owned());
        }
        if let Some(instant) = self.modified_after {
            clauses.push("modified > ?".to_owned());
            params.push(SqlValue::from(instant.to_rfc3339()));
        }
        if clauses.is_empty() {
            return ("1 = 1".to_owned(), params);
        }
        (clauses.join(" AND "), params)
    }
}

fn select_encounters(
    conn: &Connection,
    filter: &EncounterFilter,
    order: &str,
) -> EncounterResult<Vec<Encounter>> {
    let (where_clause, params) = filter.build_where();
    let sql = format!(
        "SELECT {ENCOUNTER_COLUMNS} FROM encounter WHERE {where_clause} ORDER BY {order}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(params), store::row_to_encounter)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Select only the best-ranked matching encounter for each patient: open beats
/// closed, then later admission, then later creation.
fn select_latest_per_patient(
    conn: &Connection,
    filter: &EncounterFilter,
) -> EncounterResult<Vec<Encounter>> {
    let (where_clause, params) = filter.build_where();
    let sql = format!(
        "SELECT {ENCOUNTER_COLUMNS} FROM ( \
            SELECT {ENCOUNTER_COLUMNS}, ROW_NUMBER() OVER ( \
                PARTITION BY patient_uuid ORDER BY {OPEN_FIRST_ORDER} \
            ) AS recency FROM encounter WHERE {where_clause} \
        ) WHERE recency = 1 ORDER BY patient_uuid"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(params), store::row_to_encounter)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub(crate) fn encounter_or_not_found(
    conn: &Connection,
    encounter_id: &str,
) -> EncounterResult<Encounter> {
    store::encounter_by_uuid(conn, encounter_id)?
        .ok_or_else(|| EncounterError::NotFound("Encounter not found".to_owned()))
}

/// Render one projection of an encounter, fetching history rows only when the
/// projection needs them.
pub(crate) fn render_view(
    conn: &Connection,
    encounter: &Encounter,
    options: ViewOptions,
) -> EncounterResult<EncounterView> {
    if options.compact {
        return Ok(encounter.compact_view(options.expanded));
    }
    let location_history = store::location_history_for(conn, &encounter.uuid)?;
    let score_history = store::score_history_for(conn, &encounter.uuid)?;
    Ok(encounter.detailed_view(&location_history, &score_history, options.expanded))
}

/// All descendants of `root_uuid`, found by walking `parent_uuid` references.
///
/// The walk is seeded with the literal root id, so an unknown root yields an
/// empty list rather than an error. Deduplication in the recursive step keeps
/// the walk terminating even if stored parent references form a loop.
pub(crate) fn child_encounter_ids(
    conn: &Connection,
    root_uuid: &str,
    show_deleted: bool,
) -> EncounterResult<Vec<String>> {
    let deleted_clause = if show_deleted {
        ""
    } else {
        " AND child.deleted_at IS NULL"
    };
    let sql = format!(
        "WITH RECURSIVE descendant (uuid) AS ( \
            SELECT ?1 \
            UNION \
            SELECT child.uuid FROM encounter child \
                JOIN descendant ON child.parent_uuid = descendant.uuid{deleted_clause} \
        ) \
        SELECT uuid FROM descendant WHERE uuid != ?1 ORDER BY uuid"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![root_uuid], |row| row.get(0))?;
    Ok(rows.collect::<Result<Vec<String>, _>>()?)
}

/// Uuids of all open local encounters for a patient, newest admission first.
///
/// Child encounters are not considered.
pub(crate) fn open_local_encounter_uuids(
    conn: &Connection,
    patient_id: &str,
) -> EncounterResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT uuid FROM encounter WHERE patient_uuid = ?1 \
         AND parent_uuid IS NULL AND discharged_at IS NULL AND deleted_at IS NULL \
         AND (epr_encounter_id IS NULL OR epr_encounter_id = '') \
         ORDER BY admitted_at DESC",
    )?;
    let rows = stmt.query_map(params![patient_id], |row| row.get(0))?;
    let uuids = rows.collect::<Result<Vec<String>, _>>()?;
    tracing::debug!(
        "Found {} open local encounters for patient with UUID {}",
        uuids.len(),
        patient_id
    );
    Ok(uuids)
}

fn parse_point_in_time(value: Option<&str>) -> EncounterResult<Option<Timestamp>> {
    value
        .map(Timestamp::parse_lenient)
        .transpose()
        .map_err(EncounterError::from)
}

impl EncounterService {
    /// Fetch a single encounter by uuid.
    ///
    /// Soft-deleted encounters are reported as missing unless `show_deleted` is
    /// set, which allows opening a deleted encounter specifically by id.
    pub fn get_encounter(
        &self,
        encounter_id: &str,
        show_deleted: bool,
    ) -> EncounterResult<EncounterView> {
        let conn = self.db.lock();
        let encounter = encounter_or_not_found(&conn, encounter_id)?;
        if !show_deleted && encounter.is_deleted() {
            return Err(EncounterError::NotFound("Encounter not found".to_owned()));
        }
        render_view(&conn, &encounter, ViewOptions::default())
    }

    /// Uuids of every descendant of the given encounter.
    pub fn get_child_encounters(
        &self,
        encounter_id: &str,
        show_deleted: bool,
    ) -> EncounterResult<Vec<String>> {
        let conn = self.db.lock();
        let children = child_encounter_ids(&conn, encounter_id, show_deleted)?;
        tracing::debug!(
            "Found {} child encounters for encounter {}",
            children.len(),
            encounter_id
        );
        Ok(children)
    }

    /// Search encounters by patient uuid and/or EPR encounter id.
    ///
    /// Results include discharged encounters and sort open ones to the top.
    /// Non-compact projections carry each encounter's descendant uuids.
    pub fn get_encounters_by_patient_or_epr_id(
        &self,
        patient_id: Option<&str>,
        epr_encounter_id: Option<&str>,
        options: ViewOptions,
        show_deleted: bool,
        show_children: bool,
    ) -> EncounterResult<Vec<EncounterView>> {
        let mut filter = EncounterFilter::default()
            .show_discharged(true)
            .show_deleted(show_deleted)
            .show_children(show_children);
        let mut any_field = false;
        if let Some(patient_id) = patient_id {
            filter = filter.field_in(SearchField::PatientUuid, vec![patient_id.to_owned()]);
            any_field = true;
        }
        if let Some(epr_id) = epr_encounter_id {
            filter = filter.field_in(SearchField::EprEncounterId, vec![epr_id.to_owned()]);
            any_field = true;
        }
        if !any_field {
            return Err(EncounterError::InvalidRequest(
                "At least one of patient id or epr id must be specified".to_owned(),
            ));
        }

        let conn = self.db.lock();
        let encounters = select_encounters(&conn, &filter, OPEN_FIRST_ORDER)?;
        tracing::debug!("Found {} encounters", encounters.len());
        let mut views = Vec::with_capacity(encounters.len());
        for encounter in &encounters {
            let mut view = render_view(&conn, encounter, options)?;
            if !options.compact {
                view.child_encounter_uuids =
                    Some(child_encounter_ids(&conn, &encounter.uuid, true)?);
            }
            views.push(view);
        }
        Ok(views)
    }

    /// The latest open encounter for each of the given patients.
    pub fn get_open_encounters_for_patients(
        &self,
        patient_ids: &[String],
        open_as_of: Option<&str>,
        options: ViewOptions,
    ) -> EncounterResult<Vec<EncounterView>> {
        let filter = EncounterFilter::default()
            .field_in(SearchField::PatientUuid, patient_ids.to_vec())
            .open_as_of(parse_point_in_time(open_as_of)?);
        let conn = self.db.lock();
        let encounters = select_latest_per_patient(&conn, &filter)?;
        encounters
            .iter()
            .map(|encounter| render_view(&conn, encounter, options))
            .collect()
    }

    /// The latest open encounter for one patient, with descendant uuids attached
    /// to non-compact projections.
    pub fn get_open_encounters_for_patient(
        &self,
        patient_id: &str,
        open_as_of: Option<&str>,
        options: ViewOptions,
    ) -> EncounterResult<Vec<EncounterView>> {
        let filter = EncounterFilter::default()
            .field_in(SearchField::PatientUuid, vec![patient_id.to_owned()])
            .open_as_of(parse_point_in_time(open_as_of)?);
        let conn = self.db.lock();
        let encounters = select_latest_per_patient(&conn, &filter)?;
        let mut views = Vec::with_capacity(encounters.len());
        for encounter in &encounters {
            let mut view = render_view(&conn, encounter, options)?;
            if !options.compact {
                view.child_encounter_uuids =
                    Some(child_encounter_ids(&conn, &encounter.uuid, true)?);
            }
            views.push(view);
        }
        Ok(views)
    }

    /// The latest open encounter per patient across the given locations.
    pub fn get_open_encounters_for_locations(
        &self,
        location_uuids: &[String],
        open_as_of: Option<&str>,
        compact: bool,
    ) -> EncounterResult<Vec<EncounterView>> {
        let filter = EncounterFilter::default()
            .field_in(SearchField::LocationUuid, location_uuids.to_vec())
            .open_as_of(parse_point_in_time(open_as_of)?);
        let conn = self.db.lock();
        let encounters = select_latest_per_patient(&conn, &filter)?;
        encounters
            .iter()
            .map(|encounter| {
                render_view(
                    &conn,
                    encounter,
                    ViewOptions {
                        compact,
                        expanded: false,
                    },
                )
            })
            .collect()
    }

    /// Count of distinct patients with an open encounter at each location.
    ///
    /// Locations with no open encounters are absent from the result.
    pub fn get_patient_count_for_locations(
        &self,
        location_uuids: &[String],
        open_as_of: Option<&str>,
    ) -> EncounterResult<HashMap<String, i64>> {
        let filter = EncounterFilter::default()
            .field_in(SearchField::LocationUuid, location_uuids.to_vec())
            .open_as_of(parse_point_in_time(open_as_of)?);
        let (where_clause, params) = filter.build_where();
        let sql = format!(
            "SELECT location_uuid, COUNT(DISTINCT patient_uuid) FROM encounter \
             WHERE {where_clause} GROUP BY location_uuid"
        );
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        Ok(rows.collect::<Result<HashMap<_, _>, _>>()?)
    }

    /// Change feed: every encounter modified strictly after `modified_since`,
    /// most recently modified first. Includes discharged encounters.
    pub fn get_encounters(
        &self,
        modified_since: &str,
        options: ViewOptions,
        show_deleted: bool,
        show_children: bool,
    ) -> EncounterResult<Vec<EncounterView>> {
        let since = Timestamp::parse_lenient(modified_since)?;
        let filter = EncounterFilter::default()
            .show_discharged(true)
            .show_deleted(show_deleted)
            .show_children(show_children)
            .modified_after(since);
        let conn = self.db.lock();
        let encounters = select_encounters(&conn, &filter, "modified DESC")?;
        encounters
            .iter()
            .map(|encounter| render_view(&conn, encounter, options))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::service_with_recorder;

    fn ts(value: &str) -> Timestamp {
        Timestamp::parse(value).expect("valid timestamp")
    }

    fn base_encounter(uuid: &str, patient_uuid: &str) -> Encounter {
        let created = ts("2020-01-01T00:00:00.000Z");
        Encounter {
            uuid: uuid.into(),
            created,
            created_by: "tester".into(),
            modified: created,
            modified_by: "tester".into(),
            encounter_type: Some("INPATIENT".into()),
            admitted_at: created,
            discharged_at: None,
            deleted_at: None,
            epr_encounter_id: None,
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

    fn seed(
        service: &EncounterService,
        uuid: &str,
        patient_uuid: &str,
        tweak: impl FnOnce(&mut Encounter),
    ) -> Encounter {
        let mut encounter = base_encounter(uuid, patient_uuid);
        tweak(&mut encounter);
        let conn = service.db.lock();
        store::insert_encounter(&conn, &encounter).expect("insert");
        encounter
    }

    fn uuids(views: &[EncounterView]) -> Vec<&str> {
        views.iter().map(|view| view.uuid.as_str()).collect()
    }

    #[test]
    fn missing_encounters_are_not_found() {
        let (service, _) = service_with_recorder();
        let err = service
            .get_encounter("nope", false)
            .expect_err("expected not-found");
        assert!(matches!(err, EncounterError::NotFound(message) if message == "Encounter not found"));
    }

    #[test]
    fn deleted_encounters_hide_unless_asked_for() {
        let (service, _) = service_with_recorder();
        seed(&service, "E1", "P1", |e| {
            e.deleted_at = Some(ts("2020-06-01T00:00:00.000Z"));
        });

        let err = service
            .get_encounter("E1", false)
            .expect_err("expected not-found");
        assert!(matches!(err, EncounterError::NotFound(_)));

        let view = service.get_encounter("E1", true).expect("fetch deleted");
        assert_eq!(view.uuid, "E1");
        assert!(view.detail.is_some());
    }

    #[test]
    fn search_requires_a_patient_or_epr_id() {
        let (service, _) = service_with_recorder();
        let err = service
            .get_encounters_by_patient_or_epr_id(
                None,
                None,
                ViewOptions::default(),
                false,
                false,
            )
            .expect_err("expected invalid request");
        assert!(matches!(
            err,
            EncounterError::InvalidRequest(message)
                if message == "At least one of patient id or epr id must be specified"
        ));
    }

    #[test]
    fn search_sorts_open_encounters_above_newer_closed_ones() {
        let (service, _) = service_with_recorder();
        seed(&service, "OPEN-OLD", "P1", |e| {
            e.admitted_at = ts("2019-01-01T00:00:00.000Z");
        });
        seed(&service, "CLOSED-NEW", "P1", |e| {
            e.admitted_at = ts("2021-01-01T00:00:00.000Z");
            e.discharged_at = Some(ts("2021-02-01T00:00:00.000Z"));
        });

        let views = service
            .get_encounters_by_patient_or_epr_id(
                Some("P1"),
                None,
                ViewOptions::default(),
                false,
                false,
            )
            .expect("search");
        assert_eq!(uuids(&views), vec!["OPEN-OLD", "CLOSED-NEW"]);
        // non-compact search results always carry their descendant list
        assert_eq!(views[0].child_encounter_uuids, Some(Vec::new()));
    }

    #[test]
    fn search_by_epr_id_matches_only_that_encounter() {
        let (service, _) = service_with_recorder();
        seed(&service, "E1", "P1", |e| {
            e.epr_encounter_id = Some("2020L1234".into());
        });
        seed(&service, "E2", "P1", |_| {});

        let views = service
            .get_encounters_by_patient_or_epr_id(
                None,
                Some("2020L1234"),
                ViewOptions {
                    compact: true,
                    expanded: false,
                },
                false,
                false,
            )
            .expect("search");
        assert_eq!(uuids(&views), vec!["E1"]);
        assert!(views[0].child_encounter_uuids.is_none());
        assert!(views[0].detail.is_none());
    }

    #[test]
    fn latest_open_encounter_wins_per_patient() {
        let (service, _) = service_with_recorder();
        seed(&service, "P1-OLD", "P1", |e| {
            e.admitted_at = ts("2020-01-01T00:00:00.000Z");
        });
        seed(&service, "P1-NEW", "P1", |e| {
            e.admitted_at = ts("2020-05-01T00:00:00.000Z");
        });
        seed(&service, "P2-ONLY", "P2", |_| {});
        seed(&service, "P3-CLOSED", "P3", |e| {
            e.discharged_at = Some(ts("2020-03-01T00:00:00.000Z"));
        });

        let views = service
            .get_open_encounters_for_patients(
                &["P1".into(), "P2".into(), "P3".into()],
                None,
                ViewOptions::default(),
            )
            .expect("open encounters");
        assert_eq!(uuids(&views), vec!["P1-NEW", "P2-ONLY"]);
    }

    #[test]
    fn open_as_of_includes_encounters_discharged_later() {
        let (service, _) = service_with_recorder();
        seed(&service, "E1", "P1", |e| {
            e.discharged_at = Some(ts("2020-03-01T00:00:00.000Z"));
        });

        let without = service
            .get_open_encounters_for_patients(&["P1".into()], None, ViewOptions::default())
            .expect("open encounters");
        assert!(without.is_empty());

        let as_of = service
            .get_open_encounters_for_patients(
                &["P1".into()],
                Some("2020-02-01"),
                ViewOptions::default(),
            )
            .expect("open encounters as of date");
        assert_eq!(uuids(&as_of), vec!["E1"]);
    }

    #[test]
    fn open_encounter_lookup_rejects_bad_timestamps() {
        let (service, _) = service_with_recorder();
        let err = service
            .get_open_encounters_for_patients(
                &["P1".into()],
                Some("01/02/2020"),
                ViewOptions::default(),
            )
            .expect_err("expected timestamp failure");
        assert!(matches!(err, EncounterError::InvalidTimestamp(_)));
    }

    #[test]
    fn singular_open_lookup_attaches_children() {
        let (service, _) = service_with_recorder();
        seed(&service, "PARENT", "P1", |_| {});
        seed(&service, "CHILD", "P1", |e| {
            e.parent_uuid = Some("PARENT".into());
        });

        let views = service
            .get_open_encounters_for_patient("P1", None, ViewOptions::default())
            .expect("open encounters");
        assert_eq!(uuids(&views), vec!["PARENT"]);
        assert_eq!(
            views[0].child_encounter_uuids,
            Some(vec!["CHILD".to_owned()])
        );
    }

    #[test]
    fn location_lookup_returns_latest_per_patient_without_children() {
        let (service, _) = service_with_recorder();
        seed(&service, "E1", "P1", |_| {});
        seed(&service, "E2", "P2", |e| {
            e.location_uuid = "L2".into();
        });

        let views = service
            .get_open_encounters_for_locations(&["L1".into(), "L2".into()], None, false)
            .expect("location lookup");
        assert_eq!(views.len(), 2);
        assert!(views.iter().all(|view| view.child_encounter_uuids.is_none()));

        let compact = service
            .get_open_encounters_for_locations(&["L1".into()], None, true)
            .expect("compact location lookup");
        assert_eq!(uuids(&compact), vec!["E1"]);
        assert!(compact[0].detail.is_none());
    }

    #[test]
    fn patient_counts_skip_empty_locations() {
        let (service, _) = service_with_recorder();
        seed(&service, "E1", "P1", |_| {});
        seed(&service, "E2", "P2", |_| {});
        // same patient twice still counts once
        seed(&service, "E3", "P2", |e| {
            e.admitted_at = ts("2020-02-01T00:00:00.000Z");
        });
        seed(&service, "E4", "P3", |e| {
            e.location_uuid = "L2".into();
            e.discharged_at = Some(ts("2020-03-01T00:00:00.000Z"));
        });

        let counts = service
            .get_patient_count_for_locations(&["L1".into(), "L2".into(), "L3".into()], None)
            .expect("patient counts");
        assert_eq!(counts.len(), 1);
        assert_eq!(counts.get("L1"), Some(&2));
    }

    #[test]
    fn child_walk_spans_generations_and_skips_deleted_branches() {
        let (service, _) = service_with_recorder();
        seed(&service, "ROOT", "P1", |_| {});
        seed(&service, "CHILD", "P1", |e| {
            e.parent_uuid = Some("ROOT".into());
        });
        seed(&service, "GRANDCHILD", "P1", |e| {
            e.parent_uuid = Some("CHILD".into());
        });
        seed(&service, "DELETED-CHILD", "P1", |e| {
            e.parent_uuid = Some("ROOT".into());
            e.deleted_at = Some(ts("2020-06-01T00:00:00.000Z"));
        });

        let live = service.get_child_encounters("ROOT", false).expect("walk");
        assert_eq!(live, vec!["CHILD".to_owned(), "GRANDCHILD".to_owned()]);

        let all = service.get_child_encounters("ROOT", true).expect("walk");
        assert_eq!(
            all,
            vec![
                "CHILD".to_owned(),
                "DELETED-CHILD".to_owned(),
                "GRANDCHILD".to_owned(),
            ]
        );

        let unknown = service.get_child_encounters("NOPE", false).expect("walk");
        assert!(unknown.is_empty());
    }

    #[test]
    fn child_walk_terminates_on_a_parent_loop() {
        let (service, _) = service_with_recorder();
        seed(&service, "A", "P1", |e| {
            e.parent_uuid = Some("B".into());
        });
        seed(&service, "B", "P1", |e| {
            e.parent_uuid = Some("A".into());
        });

        let children = service.get_child_encounters("A", false).expect("walk");
        assert_eq!(children, vec!["B".to_owned()]);
    }

    #[test]
    fn change_feed_is_strict_and_newest_first() {
        let (service, _) = service_with_recorder();
        seed(&service, "AT-CUTOFF", "P1", |e| {
            e.modified = ts("2020-03-01T00:00:00.000Z");
        });
        seed(&service, "LATER", "P2", |e| {
            e.modified = ts("2020-04-01T00:00:00.000Z");
        });
        seed(&service, "LATEST", "P3", |e| {
            e.modified = ts("2020-05-01T00:00:00.000Z");
            e.discharged_at = Some(ts("2020-05-01T00:00:00.000Z"));
        });
        seed(&service, "DELETED", "P4", |e| {
            e.modified = ts("2020-06-01T00:00:00.000Z");
            e.deleted_at = Some(ts("2020-06-01T00:00:00.000Z"));
        });

        let views = service
            .get_encounters(
                "2020-03-01T00:00:00.000Z",
                ViewOptions::default(),
                false,
                false,
            )
            .expect("feed");
        assert_eq!(uuids(&views), vec!["LATEST", "LATER"]);

        let with_deleted = service
            .get_encounters("2020-03-01", ViewOptions::default(), true, false)
            .expect("feed with deleted");
        assert_eq!(uuids(&with_deleted), vec!["DELETED", "LATEST", "LATER"]);
    }

    #[test]
    fn open_local_lookup_ignores_epr_discharged_and_child_rows() {
        let (service, _) = service_with_recorder();
        seed(&service, "LOCAL-OLD", "P1", |e| {
            e.admitted_at = ts("2020-01-01T00:00:00.000Z");
        });
        seed(&service, "LOCAL-NEW", "P1", |e| {
            e.admitted_at = ts("2020-02-01T00:00:00.000Z");
        });
        seed(&service, "BLANK-EPR", "P1", |e| {
            e.admitted_at = ts("2020-03-01T00:00:00.000Z");
            e.epr_encounter_id = Some(String::new());
        });
        seed(&service, "EPR", "P1", |e| {
            e.epr_encounter_id = Some("2020L1".into());
        });
        seed(&service, "DISCHARGED", "P1", |e| {
            e.discharged_at = Some(ts("2020-04-01T00:00:00.000Z"));
        });
        seed(&service, "CHILD", "P1", |e| {
            e.parent_uuid = Some("LOCAL-OLD".into());
        });

        let conn = service.db.lock();
        let locals = open_local_encounter_uuids(&conn, "P1").expect("lookup");
        assert_eq!(
            locals,
            vec![
                "BLANK-EPR".to_owned(),
                "LOCAL-NEW".to_owned(),
                "LOCAL-OLD".to_owned(),
            ]
        );
    }
}
