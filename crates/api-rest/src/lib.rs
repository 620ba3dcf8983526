//! # API REST
//!
//! REST API implementation for the encounters service.
//!
//! Handles:
//! - HTTP endpoints with axum
//! - OpenAPI/Swagger documentation
//! - REST-specific concerns (JSON serialization, CORS, actor headers)
//!
//! [`router`] builds the complete application from an [`AppState`]; the
//! binaries only wire configuration and storage around it.

#![warn(rust_2018_idioms)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::{
    async_trait,
    extract::{FromRequestParts, Path as AxumPath, Query, State},
    http::{request::Parts, StatusCode},
    response::Json,
    routing::{delete, get, patch, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use encounters_core::{
    Actor, CoreConfig, CreateEncounter, EncounterDetail, EncounterError, EncounterPatch,
    EncounterService, EncounterView, IdentifierView, LocationHistoryView, MergeOutcome,
    MergeRequest, NewLocationHistory, ProductRef, RemoveFields, ResetOutcome,
    ScoreSystemHistoryPatch, ScoreSystemHistoryView, ViewOptions,
};

/// Header carrying the authenticated actor id, injected by the gateway.
pub const ACTOR_ID_HEADER: &str = "x-actor-id";
/// Header carrying the actor's EWS edit claim.
pub const CAN_EDIT_EWS_HEADER: &str = "x-can-edit-ews";

/// Application state for the REST API server
///
/// Contains shared state that needs to be accessible to all request handlers:
/// the [`EncounterService`] for data operations and the resolved configuration.
#[derive(Clone)]
pub struct AppState {
    pub service: EncounterService,
    pub config: Arc<CoreConfig>,
}

/// Actor identity taken from the gateway-injected request headers.
///
/// `x-actor-id` is required on every mutating endpoint; requests without it
/// are rejected with 401. `x-can-edit-ews: true` grants the EWS edit claim.
pub struct RequestActor(pub Actor);

#[async_trait]
impl<S> FromRequestParts<S> for RequestActor
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let actor_id = parts
            .headers
            .get(ACTOR_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                (
                    StatusCode::UNAUTHORIZED,
                    "Missing X-Actor-Id header".to_owned(),
                )
            })?;
        let can_edit_ews = parts
            .headers
            .get(CAN_EDIT_EWS_HEADER)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.eq_ignore_ascii_case("true"));
        Ok(RequestActor(
            Actor::new(actor_id).with_ews_permission(can_edit_ews),
        ))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SearchParams {
    patient_id: Option<String>,
    epr_encounter_id: Option<String>,
    open_as_of: Option<String>,
    compact: bool,
    show_deleted: bool,
    show_children: bool,
    expanded: bool,
}

#[derive(Debug, Deserialize)]
struct FeedParams {
    modified_since: String,
    #[serde(default)]
    compact: bool,
    #[serde(default)]
    show_deleted: bool,
    #[serde(default)]
    show_children: bool,
    #[serde(default)]
    expanded: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ShowDeletedParams {
    show_deleted: bool,
}

#[derive(Debug, Deserialize)]
struct LatestParams {
    patient_id: String,
    open_as_of: Option<String>,
    #[serde(default)]
    compact: bool,
    #[serde(default)]
    expanded: bool,
}

/// Query parameters shared by the bulk lookup endpoints.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BatchParams {
    open_as_of: Option<String>,
    compact: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PatientsParams {
    open_as_of: Option<String>,
    compact: bool,
    expanded: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CountParams {
    open_as_of: Option<String>,
}

/// Health check payload.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub ok: bool,
    pub message: String,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        create_encounter,
        get_encounters_by_filters,
        get_encounter_by_uuid,
        get_child_encounters,
        update_encounter,
        remove_from_encounter,
        update_score_system_history,
        get_encounters,
        get_latest_encounter_by_patient_id,
        retrieve_latest_encounters_by_patient_ids,
        retrieve_open_encounters_by_locations,
        retrieve_encounters_for_patients,
        retrieve_patient_count_for_locations,
        merge_encounters,
        drop_data,
    ),
    components(schemas(
        HealthResponse,
        EncounterView,
        EncounterDetail,
        IdentifierView,
        ProductRef,
        LocationHistoryView,
        ScoreSystemHistoryView,
        CreateEncounter,
        NewLocationHistory,
        EncounterPatch,
        RemoveFields,
        ScoreSystemHistoryPatch,
        MergeRequest,
        MergeOutcome,
        ResetOutcome,
    ))
)]
struct ApiDoc;

/// Builds the complete REST application router.
///
/// All routes share one [`AppState`]. The destructive `/drop_data` route is
/// only mounted when the configuration allows it, so in normal deployments it
/// does not exist at all.
pub fn router(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/health", get(health))
        .route("/encounter", post(create_encounter))
        .route("/encounter", get(get_encounters_by_filters))
        .route("/encounter/latest", get(get_latest_encounter_by_patient_id))
        .route(
            "/encounter/latest",
            post(retrieve_latest_encounters_by_patient_ids),
        )
        .route(
            "/encounter/locations",
            post(retrieve_open_encounters_by_locations),
        )
        .route(
            "/encounter/locations/patient_count",
            post(retrieve_patient_count_for_locations),
        )
        .route("/encounter/patients", post(retrieve_encounters_for_patients))
        .route("/encounter/merge", post(merge_encounters))
        .route("/encounter/:encounter_id", get(get_encounter_by_uuid))
        .route("/encounter/:encounter_id", patch(update_encounter))
        .route("/encounter/:encounter_id", delete(remove_from_encounter))
        .route(
            "/encounter/:encounter_id/children",
            get(get_child_encounters),
        )
        .route("/encounters", get(get_encounters))
        .route(
            "/score_system_history/:score_system_history_id",
            patch(update_score_system_history),
        );
    if state.config.allow_drop_data() {
        app = app.route("/drop_data", post(drop_data));
    }
    app.merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Health check response", body = HealthResponse)
    )
)]
/// Health check endpoint for the REST API
///
/// Returns the current health status of the encounters REST API service.
/// This endpoint is used for monitoring and load balancer health checks.
#[axum::debug_handler]
async fn health(State(_state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        message: "Encounters API is alive".into(),
    })
}

#[utoipa::path(
    post,
    path = "/encounter",
    request_body = CreateEncounter,
    responses(
        (status = 200, description = "The created encounter", body = EncounterView),
        (status = 401, description = "Missing actor identity"),
        (status = 403, description = "Actor may not change EWS fields"),
        (status = 409, description = "Conflicting open encounter exists"),
        (status = 422, description = "Invalid encounter data"),
        (status = 500, description = "Internal server error")
    )
)]
/// Create a new encounter
///
/// Persists the encounter together with any supplied location history and
/// publishes the creation event. Duplicate live encounters (by EPR encounter
/// id, or a second open local encounter for the same patient) are rejected
/// with 409.
#[axum::debug_handler]
async fn create_encounter(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Json(data): Json<CreateEncounter>,
) -> Result<Json<EncounterView>, (StatusCode, String)> {
    state
        .service
        .create_encounter(&actor, &data)
        .map(Json)
        .map_err(error_response)
}

#[utoipa::path(
    get,
    path = "/encounter",
    responses(
        (status = 200, description = "Matching encounters, most recent first", body = [EncounterView]),
        (status = 400, description = "Missing filter parameters"),
        (status = 500, description = "Internal server error")
    )
)]
/// Get encounters by filter
///
/// Gets encounters matching a patient UUID or EPR encounter ID. With
/// `open_as_of`, returns the encounters for the patient that were still open
/// at that point in time, which requires `patient_id`.
#[axum::debug_handler]
async fn get_encounters_by_filters(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<EncounterView>>, (StatusCode, String)> {
    if params.patient_id.is_none() && params.epr_encounter_id.is_none() {
        return Err((
            StatusCode::BAD_REQUEST,
            "Request should contain a patient_id or epr_encounter_id".to_owned(),
        ));
    }
    let options = ViewOptions {
        compact: params.compact,
        expanded: params.expanded,
    };
    let results = match non_empty(params.open_as_of.as_deref()) {
        Some(open_as_of) => {
            let patient_id = match params.patient_id.as_deref() {
                Some(patient_id) => patient_id,
                None => {
                    return Err((
                        StatusCode::BAD_REQUEST,
                        "Request with open_as_of should contain a patient_id".to_owned(),
                    ))
                }
            };
            state
                .service
                .get_open_encounters_for_patient(patient_id, Some(open_as_of), options)
        }
        None => state.service.get_encounters_by_patient_or_epr_id(
            params.patient_id.as_deref(),
            params.epr_encounter_id.as_deref(),
            options,
            params.show_deleted,
            params.show_children,
        ),
    };
    results.map(Json).map_err(error_response)
}

#[utoipa::path(
    get,
    path = "/encounter/{encounter_id}",
    responses(
        (status = 200, description = "The encounter", body = EncounterView),
        (status = 404, description = "Encounter not found"),
        (status = 500, description = "Internal server error")
    )
)]
/// Get encounter by UUID
///
/// Soft-deleted encounters are reported as not found unless `show_deleted`
/// is set.
#[axum::debug_handler]
async fn get_encounter_by_uuid(
    State(state): State<AppState>,
    AxumPath(encounter_id): AxumPath<String>,
    Query(params): Query<ShowDeletedParams>,
) -> Result<Json<EncounterView>, (StatusCode, String)> {
    state
        .service
        .get_encounter(&encounter_id, params.show_deleted)
        .map(Json)
        .map_err(error_response)
}

#[utoipa::path(
    get,
    path = "/encounter/{encounter_id}/children",
    responses(
        (status = 200, description = "UUIDs of all descendant encounters", body = [String]),
        (status = 500, description = "Internal server error")
    )
)]
/// Get the UUIDs of an encounter's descendants
#[axum::debug_handler]
async fn get_child_encounters(
    State(state): State<AppState>,
    AxumPath(encounter_id): AxumPath<String>,
    Query(params): Query<ShowDeletedParams>,
) -> Result<Json<Vec<String>>, (StatusCode, String)> {
    state
        .service
        .get_child_encounters(&encounter_id, params.show_deleted)
        .map(Json)
        .map_err(error_response)
}

#[utoipa::path(
    patch,
    path = "/encounter/{encounter_id}",
    request_body = EncounterPatch,
    responses(
        (status = 200, description = "The updated encounter", body = EncounterView),
        (status = 403, description = "Actor may not change EWS fields"),
        (status = 404, description = "Encounter not found"),
        (status = 422, description = "Referenced parent encounter does not exist"),
        (status = 500, description = "Internal server error")
    )
)]
/// Update encounter by UUID
#[axum::debug_handler]
async fn update_encounter(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    AxumPath(encounter_id): AxumPath<String>,
    Json(patch): Json<EncounterPatch>,
) -> Result<Json<EncounterView>, (StatusCode, String)> {
    state
        .service
        .update_encounter(&actor, &encounter_id, &patch)
        .map(Json)
        .map_err(error_response)
}

#[utoipa::path(
    delete,
    path = "/encounter/{encounter_id}",
    request_body = RemoveFields,
    responses(
        (status = 200, description = "The encounter after removal", body = EncounterView),
        (status = 404, description = "Encounter not found"),
        (status = 500, description = "Internal server error")
    )
)]
/// Remove fields from an encounter
///
/// Clears the named fields, currently only the parent reference; the value in
/// the body must match the stored one for the removal to apply.
#[axum::debug_handler]
async fn remove_from_encounter(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    AxumPath(encounter_id): AxumPath<String>,
    Json(fields): Json<RemoveFields>,
) -> Result<Json<EncounterView>, (StatusCode, String)> {
    state
        .service
        .remove_from_encounter(&actor, &encounter_id, &fields)
        .map(Json)
        .map_err(error_response)
}

#[utoipa::path(
    patch,
    path = "/score_system_history/{score_system_history_id}",
    request_body = ScoreSystemHistoryPatch,
    responses(
        (status = 200, description = "The updated history entry", body = ScoreSystemHistoryView),
        (status = 404, description = "Score system history not found"),
        (status = 500, description = "Internal server error")
    )
)]
/// Update score system history by UUID
///
/// The score system history records which score systems were used for an
/// encounter over time; this corrects when a change took effect.
#[axum::debug_handler]
async fn update_score_system_history(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    AxumPath(score_system_history_id): AxumPath<String>,
    Json(patch): Json<ScoreSystemHistoryPatch>,
) -> Result<Json<ScoreSystemHistoryView>, (StatusCode, String)> {
    state
        .service
        .update_score_system_history(&actor, &score_system_history_id, &patch)
        .map(Json)
        .map_err(error_response)
}

#[utoipa::path(
    get,
    path = "/encounters",
    responses(
        (status = 200, description = "Encounters modified after the given time", body = [EncounterView]),
        (status = 400, description = "Missing or malformed modified_since"),
        (status = 500, description = "Internal server error")
    )
)]
/// Get encounters modified after a given date
#[axum::debug_handler]
async fn get_encounters(
    State(state): State<AppState>,
    Query(params): Query<FeedParams>,
) -> Result<Json<Vec<EncounterView>>, (StatusCode, String)> {
    let options = ViewOptions {
        compact: params.compact,
        expanded: params.expanded,
    };
    state
        .service
        .get_encounters(
            &params.modified_since,
            options,
            params.show_deleted,
            params.show_children,
        )
        .map(Json)
        .map_err(error_response)
}

#[utoipa::path(
    get,
    path = "/encounter/latest",
    responses(
        (status = 200, description = "The patient's most recent encounter", body = EncounterView),
        (status = 404, description = "No encounters for the patient"),
        (status = 500, description = "Internal server error")
    )
)]
/// Get a patient's latest encounter
///
/// Open encounters are preferred over closed ones regardless of admission
/// date; `open_as_of` narrows the lookup to encounters still open at that
/// point in time.
#[axum::debug_handler]
async fn get_latest_encounter_by_patient_id(
    State(state): State<AppState>,
    Query(params): Query<LatestParams>,
) -> Result<Json<EncounterView>, (StatusCode, String)> {
    let options = ViewOptions {
        compact: params.compact,
        expanded: params.expanded,
    };
    let latest = most_recent_encounter(
        &state.service,
        &params.patient_id,
        non_empty(params.open_as_of.as_deref()),
        options,
    )
    .map_err(error_response)?;
    match latest {
        Some(encounter) => Ok(Json(encounter)),
        None => Err((
            StatusCode::NOT_FOUND,
            format!(
                "No open encounters found for patient with uuid '{}'",
                params.patient_id
            ),
        )),
    }
}

#[utoipa::path(
    post,
    path = "/encounter/latest",
    request_body = [String],
    responses(
        (status = 200, description = "Map of patient UUID to latest encounter"),
        (status = 500, description = "Internal server error")
    )
)]
/// Get the latest encounter for each of a list of patients
///
/// Patients without a matching encounter are omitted from the response map.
#[axum::debug_handler]
async fn retrieve_latest_encounters_by_patient_ids(
    State(state): State<AppState>,
    Query(params): Query<BatchParams>,
    Json(patient_ids): Json<Vec<String>>,
) -> Result<Json<BTreeMap<String, EncounterView>>, (StatusCode, String)> {
    let options = ViewOptions {
        compact: params.compact,
        expanded: false,
    };
    let open_as_of = non_empty(params.open_as_of.as_deref());
    let mut latest = BTreeMap::new();
    for patient_id in &patient_ids {
        let found = most_recent_encounter(&state.service, patient_id, open_as_of, options)
            .map_err(error_response)?;
        if let Some(encounter) = found {
            latest.insert(patient_id.clone(), encounter);
        }
    }
    Ok(Json(latest))
}

#[utoipa::path(
    post,
    path = "/encounter/locations",
    request_body = [String],
    responses(
        (status = 200, description = "Open encounters at the given locations", body = [EncounterView]),
        (status = 500, description = "Internal server error")
    )
)]
/// Get open encounters at a list of locations
///
/// Returns each patient's single latest open encounter at the locations.
#[axum::debug_handler]
async fn retrieve_open_encounters_by_locations(
    State(state): State<AppState>,
    Query(params): Query<BatchParams>,
    Json(location_ids): Json<Vec<String>>,
) -> Result<Json<Vec<EncounterView>>, (StatusCode, String)> {
    state
        .service
        .get_open_encounters_for_locations(
            &location_ids,
            non_empty(params.open_as_of.as_deref()),
            params.compact,
        )
        .map(Json)
        .map_err(error_response)
}

#[utoipa::path(
    post,
    path = "/encounter/patients",
    request_body = [String],
    responses(
        (status = 200, description = "Open encounters for the given patients", body = [EncounterView]),
        (status = 500, description = "Internal server error")
    )
)]
/// Get open encounters for a list of patients
#[axum::debug_handler]
async fn retrieve_encounters_for_patients(
    State(state): State<AppState>,
    Query(params): Query<PatientsParams>,
    Json(patient_ids): Json<Vec<String>>,
) -> Result<Json<Vec<EncounterView>>, (StatusCode, String)> {
    let options = ViewOptions {
        compact: params.compact,
        expanded: params.expanded,
    };
    state
        .service
        .get_open_encounters_for_patients(
            &patient_ids,
            non_empty(params.open_as_of.as_deref()),
            options,
        )
        .map(Json)
        .map_err(error_response)
}

#[utoipa::path(
    post,
    path = "/encounter/locations/patient_count",
    request_body = [String],
    responses(
        (status = 200, description = "Map of location UUID to open patient count"),
        (status = 500, description = "Internal server error")
    )
)]
/// Count patients with open encounters at each of a list of locations
#[axum::debug_handler]
async fn retrieve_patient_count_for_locations(
    State(state): State<AppState>,
    Query(params): Query<CountParams>,
    Json(location_ids): Json<Vec<String>>,
) -> Result<Json<HashMap<String, i64>>, (StatusCode, String)> {
    state
        .service
        .get_patient_count_for_locations(&location_ids, non_empty(params.open_as_of.as_deref()))
        .map(Json)
        .map_err(error_response)
}

#[utoipa::path(
    post,
    path = "/encounter/merge",
    request_body = MergeRequest,
    responses(
        (status = 200, description = "Number of encounters moved", body = MergeOutcome),
        (status = 400, description = "Child and parent record are the same"),
        (status = 500, description = "Internal server error")
    )
)]
/// Move all encounters from one patient record onto another
///
/// Used when duplicate patient records are consolidated. Every moved
/// encounter keeps a merge history entry naming the record it came from.
#[axum::debug_handler]
async fn merge_encounters(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Json(request): Json<MergeRequest>,
) -> Result<Json<MergeOutcome>, (StatusCode, String)> {
    state
        .service
        .merge_encounters(&actor, &request)
        .map(Json)
        .map_err(error_response)
}

#[utoipa::path(
    post,
    path = "/drop_data",
    responses(
        (status = 200, description = "All encounter data dropped", body = ResetOutcome),
        (status = 403, description = "Dropping data is not allowed in this environment"),
        (status = 500, description = "Internal server error")
    )
)]
/// Drop all encounter data
///
/// Development helper that wipes every encounter and history row. Refused
/// unless the configuration allows dropping data.
#[axum::debug_handler]
async fn drop_data(
    State(state): State<AppState>,
    RequestActor(_actor): RequestActor,
) -> Result<Json<ResetOutcome>, (StatusCode, String)> {
    if !state.config.allow_drop_data() {
        return Err((
            StatusCode::FORBIDDEN,
            "Cannot drop data in this environment".to_owned(),
        ));
    }
    state
        .service
        .reset_database()
        .map(Json)
        .map_err(error_response)
}

// Helper functions

/// Maps a core error onto an HTTP status and body. Caller-fault variants keep
/// their message; anything unexpected is logged and reported opaquely.
fn error_response(err: EncounterError) -> (StatusCode, String) {
    let status = match &err {
        EncounterError::NotFound(_) => StatusCode::NOT_FOUND,
        EncounterError::DuplicateResource(_) => StatusCode::CONFLICT,
        EncounterError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        EncounterError::UnprocessableInput(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EncounterError::InvalidRequest(_) | EncounterError::InvalidTimestamp(_) => {
            StatusCode::BAD_REQUEST
        }
        _ => {
            tracing::error!("Request failed: {:?}", err);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error".to_owned(),
            );
        }
    };
    (status, err.to_string())
}

/// Treats an empty query value as absent.
fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.is_empty())
}

fn most_recent_encounter(
    service: &EncounterService,
    patient_id: &str,
    open_as_of: Option<&str>,
    options: ViewOptions,
) -> Result<Option<EncounterView>, EncounterError> {
    let encounters = match open_as_of {
        Some(open_as_of) => {
            service.get_open_encounters_for_patient(patient_id, Some(open_as_of), options)?
        }
        None => {
            service.get_encounters_by_patient_or_epr_id(Some(patient_id), None, options, false, false)?
        }
    };
    Ok(encounters.into_iter().next())
}
