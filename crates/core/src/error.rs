use encounter_types::TimestampError;

#[derive(Debug, thiserror::Error)]
pub enum EncounterError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    DuplicateResource(String),
    #[error("{0}")]
    PermissionDenied(String),
    #[error("{0}")]
    UnprocessableInput(String),
    #[error("{0}")]
    InvalidRequest(String),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(#[from] TimestampError),
    #[error("event payload is missing required key '{0}'")]
    MalformedEventPayload(&'static str),
    #[error("failed to create storage directory: {0}")]
    StorageDirCreation(std::io::Error),
    #[error("failed to open encounter database: {0}")]
    OpenDatabase(rusqlite::Error),
    #[error("failed to initialise encounter database schema: {0}")]
    Schema(rusqlite::Error),
    #[error("database error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("failed to serialize encounter data: {0}")]
    Serialization(serde_json::Error),
}

pub type EncounterResult<T> = std::result::Result<T, EncounterError>;
