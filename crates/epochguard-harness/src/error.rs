use epochguard_membrane::GuardError;

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("engine setup failed: {0}")]
    Engine(#[from] GuardError),

    #[error("scenario {scenario} did not behave as expected: {detail}")]
    Unexpected { scenario: &'static str, detail: String },

    #[error("{path}: {errors} invalid log line(s)")]
    InvalidLog { path: String, errors: usize },
}

pub type Result<T> = std::result::Result<T, HarnessError>;
