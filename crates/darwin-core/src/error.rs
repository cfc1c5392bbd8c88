use thiserror::Error;

/// Domain error surface. Subsystems map their failures onto one of these
/// variants; call sites that only need to propagate use `anyhow::Result`
/// instead (see `RootSignalError` in the teacher for the same split).
#[derive(Error, Debug)]
pub enum DarwinError {
    #[error("store error: {0}")]
    Store(String),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("llm error: {0}")]
    Llm(String),

    /// The LLM call completed but its output didn't conform to the
    /// requested structured schema — distinct from a transport failure so
    /// callers can give it a different retry budget (spec §4.4 "Failure").
    #[error("llm schema error: {0}")]
    LlmSchema(String),

    #[error("forge error: {0}")]
    Forge(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, DarwinError>;
