use thiserror::Error;

// the closed error taxonomy from the pipeline design -- every failure a step
// or the executor can raise surfaces through one of these variants, which
// the http layer then maps to a status code (see server::http::AppError)
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("unknown step type: {0}")]
    UnknownStep(String),

    #[error("illegal pipeline shape: {0}")]
    PipelineShapeError(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("format error: {0}")]
    FormatError(String),

    #[error("crypto authentication failed: {0}")]
    CryptoAuthError(String),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),

    #[error("pipeline cancelled")]
    Cancelled,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl PipelineError {
    // whether this error kind is one validate_crypt4gh is allowed to swallow
    // into a `{"valid": false}` document instead of propagating
    pub fn is_validation_failure(&self) -> bool {
        matches!(
            self,
            PipelineError::FormatError(_)
                | PipelineError::CryptoAuthError(_)
                | PipelineError::NetworkError(_)
        )
    }
}

// a Queue carrier's producer task runs on a different tokio task than its
// consumer, so a step failure has to cross an mpsc channel as an owned value
// (`QueueProducer::fail`) and come back out the other side as the same kind
// of error (`QueueCarrier::read`) rather than collapsing to a generic
// Internal. `anyhow::Error` isn't `Clone`, so `Internal` is rebuilt from its
// display string -- this loses the original error's source chain but keeps
// the message and, more importantly, keeps `Internal` from needing to clone
// at all for the variants that matter (NotFound, CryptoAuthError, ...).
impl Clone for PipelineError {
    fn clone(&self) -> Self {
        match self {
            PipelineError::InvalidArguments(s) => PipelineError::InvalidArguments(s.clone()),
            PipelineError::UnknownStep(s) => PipelineError::UnknownStep(s.clone()),
            PipelineError::PipelineShapeError(s) => PipelineError::PipelineShapeError(s.clone()),
            PipelineError::NotFound(s) => PipelineError::NotFound(s.clone()),
            PipelineError::NetworkError(s) => PipelineError::NetworkError(s.clone()),
            PipelineError::FormatError(s) => PipelineError::FormatError(s.clone()),
            PipelineError::CryptoAuthError(s) => PipelineError::CryptoAuthError(s.clone()),
            PipelineError::UnsupportedOperation(s) => PipelineError::UnsupportedOperation(s.clone()),
            PipelineError::ResourceLimit(s) => PipelineError::ResourceLimit(s.clone()),
            PipelineError::Cancelled => PipelineError::Cancelled,
            PipelineError::Internal(e) => PipelineError::Internal(anyhow::anyhow!(e.to_string())),
        }
    }
}
