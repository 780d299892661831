// Error taxonomy for the engine. Lower layers return typed errors; the phase
// executor and pod generator aggregate same-layer failures so independent
// problems are each visible in the final result.

use std::fmt;

use thiserror::Error;

use crate::client::ClusterError;

/// Errors produced by the orchestration core.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Invalid or mutually exclusive settings. Fatal to the run, raised
    /// before any workload is created.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Aggregated per-step pod generation failures.
    #[error("pod generation failed: {0}")]
    Generation(ErrorList),

    /// A step workload failed or timed out.
    #[error("{0}")]
    Execution(String),

    /// The caller's cancellation fired. Expected, and distinct from failure.
    #[error("cancelled")]
    Cancelled,

    /// A cluster API request failed.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// A secret-store listing call failed.
    #[error("secret store error: {0}")]
    SecretStore(String),

    /// An upstream parameter was not declared or could not be read.
    #[error("parameter error: {0}")]
    Parameter(String),

    /// A lower-level error with added call-site context.
    #[error("{context}: {source}")]
    Wrapped {
        context: String,
        #[source]
        source: Box<OrchestratorError>,
    },

    /// Several independent same-layer failures.
    #[error("{0}")]
    Aggregate(ErrorList),
}

impl OrchestratorError {
    /// Wrap with call-site context, preserving the source chain.
    pub fn context(self, context: impl Into<String>) -> Self {
        OrchestratorError::Wrapped {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Whether this error (or any aggregated part of it) is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            OrchestratorError::Cancelled => true,
            OrchestratorError::Cluster(ClusterError::Cancelled) => true,
            OrchestratorError::Wrapped { source, .. } => source.is_cancelled(),
            OrchestratorError::Aggregate(list) | OrchestratorError::Generation(list) => {
                list.0.iter().any(|e| e.is_cancelled())
            }
            _ => false,
        }
    }
}

/// An ordered collection of errors rendered as one message.
#[derive(Debug, Default)]
pub struct ErrorList(pub Vec<OrchestratorError>);

impl ErrorList {
    pub fn new() -> Self {
        ErrorList(Vec::new())
    }

    pub fn push(&mut self, err: OrchestratorError) {
        self.0.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Collapse into a result: no errors is `Ok`, a single error is returned
    /// as-is, several become an aggregate.
    pub fn into_result(mut self) -> Result<(), OrchestratorError> {
        match self.0.len() {
            0 => Ok(()),
            1 => Err(self.0.remove(0)),
            _ => Err(OrchestratorError::Aggregate(self)),
        }
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{err}")?;
        }
        write!(f, "]")
    }
}

/// Collapse a list of errors into a single result.
pub fn aggregate(errs: Vec<OrchestratorError>) -> Result<(), OrchestratorError> {
    ErrorList(errs).into_result()
}
