//! Error types for observability setup, recording and shutdown.

use std::path::PathBuf;

use thiserror::Error;

use crate::orchestrator::LifecycleState;

/// Initialization stage, in construction order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Logger,
    Tracer,
    Metrics,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Logger => write!(f, "logger"),
            Self::Tracer => write!(f, "tracer"),
            Self::Metrics => write!(f, "metrics"),
        }
    }
}

/// Errors produced by the observability facades and the orchestrator.
#[derive(Debug, Error)]
pub enum ObservabilityError {
    /// A component failed to construct during initialization.
    #[error("failed to initialize {stage}: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<ObservabilityError>,
    },

    /// A file log output could not be opened.
    #[error("cannot open log output {}: {source}", path.display())]
    LogOutput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An OTLP exporter could not be built (bad endpoint, transport setup).
    #[error("failed to create OTLP {signal} exporter: {reason}")]
    Exporter { signal: &'static str, reason: String },

    /// An instrument could not be created on first use.
    #[error("invalid instrument '{name}': {reason}")]
    InvalidInstrument { name: String, reason: String },

    /// A backend failed to flush or shut down.
    #[error("{component} shutdown failed: {reason}")]
    Shutdown {
        component: &'static str,
        reason: String,
    },

    /// The orchestrator entry point was called in the wrong lifecycle state.
    #[error("orchestrator is {actual}, expected {expected}")]
    InvalidState {
        expected: LifecycleState,
        actual: LifecycleState,
    },

    /// Flushing a log sink failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ObservabilityError {
    /// Wrap this error with the stage that produced it.
    pub fn at(self, stage: Stage) -> Self {
        Self::Stage {
            stage,
            source: Box::new(self),
        }
    }

    /// The initialization stage this error was raised in, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_wrapping_names_the_stage() {
        let err = ObservabilityError::Exporter {
            signal: "trace",
            reason: "invalid uri".into(),
        }
        .at(Stage::Tracer);

        assert_eq!(err.stage(), Some(Stage::Tracer));
        assert_eq!(
            err.to_string(),
            "failed to initialize tracer: failed to create OTLP trace exporter: invalid uri"
        );
    }

    #[test]
    fn leaf_errors_have_no_stage() {
        let err = ObservabilityError::InvalidInstrument {
            name: "".into(),
            reason: "name is empty".into(),
        };
        assert_eq!(err.stage(), None);
    }
}
