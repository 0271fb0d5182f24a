use std::time::Duration;

use chrono::{DateTime, Utc};
use ::http::StatusCode;
use thiserror::Error;

use crate::transport::{Phase, PhaseTimings, TransportError};

pub mod http;

/// Outcome of one successful probe.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub target: String,
    pub status: StatusCode,
    pub timings: PhaseTimings,
}

impl ProbeReport {
    pub fn total(&self) -> Duration {
        self.timings.total()
    }

    pub fn connection(&self) -> Duration {
        self.timings.connection()
    }

    pub fn processing(&self) -> Duration {
        self.timings.processing()
    }
}

/// A failed probe, with the target, the time it failed and the phase the
/// transport was in.
#[derive(Debug, Error)]
#[error("probe of {target} failed during {phase} at {}: {source}", .at.to_rfc3339())]
pub struct ProbeError {
    pub target: String,
    pub phase: Phase,
    pub at: DateTime<Utc>,
    #[source]
    pub source: TransportError,
}

impl ProbeError {
    pub fn new(target: impl Into<String>, source: TransportError) -> Self {
        Self {
            target: target.into(),
            phase: source.phase(),
            at: Utc::now(),
            source,
        }
    }
}
