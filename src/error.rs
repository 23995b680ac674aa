// SPDX-License-Identifier: GPL-3.0-only

use crate::backend::{BackendError, CrtcId, ModeId, OutputId, Rotation};
use std::fmt;

/// State the reconciler can't repair by retrying.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Invariant {
    #[error("rotation {0:?} has no rotation bit set")]
    ZeroRotation(Rotation),
    #[error("mode {0} is unknown or has no size")]
    MissingMode(ModeId),
    #[error("no free crtc left to drive output {0}")]
    CrtcPoolExhausted(OutputId),
    #[error("output {0} is not known")]
    UnknownOutput(OutputId),
}

/// Independent write groups of a crtc commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteGroup {
    Gamma,
    Transform,
    Geometry,
    Screen,
    Primary,
}

impl fmt::Display for WriteGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WriteGroup::Gamma => "gamma",
            WriteGroup::Transform => "transform",
            WriteGroup::Geometry => "mode/position/rotation",
            WriteGroup::Screen => "screen size",
            WriteGroup::Primary => "primary output",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("invariant violation: {0}")]
    InvariantViolation(#[from] Invariant),
    #[error("failed to write {group} of crtc {crtc}: {source}")]
    Hardware {
        group: WriteGroup,
        crtc: CrtcId,
        #[source]
        source: BackendError,
    },
    #[error("failed to query {what}: {source}")]
    Query {
        what: String,
        #[source]
        source: BackendError,
    },
    #[error("output reconfiguration panicked: {0}")]
    Panicked(String),
}

impl ReconcileError {
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, ReconcileError::InvariantViolation(_))
    }

    /// The write group that was rejected, if any.
    pub fn write_group(&self) -> Option<WriteGroup> {
        match self {
            ReconcileError::Hardware { group, .. } => Some(*group),
            _ => None,
        }
    }

    pub(crate) fn query(what: impl Into<String>) -> impl FnOnce(BackendError) -> ReconcileError {
        let what = what.into();
        move |source| ReconcileError::Query { what, source }
    }

    pub(crate) fn hardware(group: WriteGroup, crtc: CrtcId) -> impl FnOnce(BackendError) -> ReconcileError {
        move |source| ReconcileError::Hardware {
            group,
            crtc,
            source,
        }
    }
}

pub type Result<T, E = ReconcileError> = std::result::Result<T, E>;
