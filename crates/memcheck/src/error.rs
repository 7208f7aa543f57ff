use crate::{Lifecycle, ObjectId};
use std::error::Error;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Created,
    Destroyed,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Destroyed => "destroyed",
        })
    }
}

/// A lifecycle event that contradicts what the registry already knows.
///
/// Each variant points at a memory bug in the caller, so the tracking state
/// is left untouched when one is returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityViolation {
    NullIdentity { operation: Operation },
    /// Construction at an address that already holds a live object.
    AlreadyAlive { id: ObjectId },
    /// Destruction of an object that was never created or is already dead.
    NotAlive { id: ObjectId, state: Lifecycle },
}

impl IntegrityViolation {
    pub fn id(&self) -> Option<ObjectId> {
        match self {
            Self::NullIdentity { .. } => None,
            Self::AlreadyAlive { id } | Self::NotAlive { id, .. } => Some(*id),
        }
    }
}

impl fmt::Display for IntegrityViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NullIdentity { operation } => {
                write!(f, "invariant violated: null identity passed to {operation}")
            }
            Self::AlreadyAlive { id } => write!(
                f,
                "invariant violated: {id} created while already alive (double construction)"
            ),
            Self::NotAlive {
                id,
                state: Lifecycle::Dead,
            } => write!(
                f,
                "invariant violated: {id} destroyed after it was already destroyed (double destruction)"
            ),
            Self::NotAlive { id, state } => write!(
                f,
                "invariant violated: {id} destroyed while {state} (destruction of untracked memory)"
            ),
        }
    }
}

impl Error for IntegrityViolation {}
