use memcheck_trace_capture::CallStack;
use std::fmt;

/// Where an identity is in its `Unknown -> Alive -> Dead -> Alive ...` cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    /// Never recorded.
    Unknown,
    Alive,
    /// Destroyed; both traces are kept until the address is reused.
    Dead,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "unknown",
            Self::Alive => "alive",
            Self::Dead => "dead",
        })
    }
}

/// The most recent creation and destruction traces for one identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LifecycleEntry {
    create_trace: Option<CallStack>,
    destroy_trace: Option<CallStack>,
}

impl LifecycleEntry {
    pub fn state(&self) -> Lifecycle {
        match (&self.create_trace, &self.destroy_trace) {
            (None, None) => Lifecycle::Unknown,
            (Some(_), None) => Lifecycle::Alive,
            (_, Some(_)) => Lifecycle::Dead,
        }
    }

    pub fn create_trace(&self) -> Option<&CallStack> {
        self.create_trace.as_ref()
    }

    pub fn destroy_trace(&self) -> Option<&CallStack> {
        self.destroy_trace.as_ref()
    }

    /// Starts a new lifecycle, dropping both traces of the previous one.
    pub(crate) fn begin(&mut self, trace: CallStack) {
        self.create_trace = Some(trace);
        self.destroy_trace = None;
    }

    pub(crate) fn end(&mut self, trace: CallStack) {
        self.destroy_trace = Some(trace);
    }
}
