use std::fmt;

/// The happens-before graph contained a cycle.
///
/// Detected during enumeration, when the candidate frontier empties while
/// unordered tasks remain.
#[derive(Copy, Clone, Debug, Default)]
pub struct CycleError;

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "happens-before graph had a cycle")
    }
}

impl std::error::Error for CycleError {}

/// Enumeration produced more schedules than the configured bound allows.
#[derive(Copy, Clone, Debug)]
pub struct LimitExceeded {
    pub limit: usize,
}

impl fmt::Display for LimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "there are more than {} schedules", self.limit)
    }
}

impl std::error::Error for LimitExceeded {}
