use serde::Serialize;

/// Outcome of one poll scheduler batch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Events whose handler ran successfully.
    pub ran: usize,
    /// Events whose handler returned an error.
    pub failed: usize,
    /// Due events with no handler bound.
    pub skipped: usize,
}

impl RunReport {
    pub fn due(&self) -> usize {
        self.ran + self.failed + self.skipped
    }
}

/// Outcome of one queue run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueRunReport {
    pub completed: usize,
    pub failed: usize,
    /// Stopped early because the run time limit was reached.
    pub timed_out: bool,
}
