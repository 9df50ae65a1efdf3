use std::fmt;

use thiserror::Error;

use crate::JobPriority;

/// Error produced by a job's work function. Carries a human-readable message
/// only; the pool logs it and keeps the worker alive.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct JobError(pub String);

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        JobError(message.into())
    }
}

impl From<String> for JobError {
    fn from(message: String) -> Self {
        JobError(message)
    }
}

impl From<&str> for JobError {
    fn from(message: &str) -> Self {
        JobError(message.to_string())
    }
}

/// Outcome of one job execution.
pub type JobResult = Result<(), JobError>;

type Work = Box<dyn FnOnce() -> JobResult + Send + 'static>;

/// One unit of work, tagged with the priority class it queues under and a
/// label used in failure logs.
pub struct Job {
    priority: JobPriority,
    label: String,
    work: Work,
}

impl Job {
    pub fn new(
        priority: JobPriority,
        label: impl Into<String>,
        work: impl FnOnce() -> JobResult + Send + 'static,
    ) -> Self {
        Job {
            priority,
            label: label.into(),
            work: Box::new(work),
        }
    }

    /// Convenience constructor for jobs whose work is a transformation of a
    /// byte payload. The payload is owned by the job until it runs.
    pub fn with_payload(
        priority: JobPriority,
        label: impl Into<String>,
        payload: Vec<u8>,
        work: impl FnOnce(Vec<u8>) -> JobResult + Send + 'static,
    ) -> Self {
        Job::new(priority, label, move || work(payload))
    }

    pub fn priority(&self) -> JobPriority {
        self.priority
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn run(self) -> JobResult {
        (self.work)()
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("priority", &self.priority)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}
