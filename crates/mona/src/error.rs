use std::fmt;

use bytes::Bytes;
use mona_hash::Hash;
use thiserror::Error;

/// Engine-level errors.
///
/// These are infrastructure failures: they are never routed through a user
/// exception handler and always abort evaluation (§ error taxonomy of the
/// session docs). Failures raised by task bodies use [`Failure`] instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot hash: {0}")]
    Hashing(String),

    #[error("invalid composite: {0}")]
    Composite(String),

    #[error("future not done: {0}")]
    NotDone(String),

    #[error("no default: {0}")]
    NoDefault(String),

    #[error("task {label}: {msg}")]
    TaskState { label: String, msg: &'static str },

    #[error("task not registered in the active session: {0}")]
    ForeignTask(String),

    #[error("no active session")]
    NoActiveSession,

    #[error("session is not active")]
    SessionNotActive,

    #[error("unknown rule: {0}")]
    UnknownRule(String),

    #[error("function hash changed for rule {rule}: cached {cached}, current {current}")]
    FunctionChanged {
        rule: String,
        cached: Hash,
        current: Hash,
    },

    #[error("missing content in file store: {0}")]
    MissingFile(Hash),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("dependency cycle among tasks: {0:?}")]
    Cycle(Vec<String>),

    #[error("evaluation left the target unresolved: {0}")]
    Unresolved(Unresolved),

    #[error("task {label} failed")]
    TaskFailed {
        label: String,
        #[source]
        failure: Failure,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("storage backend: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// A failure raised by a task body.
///
/// Only these are eligible for the exception handler passed to
/// `Session::eval_with`; everything else aborts the traversal.
#[derive(Debug, Error)]
pub enum Failure {
    #[error("process {argv:?} exited with code {code}")]
    Process {
        argv: Vec<String>,
        code: i32,
        stdout: Bytes,
        stderr: Bytes,
    },

    /// A nonzero exit re-raised raw, without captured output: a dir-task
    /// failing under a tmpdir manager leaves STDOUT/STDERR in the retained
    /// scratch directory instead.
    #[error("process {argv:?} exited with code {code}")]
    Exit { argv: Vec<String>, code: i32 },

    #[error(transparent)]
    User(#[from] anyhow::Error),
}

impl Failure {
    pub fn msg(msg: impl fmt::Display) -> Self {
        Failure::User(anyhow::anyhow!("{msg}"))
    }

    pub fn is_process(&self) -> bool {
        matches!(self, Failure::Process { .. } | Failure::Exit { .. })
    }
}

/// Outcome type of a task body: an engine error or a task failure.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Fatal(#[from] Error),
    #[error(transparent)]
    Failure(#[from] Failure),
}

impl RunError {
    pub(crate) fn into_error(self, label: &str) -> Error {
        match self {
            RunError::Fatal(err) => err,
            RunError::Failure(failure) => Error::TaskFailed {
                label: label.to_string(),
                failure,
            },
        }
    }
}

/// Why an evaluated future could not be resolved to a value.
#[derive(Debug, Default)]
pub struct Unresolved {
    /// Tasks were declined by the task filter or an already-done skip.
    pub skipped: bool,
    /// The execution limit was reached and the traversal shut down early.
    pub limit_reached: bool,
    /// Labels of tasks whose failures were accepted by the exception handler.
    pub handled: Vec<String>,
}

impl fmt::Display for Unresolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut reasons = Vec::new();
        if !self.handled.is_empty() {
            reasons.push(format!("handled failures in {:?}", self.handled));
        }
        if self.limit_reached {
            reasons.push("execution limit reached".to_string());
        }
        if self.skipped {
            reasons.push("tasks were skipped".to_string());
        }
        if reasons.is_empty() {
            reasons.push("unknown reason".to_string());
        }
        f.write_str(&reasons.join(", "))
    }
}
