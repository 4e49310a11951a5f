//! Session plugins.
//!
//! Plugins observe the session lifecycle (enter/exit, run, task creation and
//! completion) and may wrap the executor. The persistent cache, the file
//! manager, the tmpdir manager, and the parallel scheduler are all plugins.

use std::sync::Arc;

use crossbeam_channel::Sender;

use crate::{
    error::{Error, RunError},
    hashing::Obj,
    session::Session,
    task::Task,
    value::Value,
};

pub mod parallel;
pub mod tmpdir;

/// One unit of dispatched work: the task plus a closure that runs its body.
/// Consuming the job delivers a [`Completion`] on the traversal's channel.
pub struct Job {
    pub(crate) task: Arc<Task>,
    pub(crate) work: Box<dyn FnOnce() -> Result<Value, RunError> + Send>,
    pub(crate) done: Sender<Completion>,
}

pub struct Completion {
    pub(crate) task: Arc<Task>,
    pub(crate) outcome: Result<Value, RunError>,
}

impl Job {
    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    /// Cores declared by the task (`storage["ncores"]`), defaulting to one.
    pub fn ncores(&self) -> usize {
        match self.task.storage_get("ncores") {
            Some(Value::Int(n)) if n > 0 => n as usize,
            _ => 1,
        }
    }

    /// Run the body and deliver the completion.
    pub fn run(self) {
        self.run_observed(|_| {});
    }

    /// Like [`Job::run`], letting the caller observe failure before the
    /// completion is delivered (the parallel plugin's draining logic needs
    /// to act first).
    pub fn run_observed(self, observe: impl FnOnce(bool)) {
        let outcome = (self.work)();
        observe(outcome.is_err());
        let _ = self.done.send(Completion {
            task: self.task,
            outcome,
        });
    }
}

/// The executor: invoked by the traversal for every dispatched task. The
/// default executor runs the job inline on the driver thread.
pub type Execute = Arc<dyn Fn(Job) + Send + Sync>;

pub(crate) fn default_execute() -> Execute {
    Arc::new(Job::run)
}

#[allow(unused_variables)]
pub trait SessionPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// The session became active.
    fn post_enter(&self, sess: &Arc<Session>) -> Result<(), Error> {
        Ok(())
    }

    /// The session is about to be left; last chance to flush.
    fn pre_exit(&self, sess: &Arc<Session>) -> Result<(), Error> {
        Ok(())
    }

    /// An evaluation (or single task run) is about to start.
    fn pre_run(&self) -> Result<(), Error> {
        Ok(())
    }

    /// The evaluation finished, successfully or not.
    fn post_run(&self) -> Result<(), Error> {
        Ok(())
    }

    /// A new task was registered (not called for deduplicated creations).
    fn post_create(&self, task: &Arc<Task>) -> Result<(), Error> {
        Ok(())
    }

    /// A task's body returned and its result was recorded.
    fn post_task_run(&self, task: &Arc<Task>) -> Result<(), Error> {
        Ok(())
    }

    /// Non-task hashed objects became part of the session graph.
    fn save_hashed(&self, objs: &[Obj]) -> Result<(), Error> {
        Ok(())
    }

    /// The exception handler accepted a task failure.
    fn ignored_exception(&self) {}

    /// Wrap the executor; composes across plugins.
    fn wrap_execute(&self, execute: Execute) -> Execute {
        execute
    }
}
