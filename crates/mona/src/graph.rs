//! Queue machinery for the self-extending DAG traversal.

use std::collections::VecDeque;
use std::sync::Arc;

use mona_hash::Hash;
use rustc_hash::FxHashSet;

use crate::task::Task;

/// The three kinds of step the traversal can take on each iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Consume a finished execution and enqueue what it made reachable.
    Results,
    /// Pop a ready task and dispatch it to the executor.
    Execute,
    /// Pop a discovered task, schedule it, and follow its edges.
    Traverse,
}

/// Order in which non-empty queues are consulted.
pub type Priority = [Action; 3];

pub const DEFAULT_PRIORITY: Priority = [Action::Results, Action::Execute, Action::Traverse];

/// A deque that refuses duplicates while they are queued; popped entries may
/// be pushed again (the traversal's `visited` set handles convergence).
pub(crate) struct TaskDeque {
    queue: VecDeque<Arc<Task>>,
    queued: FxHashSet<Hash>,
}

impl TaskDeque {
    pub fn new() -> TaskDeque {
        TaskDeque {
            queue: VecDeque::new(),
            queued: FxHashSet::default(),
        }
    }

    pub fn push(&mut self, task: Arc<Task>) {
        if self.queued.insert(task.hashid().clone()) {
            self.queue.push_back(task);
        }
    }

    pub fn extend(&mut self, tasks: impl IntoIterator<Item = Arc<Task>>) {
        for task in tasks {
            self.push(task);
        }
    }

    /// Pop from the back for depth-first traversal, from the front otherwise.
    pub fn pop(&mut self, depth: bool) -> Option<Arc<Task>> {
        let task = if depth {
            self.queue.pop_back()?
        } else {
            self.queue.pop_front()?
        };
        self.queued.remove(task.hashid());
        Some(task)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
