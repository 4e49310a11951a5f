//! The future state machine.
//!
//! Every value-yet-to-be-known (task, task component, future-bearing
//! composite) owns a [`FutureCell`]. States only ever increase, except for
//! an explicit reset by tooling:
//!
//! - `Pending`: some parent future is not done yet.
//! - `Ready`: all parents done; eligible for execution.
//! - `Running`: picked by the scheduler (tasks only).
//! - `Error`: the body failed and the failure was handled; terminal.
//! - `HasRun`: the body returned (tasks only).
//! - `Awaiting`: the body returned a future that is not done yet.
//! - `Done`: the value is available.
//!
//! Futures are identities tied to a session; they are deliberately not
//! serializable.

use mona_hash::Hash;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tracing::debug;

use crate::{
    error::Error,
    hashing::Obj,
    task::{Task, TaskComponent, TaskComposite},
    value::Value,
};
use std::sync::{Arc, Weak};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    Pending,
    Ready,
    Running,
    Error,
    HasRun,
    Awaiting,
    Done,
}

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            State::Pending => "PENDING",
            State::Ready => "READY",
            State::Running => "RUNNING",
            State::Error => "ERROR",
            State::HasRun => "HAS_RUN",
            State::Awaiting => "AWAITING",
            State::Done => "DONE",
        }
    }

    pub fn from_name(name: &str) -> Option<State> {
        Some(match name {
            "PENDING" => State::Pending,
            "READY" => State::Ready,
            "RUNNING" => State::Running,
            "ERROR" => State::Error,
            "HAS_RUN" => State::HasRun,
            "AWAITING" => State::Awaiting,
            "DONE" => State::Done,
            _ => return None,
        })
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

pub(crate) type Callback = Box<dyn FnOnce() + Send>;

pub(crate) struct FutureCell {
    inner: Mutex<Inner>,
}

struct Inner {
    state: State,
    parents: Vec<Fut>,
    pending: FxHashSet<Hash>,
    children: Vec<WeakFut>,
    ready_cbs: Vec<Callback>,
    done_cbs: Vec<Callback>,
    registered: bool,
}

impl FutureCell {
    pub(crate) fn new(parents: Vec<Fut>) -> FutureCell {
        // The parent set is identity-keyed: a future passed twice is one
        // parent, so it is notified of (and counted for) readiness once.
        let mut seen = FxHashSet::default();
        let parents: Vec<Fut> = parents
            .into_iter()
            .filter(|fut| seen.insert(fut.hashid().clone()))
            .collect();
        let pending: FxHashSet<Hash> = parents
            .iter()
            .filter(|fut| !fut.done())
            .map(|fut| fut.hashid().clone())
            .collect();
        let state = if pending.is_empty() {
            State::Ready
        } else {
            State::Pending
        };
        FutureCell {
            inner: Mutex::new(Inner {
                state,
                parents,
                pending,
                children: Vec::new(),
                ready_cbs: Vec::new(),
                done_cbs: Vec::new(),
                registered: false,
            }),
        }
    }

    pub(crate) fn state(&self) -> State {
        self.inner.lock().state
    }

    pub(crate) fn done(&self) -> bool {
        self.state() == State::Done
    }

    /// Task-only transitions; ordering is an internal invariant.
    pub(crate) fn transition(&self, from: State, to: State) {
        let mut inner = self.inner.lock();
        assert!(
            inner.state == from,
            "illegal transition to {to} from {} (expected {from})",
            inner.state
        );
        inner.state = to;
    }
}

/// A handle to any future-bearing object.
#[derive(Clone)]
pub enum Fut {
    Task(Arc<Task>),
    Component(Arc<TaskComponent>),
    Composite(Arc<TaskComposite>),
}

/// Weak counterpart of [`Fut`], used for parent→child backlinks.
pub(crate) enum WeakFut {
    Task(Weak<Task>),
    Component(Weak<TaskComponent>),
    Composite(Weak<TaskComposite>),
}

impl WeakFut {
    pub(crate) fn upgrade(&self) -> Option<Fut> {
        Some(match self {
            WeakFut::Task(w) => Fut::Task(w.upgrade()?),
            WeakFut::Component(w) => Fut::Component(w.upgrade()?),
            WeakFut::Composite(w) => Fut::Composite(w.upgrade()?),
        })
    }
}

impl Fut {
    pub(crate) fn cell(&self) -> &FutureCell {
        match self {
            Fut::Task(t) => t.cell(),
            Fut::Component(c) => c.cell(),
            Fut::Composite(c) => c.cell(),
        }
    }

    pub fn hashid(&self) -> &Hash {
        match self {
            Fut::Task(t) => t.hashid(),
            Fut::Component(c) => c.hashid(),
            Fut::Composite(c) => c.hashid(),
        }
    }

    pub fn label(&self) -> String {
        self.as_obj().label()
    }

    pub fn as_obj(&self) -> Obj {
        match self {
            Fut::Task(t) => Obj::Task(t.clone()),
            Fut::Component(c) => Obj::Component(c.clone()),
            Fut::Composite(c) => Obj::TaskComposite(c.clone()),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakFut {
        match self {
            Fut::Task(t) => WeakFut::Task(Arc::downgrade(t)),
            Fut::Component(c) => WeakFut::Component(Arc::downgrade(c)),
            Fut::Composite(c) => WeakFut::Composite(Arc::downgrade(c)),
        }
    }

    pub fn state(&self) -> State {
        self.cell().state()
    }

    pub fn done(&self) -> bool {
        self.cell().done()
    }

    /// Wire this future into its parents' child sets; idempotent. Parents
    /// register transitively so a whole argument graph comes alive at once.
    /// A parent that finished between construction and registration counts
    /// as done immediately instead of being wired.
    pub fn register(&self) {
        let parents = {
            let mut inner = self.cell().inner.lock();
            if inner.registered {
                return;
            }
            inner.registered = true;
            inner.parents.clone()
        };
        debug!("registered: {}", self.label());
        for parent in parents {
            parent.register();
            if !parent.add_child(self.downgrade()) {
                self.parent_done(parent.hashid());
            }
        }
    }

    /// Returns false if the future is already done, in which case no
    /// notification will ever fire for it.
    fn add_child(&self, child: WeakFut) -> bool {
        let mut inner = self.cell().inner.lock();
        if inner.state == State::Done {
            return false;
        }
        inner.children.push(child);
        true
    }

    fn parent_done(&self, parent: &Hash) {
        let ready_cbs = {
            let mut inner = self.cell().inner.lock();
            if !inner.pending.remove(parent) {
                return;
            }
            assert!(inner.state == State::Pending, "parent done but not pending");
            if !inner.pending.is_empty() {
                return;
            }
            inner.state = State::Ready;
            std::mem::take(&mut inner.ready_cbs)
        };
        debug!("{}: ready", self.label());
        for cb in ready_cbs {
            cb();
        }
    }

    /// Mark done, notify children (each exactly once), then fire done
    /// callbacks. Parent and child links are cleared here so the session's
    /// task registry is the only thing keeping the graph alive.
    pub(crate) fn set_done(&self) {
        let (children, done_cbs) = {
            let mut inner = self.cell().inner.lock();
            assert!(
                inner.state >= State::Ready && inner.state < State::Done,
                "illegal transition to DONE from {}",
                inner.state
            );
            inner.state = State::Done;
            inner.parents.clear();
            inner.ready_cbs.clear();
            (
                std::mem::take(&mut inner.children),
                std::mem::take(&mut inner.done_cbs),
            )
        };
        debug!("{}: done", self.label());
        for child in children {
            if let Some(child) = child.upgrade() {
                child.parent_done(self.hashid());
            }
        }
        for cb in done_cbs {
            cb();
        }
    }

    /// Run `cb` now if the future is already past `Ready`, otherwise enqueue
    /// it. Callbacks fire in registration order.
    pub(crate) fn add_ready_callback(&self, cb: Callback) {
        {
            let mut inner = self.cell().inner.lock();
            if inner.state < State::Ready {
                inner.ready_cbs.push(cb);
                return;
            }
        }
        cb();
    }

    pub(crate) fn add_done_callback(&self, cb: Callback) {
        let mut inner = self.cell().inner.lock();
        assert!(inner.state != State::Done, "done callback on a done future");
        inner.done_cbs.push(cb);
    }

    pub fn value(&self) -> Result<Value, Error> {
        self.as_obj().value()
    }

    pub fn default_result(&self) -> Result<Value, Error> {
        match self {
            Fut::Task(t) => t.default_result(),
            Fut::Component(c) => c.default_result(),
            Fut::Composite(c) => c.default_result(),
        }
    }

    pub fn value_or_default(&self) -> Result<Value, Error> {
        if self.done() {
            self.value()
        } else {
            self.default_result()
        }
    }
}
