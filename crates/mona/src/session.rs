//! The session: task registry, graph, and DAG traversal.
//!
//! A session owns every task created while it is active, keyed by hashid.
//! Creating a task that hashes to an existing one returns the existing
//! instance — that is the memoization seam. Entering a session pushes it on
//! a global stack so rule bodies (possibly on worker threads) can reach the
//! innermost active session; leaving clears all in-memory state.

use std::{cell::RefCell, collections::BTreeMap, sync::Arc};

use crossbeam_channel::{unbounded, Receiver, Sender};
use indexmap::IndexMap;
use mona_hash::Hash;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, warn};

use crate::{
    error::{Error, Failure, RunError, Unresolved},
    files::FileStore,
    futures::State,
    graph::{Action, Priority, TaskDeque, DEFAULT_PRIORITY},
    hashing::{ensure_hashed, maybe_hashed, Obj},
    plugins::{default_execute, tmpdir::TmpdirManager, Completion, Job, SessionPlugin},
    rule::Rule,
    task::{Task, TaskOpts},
    value::Value,
};

thread_local! {
    // The innermost entered session, per thread. Worker threads inherit the
    // driver's session for the duration of each job (see `make_job`).
    static ACTIVE: RefCell<Vec<Arc<Session>>> = RefCell::new(Vec::new());
    static RUNNING: RefCell<Vec<Arc<Task>>> = RefCell::new(Vec::new());
}

/// Scoped installation of a session as the active one on this thread.
struct ActiveGuard;

impl ActiveGuard {
    fn push(sess: Arc<Session>) -> ActiveGuard {
        ACTIVE.with(|stack| stack.borrow_mut().push(sess));
        ActiveGuard
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ACTIVE.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

struct RunningGuard;

impl RunningGuard {
    fn push(task: Arc<Task>) -> RunningGuard {
        RUNNING.with(|stack| stack.borrow_mut().push(task));
        RunningGuard
    }

    fn current() -> Option<Arc<Task>> {
        RUNNING.with(|stack| stack.borrow().last().cloned())
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        RUNNING.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

struct Inner {
    tasks: IndexMap<Hash, Arc<Task>>,
    deps: FxHashMap<Hash, FxHashSet<Hash>>,
    side_effects: FxHashMap<Hash, Vec<Hash>>,
    backflow: FxHashMap<Hash, FxHashSet<Hash>>,
    storage: BTreeMap<String, Value>,
    skipped: bool,
}

pub struct Session {
    inner: Mutex<Inner>,
    plugins: Vec<Arc<dyn SessionPlugin>>,
    file_store: Mutex<Option<Arc<dyn FileStore>>>,
    tmpdir_manager: Mutex<Option<Arc<TmpdirManager>>>,
    warn_not_run: bool,
}

/// RAII handle for an entered session; leaving restores the previous active
/// session. Prefer [`SessionGuard::exit`] so flush errors surface.
pub struct SessionGuard {
    sess: Arc<Session>,
    exited: bool,
}

impl SessionGuard {
    pub fn session(&self) -> &Arc<Session> {
        &self.sess
    }

    pub fn exit(mut self) -> Result<(), Error> {
        self.exited = true;
        self.sess.do_exit()
    }
}

impl std::ops::Deref for SessionGuard {
    type Target = Arc<Session>;

    fn deref(&self) -> &Arc<Session> {
        &self.sess
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.exited {
            if let Err(err) = self.sess.do_exit() {
                warn!("error while leaving session: {err}");
            }
        }
    }
}

/// Predicate selecting which tasks an evaluation may execute.
pub type TaskFilter = Box<dyn Fn(&Arc<Task>) -> bool + Send + Sync>;

/// Decides whether a task failure is tolerated; handled tasks move to
/// `Error` and the traversal continues.
pub type FailureHandler = Box<dyn Fn(&Arc<Task>, &Failure) -> bool + Send + Sync>;

/// Options for [`Session::eval_with`].
#[derive(Default)]
pub struct EvalOptions {
    /// Traverse depth-first instead of breadth-first.
    pub depth: bool,
    /// Step priority; defaults to results, execute, traverse.
    pub priority: Option<Priority>,
    /// Stop dispatching after this many executions.
    pub limit: Option<usize>,
    /// Only tasks accepted by the filter are executed.
    pub filter: Option<TaskFilter>,
    /// Routes task failures; unhandled failures abort the evaluation.
    pub handler: Option<FailureHandler>,
}

impl Session {
    pub fn new(plugins: Vec<Arc<dyn SessionPlugin>>) -> Arc<Session> {
        Session::with_warn(plugins, true)
    }

    /// Like [`Session::new`]; `warn_not_run` controls the end-of-session
    /// warning about tasks that were created but never ran.
    pub fn with_warn(plugins: Vec<Arc<dyn SessionPlugin>>, warn_not_run: bool) -> Arc<Session> {
        Arc::new(Session {
            inner: Mutex::new(Inner {
                tasks: IndexMap::new(),
                deps: FxHashMap::default(),
                side_effects: FxHashMap::default(),
                backflow: FxHashMap::default(),
                storage: BTreeMap::new(),
                skipped: false,
            }),
            plugins,
            file_store: Mutex::new(None),
            tmpdir_manager: Mutex::new(None),
            warn_not_run,
        })
    }

    /// The innermost session entered on this thread.
    pub fn active() -> Result<Arc<Session>, Error> {
        Session::active_opt().ok_or(Error::NoActiveSession)
    }

    pub fn active_opt() -> Option<Arc<Session>> {
        ACTIVE.with(|stack| stack.borrow().last().cloned())
    }

    /// Make this session the active one on the current thread.
    pub fn enter(self: &Arc<Session>) -> Result<SessionGuard, Error> {
        ACTIVE.with(|stack| stack.borrow_mut().push(self.clone()));
        for plugin in &self.plugins {
            if let Err(err) = plugin.post_enter(self) {
                ACTIVE.with(|stack| {
                    stack.borrow_mut().pop();
                });
                return Err(err);
            }
        }
        Ok(SessionGuard {
            sess: self.clone(),
            exited: false,
        })
    }

    fn do_exit(self: &Arc<Session>) -> Result<(), Error> {
        self.check_active()?;
        let mut result = Ok(());
        for plugin in &self.plugins {
            if let Err(err) = plugin.pre_exit(self) {
                if result.is_ok() {
                    result = Err(err);
                } else {
                    warn!("additional error while leaving session: {err}");
                }
            }
        }
        ACTIVE.with(|stack| {
            stack.borrow_mut().pop();
        });
        let mut inner = self.inner.lock();
        if self.warn_not_run && !inner.skipped {
            let not_run: Vec<String> = inner
                .tasks
                .values()
                .filter(|t| t.state() < State::Running)
                .map(|t| t.label())
                .collect();
            if !not_run.is_empty() {
                warn!("tasks have never run: {not_run:?}");
            }
        }
        inner.tasks.clear();
        inner.deps.clear();
        inner.side_effects.clear();
        inner.backflow.clear();
        inner.storage.clear();
        inner.skipped = false;
        *self.file_store.lock() = None;
        *self.tmpdir_manager.lock() = None;
        result
    }

    pub fn check_active(self: &Arc<Session>) -> Result<(), Error> {
        ACTIVE.with(|stack| match stack.borrow().last() {
            Some(top) if Arc::ptr_eq(top, self) => Ok(()),
            _ => Err(Error::SessionNotActive),
        })
    }

    /// The task currently executing on this thread, if any.
    pub fn running_task() -> Option<Arc<Task>> {
        RunningGuard::current()
    }

    // ----- storage and collaborator slots -----

    pub fn storage_set(&self, key: impl Into<String>, value: Value) {
        self.inner.lock().storage.insert(key.into(), value);
    }

    pub fn storage_get(&self, key: &str) -> Option<Value> {
        self.inner.lock().storage.get(key).cloned()
    }

    pub fn set_file_store(&self, store: Arc<dyn FileStore>) {
        *self.file_store.lock() = Some(store);
    }

    pub fn file_store(&self) -> Option<Arc<dyn FileStore>> {
        self.file_store.lock().clone()
    }

    pub fn set_tmpdir_manager(&self, manager: Arc<TmpdirManager>) {
        *self.tmpdir_manager.lock() = Some(manager);
    }

    pub fn tmpdir_manager(&self) -> Option<Arc<TmpdirManager>> {
        self.tmpdir_manager.lock().clone()
    }

    // ----- registry and graph -----

    pub fn get_task(&self, hashid: &Hash) -> Option<Arc<Task>> {
        self.inner.lock().tasks.get(hashid).cloned()
    }

    pub fn all_tasks(&self) -> Vec<Arc<Task>> {
        self.inner.lock().tasks.values().cloned().collect()
    }

    pub fn task_count(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    /// Tasks created during the execution of `task`, in creation order.
    pub fn side_effects_of(&self, task: &Task) -> Vec<Arc<Task>> {
        let inner = self.inner.lock();
        inner
            .side_effects
            .get(task.hashid())
            .map(|hashes| {
                hashes
                    .iter()
                    .filter_map(|h| inner.tasks.get(h).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn add_side_effect_of(&self, caller: &Task, callee: &Task) {
        self.inner
            .lock()
            .side_effects
            .entry(caller.hashid().clone())
            .or_default()
            .push(callee.hashid().clone());
    }

    /// Create a new task, deduplicating by hashid. A task created while
    /// another task is running is recorded as that task's side effect.
    pub fn create_task(
        self: &Arc<Session>,
        rule: &'static Rule,
        args: Vec<Value>,
        opts: TaskOpts,
    ) -> Result<Arc<Task>, Error> {
        self.check_active()?;
        let args = args
            .into_iter()
            .map(ensure_hashed)
            .collect::<Result<Vec<_>, _>>()?;
        let task = Task::new(rule, args, opts)?;
        if let Some(caller) = RunningGuard::current() {
            self.add_side_effect_of(&caller, &task);
        }
        let (task, registered) = self.register_task(task)?;
        if registered {
            for plugin in &self.plugins {
                plugin.post_create(&task)?;
            }
        }
        Ok(task)
    }

    /// Add a task to the registry; returns the registered instance and
    /// whether it was new. New tasks have their dependency edges computed
    /// from the tasks reachable through their arguments.
    pub fn register_task(self: &Arc<Session>, task: Arc<Task>) -> Result<(Arc<Task>, bool), Error> {
        {
            let mut inner = self.inner.lock();
            if let Some(existing) = inner.tasks.get(task.hashid()) {
                return Ok((existing.clone(), false));
            }
            inner.tasks.insert(task.hashid().clone(), task.clone());
        }
        task.as_fut().register();
        let arg_tasks = self.process_objects(task.args())?;
        self.inner.lock().deps.insert(
            task.hashid().clone(),
            arg_tasks.iter().map(|t| t.hashid().clone()).collect(),
        );
        Ok((task, true))
    }

    /// Walk an object graph down to tasks; embedded tasks must already be
    /// registered. Non-task objects are offered to the plugins for saving.
    pub(crate) fn process_objects(self: &Arc<Session>, objs: &[Obj]) -> Result<Vec<Arc<Task>>, Error> {
        let mut visited = FxHashSet::default();
        let mut queue: Vec<Obj> = objs.to_vec();
        let mut tasks = Vec::new();
        let mut others = Vec::new();
        while let Some(obj) = queue.pop() {
            if !visited.insert(obj.hashid().clone()) {
                continue;
            }
            match &obj {
                Obj::Task(task) => {
                    let registered = self
                        .get_task(task.hashid())
                        .ok_or_else(|| Error::ForeignTask(task.label()))?;
                    tasks.push(registered);
                }
                _ => {
                    queue.extend(obj.components());
                    others.push(obj);
                }
            }
        }
        for plugin in &self.plugins {
            plugin.save_hashed(&others)?;
        }
        Ok(tasks)
    }

    // ----- results -----

    /// Wrap a raw body return into a hashed object when possible and record
    /// it as the task's result. Returns the backflow: tasks reachable
    /// through the result.
    pub fn apply_result(self: &Arc<Session>, task: &Arc<Task>, raw: Value) -> Result<Vec<Arc<Task>>, Error> {
        match maybe_hashed(&raw)? {
            None => {
                task.set_result_raw(raw);
                Ok(Vec::new())
            }
            Some(obj) => self.apply_result_obj(task, obj),
        }
    }

    /// Record an already-hashed result: done futures and plain objects
    /// complete the task, an unfinished future parks it in `Awaiting` until
    /// the future resolves.
    pub fn apply_result_obj(self: &Arc<Session>, task: &Arc<Task>, obj: Obj) -> Result<Vec<Arc<Task>>, Error> {
        match obj.as_fut() {
            Some(fut) if !fut.done() => {
                debug!("{}: has run, pending: {}", task.label(), fut.label());
                task.set_future_result(obj.clone());
                let weak = Arc::downgrade(task);
                fut.add_done_callback(Box::new(move || {
                    if let Some(task) = weak.upgrade() {
                        task.as_fut().set_done();
                    }
                }));
                fut.register();
            }
            _ => task.set_result_obj(obj.clone()),
        }
        let backflow = self.process_objects(std::slice::from_ref(&obj))?;
        self.inner.lock().backflow.insert(
            task.hashid().clone(),
            backflow.iter().map(|t| t.hashid().clone()).collect(),
        );
        Ok(backflow)
    }

    /// Record a raw (unhashable) result restored from the cache.
    pub fn apply_result_raw(self: &Arc<Session>, task: &Arc<Task>, value: Value) {
        task.set_result_raw(value);
    }

    // ----- execution -----

    fn make_job(self: &Arc<Session>, task: &Arc<Task>, done: Sender<Completion>) -> Result<Job, Error> {
        let rule = task.rule().ok_or_else(|| Error::TaskState {
            label: task.label(),
            msg: "cached task cannot run",
        })?;
        task.set_running();
        let values = task.arg_values()?;
        let current = task.clone();
        let sess = self.clone();
        let work = Box::new(move || {
            // Worker threads inherit the driver's session and record the
            // running task for side-effect attribution.
            let _active = ActiveGuard::push(sess);
            let _running = RunningGuard::push(current);
            rule.invoke(values)
        });
        Ok(Job {
            task: task.clone(),
            work,
            done,
        })
    }

    /// Complete a task whose body returned `raw`: transition through
    /// `HasRun`, record the result, and notify plugins. Returns the
    /// backflow tasks for further traversal.
    fn finish_run(self: &Arc<Session>, task: &Arc<Task>, raw: Value) -> Result<Vec<Arc<Task>>, Error> {
        task.set_has_run();
        let side_effects = self.side_effects_of(task);
        if !side_effects.is_empty() {
            debug!(
                "{}: created tasks: {:?}",
                task.label(),
                side_effects.iter().map(|t| t.label()).collect::<Vec<_>>()
            );
        }
        let backflow = self.apply_result(task, raw)?;
        for plugin in &self.plugins {
            plugin.post_task_run(task)?;
        }
        Ok(backflow)
    }

    /// Run a single ready task inline, wrapped in the plugins' run hooks.
    pub fn run_task(self: &Arc<Session>, task: &Arc<Task>) -> Result<(), Error> {
        self.check_active()?;
        for plugin in &self.plugins {
            plugin.pre_run()?;
        }
        let result = self.run_task_inline(task);
        for plugin in &self.plugins {
            plugin.post_run()?;
        }
        result
    }

    fn run_task_inline(self: &Arc<Session>, task: &Arc<Task>) -> Result<(), Error> {
        match task.state() {
            State::Ready => {}
            state if state < State::Ready => {
                return Err(Error::TaskState {
                    label: task.label(),
                    msg: "not ready",
                })
            }
            _ => {
                return Err(Error::TaskState {
                    label: task.label(),
                    msg: "was already run",
                })
            }
        }
        let (done_tx, done_rx) = unbounded();
        let job = self.make_job(task, done_tx)?;
        job.run();
        let completion = done_rx.recv().expect("inline job always completes");
        match completion.outcome {
            Ok(raw) => {
                self.finish_run(task, raw)?;
                Ok(())
            }
            Err(err) => Err(err.into_error(&task.label())),
        }
    }

    // ----- evaluation -----

    /// Evaluate an object: run every task it contains, plus any tasks those
    /// generate, until the object's value is available.
    pub fn eval(self: &Arc<Session>, obj: Value) -> Result<Value, Error> {
        self.eval_with(obj, EvalOptions::default())
    }

    pub fn eval_with(self: &Arc<Session>, obj: Value, opts: EvalOptions) -> Result<Value, Error> {
        self.check_active()?;
        for plugin in &self.plugins {
            plugin.pre_run()?;
        }
        let (done_tx, done_rx) = unbounded();
        let result = self.eval_inner(obj, &opts, done_tx, &done_rx);
        for plugin in &self.plugins {
            if let Err(err) = plugin.post_run() {
                warn!("plugin {} post_run: {err}", plugin.name());
            }
        }
        // Anything completed but not consumed was cancelled with the
        // traversal; no partial result is committed.
        while let Ok(completion) = done_rx.try_recv() {
            if completion.task.state() == State::Running {
                completion.task.set_error();
                debug!("cancelled: {}", completion.task.label());
            }
        }
        result
    }

    fn eval_inner(
        self: &Arc<Session>,
        obj: Value,
        opts: &EvalOptions,
        done_tx: Sender<Completion>,
        done_rx: &Receiver<Completion>,
    ) -> Result<Value, Error> {
        let Some(root) = maybe_hashed(&obj)? else {
            return Ok(obj);
        };
        let Some(root_fut) = root.as_fut() else {
            return Ok(obj);
        };
        root_fut.register();

        let priority = opts.priority.unwrap_or(DEFAULT_PRIORITY);
        let execute = self
            .plugins
            .iter()
            .fold(default_execute(), |exe, plugin| plugin.wrap_execute(exe));

        let mut to_visit = TaskDeque::new();
        let to_execute: Arc<Mutex<std::collections::VecDeque<Arc<Task>>>> =
            Arc::new(Mutex::new(std::collections::VecDeque::new()));
        let mut visited: FxHashSet<Hash> = FxHashSet::default();
        let mut executing = 0usize;
        let mut n_executed = 0usize;
        let mut shutdown = false;
        let mut limit_hit = false;
        let mut filtered = false;
        let mut handled: Vec<String> = Vec::new();

        to_visit.extend(self.process_objects(std::slice::from_ref(&root))?);

        loop {
            let action = priority.iter().copied().find(|action| match action {
                Action::Results => !done_rx.is_empty(),
                Action::Execute => !to_execute.lock().is_empty(),
                Action::Traverse => !to_visit.is_empty(),
            });
            let (action, block) = match action {
                Some(action) => (action, false),
                None if executing > 0 => (Action::Results, true),
                None => break,
            };
            debug!(
                "{action:?}: executing={executing} to_execute={} to_visit={} done={n_executed}",
                to_execute.lock().len(),
                to_visit.len(),
            );
            match action {
                Action::Traverse => {
                    let task = to_visit.pop(opts.depth).expect("checked non-empty");
                    visited.insert(task.hashid().clone());
                    if task.done() {
                        self.inner.lock().skipped = true;
                        continue;
                    }
                    if let Some(filter) = &opts.filter {
                        if !filter(&task) {
                            filtered = true;
                            self.inner.lock().skipped = true;
                            continue;
                        }
                    }
                    if task.state() < State::Running {
                        let queue = to_execute.clone();
                        let scheduled = task.clone();
                        task.as_fut().add_ready_callback(Box::new(move || {
                            queue.lock().push_back(scheduled);
                        }));
                    }
                    let edges = self.edges_from(&task);
                    to_visit.extend(
                        edges
                            .into_iter()
                            .filter(|t| !visited.contains(t.hashid())),
                    );
                }
                Action::Execute => {
                    let task = { to_execute.lock().pop_front() }.expect("checked non-empty");
                    if shutdown {
                        self.inner.lock().skipped = true;
                        continue;
                    }
                    n_executed += 1;
                    if opts.limit == Some(n_executed) {
                        info!("maximum number of executed tasks reached");
                        limit_hit = true;
                        shutdown = true;
                    }
                    info!("{}: will run", task.label());
                    let job = self.make_job(&task, done_tx.clone())?;
                    executing += 1;
                    execute(job);
                }
                Action::Results => {
                    let completion = if block {
                        done_rx.recv().expect("senders alive while executing")
                    } else {
                        done_rx.try_recv().expect("checked non-empty")
                    };
                    executing -= 1;
                    let task = completion.task;
                    match completion.outcome {
                        Ok(raw) => {
                            let backflow = self.finish_run(&task, raw)?;
                            to_visit.extend(
                                backflow
                                    .into_iter()
                                    .filter(|t| !visited.contains(t.hashid())),
                            );
                        }
                        Err(RunError::Fatal(err)) => return Err(err),
                        Err(RunError::Failure(failure)) => {
                            let accepted = opts
                                .handler
                                .as_ref()
                                .map(|handler| handler(&task, &failure))
                                .unwrap_or(false);
                            if !accepted {
                                return Err(Error::TaskFailed {
                                    label: task.label(),
                                    failure,
                                });
                            }
                            for plugin in &self.plugins {
                                plugin.ignored_exception();
                            }
                            task.set_error();
                            info!("handled failure from {}: {failure}", task.label());
                            handled.push(task.label());
                        }
                    }
                }
            }
        }
        info!("finished");

        match root.value() {
            Ok(value) => Ok(value),
            Err(Error::NotDone(_)) => {
                if !handled.is_empty() || filtered || limit_hit {
                    Err(Error::Unresolved(Unresolved {
                        skipped: filtered,
                        limit_reached: limit_hit,
                        handled,
                    }))
                } else {
                    let not_done: Vec<String> = self
                        .all_tasks()
                        .iter()
                        .filter(|t| !t.done())
                        .map(|t| t.label())
                        .collect();
                    if !not_done.is_empty() {
                        Err(Error::Cycle(not_done))
                    } else {
                        Err(Error::NotDone(root.label()))
                    }
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Tasks with an edge from `task`: its dependencies plus its backflow.
    fn edges_from(&self, task: &Task) -> Vec<Arc<Task>> {
        let inner = self.inner.lock();
        let mut out = Vec::new();
        if let Some(deps) = inner.deps.get(task.hashid()) {
            out.extend(deps.iter().filter_map(|h| inner.tasks.get(h).cloned()));
        }
        if let Some(backflow) = inner.backflow.get(task.hashid()) {
            out.extend(backflow.iter().filter_map(|h| inner.tasks.get(h).cloned()));
        }
        out
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<Session ntasks={}>", self.inner.lock().tasks.len())
    }
}
