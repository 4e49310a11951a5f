//! Tasks: hashed futures whose identity is `(function, arguments)`.
//!
//! A task's spec is canonical JSON `[name, function-hash, arg-hashids…]`, so
//! two tasks built from the same rule and value-equal arguments share a
//! hashid no matter how the arguments were constructed. Labels, defaults,
//! and the originating rule name live in separately pickled metadata so the
//! hashid stays stable across cosmetic changes.

use std::{collections::BTreeMap, sync::Arc};

use mona_hash::Hash;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, RunError},
    futures::{Fut, FutureCell, State},
    hashing::{HashedComposite, Obj, Resolver},
    json,
    rule::Rule,
    value::{Key, Value},
};

/// Options for task creation, equivalent to the original keyword arguments.
#[derive(Default)]
pub struct TaskOpts {
    pub label: Option<String>,
    pub default: Option<Value>,
    pub rule_name: Option<String>,
}

enum TaskKind {
    Rule(&'static Rule),
    /// Lightweight sentinel standing in for a fully cached task that is not
    /// being restored in depth; carries the stored spec, no args, no body.
    Cached { spec: String },
}

#[derive(Serialize, Deserialize)]
struct TaskMeta {
    default: Option<Value>,
    label: String,
    rule: Option<String>,
}

enum TaskResult {
    Obj(Obj),
    /// A value that could not be hashed; kept only in memory and pickled by
    /// the persistent cache.
    Raw(Value),
}

pub struct Task {
    kind: TaskKind,
    args: Vec<Obj>,
    cell: FutureCell,
    hashid: Hash,
    meta: Mutex<TaskMeta>,
    result: Mutex<Option<TaskResult>>,
    /// String-keyed side data for plugins (e.g. `ncores`).
    storage: Mutex<BTreeMap<String, Value>>,
}

impl Task {
    pub(crate) fn new(rule: &'static Rule, args: Vec<Obj>, opts: TaskOpts) -> Result<Arc<Task>, Error> {
        let func_hash = rule.func_hash()?;
        let spec = json::task_spec(rule.name(), &func_hash, args.iter().map(|a| a.hashid().clone()));
        let hashid = Hash::of_bytes(spec.as_bytes());
        let parents: Vec<Fut> = args.iter().filter_map(Obj::as_fut).collect();
        let label = opts.label.unwrap_or_else(|| {
            let arg_list = args.iter().map(Obj::label).collect::<Vec<_>>().join(", ");
            let arg_list = if arg_list.len() < 50 { arg_list } else { "...".into() };
            format!("{}({arg_list})", rule.name())
        });
        Ok(Arc::new(Task {
            kind: TaskKind::Rule(rule),
            args,
            cell: FutureCell::new(parents),
            hashid,
            meta: Mutex::new(TaskMeta {
                default: opts.default,
                label,
                rule: opts.rule_name,
            }),
            result: Mutex::new(None),
            storage: Mutex::new(BTreeMap::new()),
        }))
    }

    /// Reconstruct a task from its spec; the rule must be registered and its
    /// function hash unchanged.
    pub(crate) fn from_spec(spec: &[u8], resolve: &mut dyn Resolver) -> Result<Arc<Task>, Error> {
        let (name, func_hash, arg_hashes) = json::parse_task_spec(spec)?;
        let rule = Rule::lookup(&name).ok_or_else(|| Error::UnknownRule(name.clone()))?;
        let current = rule.func_hash()?;
        if current != func_hash {
            return Err(Error::FunctionChanged {
                rule: name,
                cached: func_hash,
                current,
            });
        }
        let args = arg_hashes
            .iter()
            .map(|h| resolve.resolve(h))
            .collect::<Result<Vec<_>, _>>()?;
        Task::new(
            rule,
            args,
            TaskOpts {
                rule_name: Some(name),
                ..TaskOpts::default()
            },
        )
    }

    /// Terminal stand-in for a cached task (partial restore); same hashid,
    /// no args, no body.
    pub fn cached(hashid: Hash, spec: String) -> Arc<Task> {
        Arc::new(Task {
            kind: TaskKind::Cached { spec },
            args: Vec::new(),
            cell: FutureCell::new(Vec::new()),
            meta: Mutex::new(TaskMeta {
                default: None,
                label: format!("cached:{}", hashid.tag()),
                rule: None,
            }),
            hashid,
            result: Mutex::new(None),
            storage: Mutex::new(BTreeMap::new()),
        })
    }

    pub(crate) fn cell(&self) -> &FutureCell {
        &self.cell
    }

    pub fn as_fut(self: &Arc<Self>) -> Fut {
        Fut::Task(self.clone())
    }

    pub fn as_obj(self: &Arc<Self>) -> Obj {
        Obj::Task(self.clone())
    }

    pub fn hashid(&self) -> &Hash {
        &self.hashid
    }

    pub fn spec(&self) -> String {
        match &self.kind {
            TaskKind::Rule(rule) => {
                // Infallible here: the func hash was computed at construction.
                let func_hash = rule.func_hash().expect("func hash computed at construction");
                json::task_spec(rule.name(), &func_hash, self.args.iter().map(|a| a.hashid().clone()))
            }
            TaskKind::Cached { spec } => spec.clone(),
        }
    }

    pub fn label(&self) -> String {
        self.meta.lock().label.clone()
    }

    pub fn state(&self) -> State {
        self.cell.state()
    }

    pub fn done(&self) -> bool {
        self.cell.done()
    }

    pub fn args(&self) -> &[Obj] {
        &self.args
    }

    pub(crate) fn rule(&self) -> Option<&'static Rule> {
        match &self.kind {
            TaskKind::Rule(rule) => Some(rule),
            TaskKind::Cached { .. } => None,
        }
    }

    pub fn rule_name(&self) -> Option<String> {
        self.meta.lock().rule.clone()
    }

    pub fn set_storage(&self, key: impl Into<String>, value: Value) {
        self.storage.lock().insert(key.into(), value);
    }

    pub fn storage_get(&self, key: &str) -> Option<Value> {
        self.storage.lock().get(key).cloned()
    }

    /// Index into the eventual result.
    pub fn get(self: &Arc<Self>, key: impl Into<Key>) -> Arc<TaskComponent> {
        TaskComponent::new(self.clone(), vec![key.into()], None)
    }

    pub fn get_with_default(
        self: &Arc<Self>,
        key: impl Into<Key>,
        default: Value,
    ) -> Arc<TaskComponent> {
        TaskComponent::new(self.clone(), vec![key.into()], Some(default))
    }

    pub fn metadata(&self) -> Option<Vec<u8>> {
        postcard::to_allocvec(&*self.meta.lock()).ok()
    }

    pub fn set_metadata(&self, metadata: &[u8]) -> Result<(), Error> {
        let meta: TaskMeta = postcard::from_bytes(metadata)
            .map_err(|err| Error::Composite(format!("bad task metadata: {err}")))?;
        *self.meta.lock() = meta;
        Ok(())
    }

    pub fn set_running(&self) {
        self.cell.transition(State::Ready, State::Running);
    }

    pub fn set_has_run(&self) {
        self.cell.transition(State::Running, State::HasRun);
    }

    pub fn set_error(&self) {
        self.cell.transition(State::Running, State::Error);
    }

    /// Run `cb` when the task becomes done; the task must not be done yet.
    pub fn on_done(self: &Arc<Self>, cb: Box<dyn FnOnce() + Send>) {
        self.as_fut().add_done_callback(cb);
    }

    /// Record a finished result and transition to `Done`. Must follow
    /// `HasRun`; a future result must already be done.
    pub(crate) fn set_result_obj(self: &Arc<Self>, obj: Obj) {
        if let Some(fut) = obj.as_fut() {
            assert!(fut.done(), "setting an unfinished future as result");
        }
        assert!(self.state() == State::HasRun, "set_result before HAS_RUN");
        *self.result.lock() = Some(TaskResult::Obj(obj));
        self.as_fut().set_done();
    }

    pub(crate) fn set_result_raw(self: &Arc<Self>, value: Value) {
        assert!(self.state() == State::HasRun, "set_result before HAS_RUN");
        *self.result.lock() = Some(TaskResult::Raw(value));
        self.as_fut().set_done();
    }

    /// Record an unfinished future as the result: `HasRun` → `Awaiting`.
    /// The caller wires a done-callback that later promotes the task.
    pub(crate) fn set_future_result(self: &Arc<Self>, obj: Obj) {
        let fut = obj.as_fut().expect("future result must be a future");
        assert!(!fut.done(), "future result is already done");
        self.cell.transition(State::HasRun, State::Awaiting);
        *self.result.lock() = Some(TaskResult::Obj(obj));
    }

    /// The embedded future while `Awaiting`.
    pub fn future_result(&self) -> Result<Obj, Error> {
        let state = self.state();
        if state < State::Awaiting {
            return Err(Error::TaskState {
                label: self.label(),
                msg: "does not have a future result",
            });
        }
        if state > State::Awaiting {
            return Err(Error::TaskState {
                label: self.label(),
                msg: "already done",
            });
        }
        match &*self.result.lock() {
            Some(TaskResult::Obj(obj)) => Ok(obj.clone()),
            _ => unreachable!("awaiting task without a future result"),
        }
    }

    /// The task's value; valid only when done.
    pub fn result(&self) -> Result<Value, Error> {
        if !self.done() {
            return Err(Error::NotDone(self.label()));
        }
        // Clone the record out before resolving: resolution may recurse
        // into other tasks.
        if let Some(obj) = self.result_obj() {
            return obj.value();
        }
        if let Some(value) = self.result_raw() {
            return Ok(value);
        }
        Err(Error::TaskState {
            label: self.label(),
            msg: "has not run",
        })
    }

    /// The result as a hashed object, if it was one.
    pub fn result_obj(&self) -> Option<Obj> {
        match &*self.result.lock() {
            Some(TaskResult::Obj(obj)) => Some(obj.clone()),
            _ => None,
        }
    }

    pub fn result_raw(&self) -> Option<Value> {
        match &*self.result.lock() {
            Some(TaskResult::Raw(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// The configured default, or the default of the embedded result future.
    pub fn default_result(&self) -> Result<Value, Error> {
        if let Some(default) = self.meta.lock().default.clone() {
            return Ok(default);
        }
        let result_fut = match &*self.result.lock() {
            Some(TaskResult::Obj(obj)) => obj.as_fut(),
            _ => None,
        };
        match result_fut {
            Some(fut) => fut.default_result(),
            None => Err(Error::NoDefault(self.label())),
        }
    }

    /// Invoke the body directly with `value_or_default`-resolved arguments,
    /// outside the scheduler. Speculative: unfinished arguments fall back to
    /// their defaults.
    pub fn call(&self) -> Result<Value, RunError> {
        let rule = self.rule().ok_or_else(|| {
            RunError::Fatal(Error::TaskState {
                label: self.label(),
                msg: "cached task has no body",
            })
        })?;
        let args = self
            .args
            .iter()
            .map(Obj::value_or_default)
            .collect::<Result<Vec<_>, _>>()
            .map_err(RunError::Fatal)?;
        rule.invoke(args)
    }

    /// Argument values for scheduled execution; arguments must be done.
    pub(crate) fn arg_values(&self) -> Result<Vec<Value>, Error> {
        self.args.iter().map(Obj::value).collect()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<Task {} {} state={}>",
            self.hashid.tag(),
            self.label(),
            self.state()
        )
    }
}

/// A future representing `task[k₁][k₂]…`; done as soon as the task is done.
pub struct TaskComponent {
    task: Arc<Task>,
    keys: Vec<Key>,
    default: Mutex<Option<Value>>,
    cell: FutureCell,
    hashid: Hash,
    label: String,
}

impl TaskComponent {
    pub(crate) fn new(task: Arc<Task>, keys: Vec<Key>, default: Option<Value>) -> Arc<TaskComponent> {
        let spec = json::component_spec(task.hashid(), &keys);
        let label = {
            let mut label = task.label();
            for key in &keys {
                label.push_str(&format!("[{key}]"));
            }
            label
        };
        let component = Arc::new(TaskComponent {
            cell: FutureCell::new(vec![task.as_fut()]),
            hashid: Hash::of_bytes(spec.as_bytes()),
            task,
            keys,
            default: Mutex::new(default),
            label,
        });
        hook_done_on_ready(Fut::Component(component.clone()));
        component
    }

    pub(crate) fn from_spec(spec: &[u8], resolve: &mut dyn Resolver) -> Result<Arc<TaskComponent>, Error> {
        let (task_hash, keys) = json::parse_component_spec(spec)?;
        match resolve.resolve(&task_hash)? {
            Obj::Task(task) => Ok(TaskComponent::new(task, keys, None)),
            other => Err(Error::Composite(format!(
                "component spec resolved to {}",
                other.typetag()
            ))),
        }
    }

    pub(crate) fn cell(&self) -> &FutureCell {
        &self.cell
    }

    pub fn hashid(&self) -> &Hash {
        &self.hashid
    }

    pub fn spec(&self) -> Vec<u8> {
        json::component_spec(self.task.hashid(), &self.keys).into_bytes()
    }

    pub fn label(&self) -> String {
        self.label.clone()
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    pub fn as_obj(self: &Arc<Self>) -> Obj {
        Obj::Component(self.clone())
    }

    pub fn done(&self) -> bool {
        self.cell.done()
    }

    /// Chain another index.
    pub fn get(self: &Arc<Self>, key: impl Into<Key>) -> Arc<TaskComponent> {
        let mut keys = self.keys.clone();
        keys.push(key.into());
        TaskComponent::new(self.task.clone(), keys, None)
    }

    pub fn value(&self) -> Result<Value, Error> {
        let mut value = self.task.result()?;
        for key in &self.keys {
            value = value.index(key)?;
        }
        Ok(value)
    }

    pub fn default_result(&self) -> Result<Value, Error> {
        if let Some(default) = self.default.lock().clone() {
            return Ok(default);
        }
        let mut value = self.task.default_result()?;
        for key in &self.keys {
            value = value.index(key)?;
        }
        Ok(value)
    }

    pub fn metadata(&self) -> Option<Vec<u8>> {
        postcard::to_allocvec(&*self.default.lock()).ok()
    }

    pub fn set_metadata(&self, metadata: &[u8]) -> Result<(), Error> {
        let default: Option<Value> = postcard::from_bytes(metadata)
            .map_err(|err| Error::Composite(format!("bad component metadata: {err}")))?;
        *self.default.lock() = default;
        Ok(())
    }
}

/// A composite that embeds futures; done when all of them are done.
pub struct TaskComposite {
    inner: HashedComposite,
    cell: FutureCell,
}

impl TaskComposite {
    pub(crate) fn new(jsonstr: String, components: Vec<Obj>) -> Arc<TaskComposite> {
        let futures: Vec<Fut> = components.iter().filter_map(Obj::as_fut).collect();
        assert!(!futures.is_empty(), "task composite without futures");
        let composite = Arc::new(TaskComposite {
            inner: HashedComposite::new(jsonstr, components),
            cell: FutureCell::new(futures),
        });
        hook_done_on_ready(Fut::Composite(composite.clone()));
        composite
    }

    pub(crate) fn from_spec(spec: &[u8], resolve: &mut dyn Resolver) -> Result<Arc<TaskComposite>, Error> {
        let (jsonstr, hashids) = json::parse_composite_spec(spec)?;
        let components = hashids
            .iter()
            .map(|h| resolve.resolve(h))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TaskComposite::new(jsonstr, components))
    }

    pub(crate) fn cell(&self) -> &FutureCell {
        &self.cell
    }

    pub fn hashid(&self) -> &Hash {
        self.inner.hashid()
    }

    pub fn spec(&self) -> Vec<u8> {
        self.inner.spec()
    }

    pub fn label(&self) -> String {
        self.inner.label()
    }

    pub fn done(&self) -> bool {
        self.cell.done()
    }

    pub fn components(&self) -> Vec<Obj> {
        self.inner.components()
    }

    pub fn resolve(
        &self,
        handler: &mut dyn FnMut(&Obj) -> Result<Value, Error>,
    ) -> Result<Value, Error> {
        self.inner.resolve(handler)
    }

    pub fn default_result(&self) -> Result<Value, Error> {
        self.resolve(&mut |comp| comp.value_or_default())
    }
}

/// Composites and components carry no body: they become done the moment all
/// their parents are.
fn hook_done_on_ready(fut: Fut) {
    let weak = fut.downgrade();
    fut.add_ready_callback(Box::new(move || {
        if let Some(fut) = weak.upgrade() {
            fut.set_done();
        }
    }));
}
