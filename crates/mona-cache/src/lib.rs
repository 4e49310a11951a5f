#![deny(clippy::all)]

//! SQLite-backed persistent cache.
//!
//! Four tables: `objects` holds reconstructable hashed instances, `tasks`
//! the per-task execution record (state, side effects, result), `sessions`
//! one row per run, and `targets` the objects observed in each session with
//! their latest label/metadata.
//!
//! On task creation the cache looks the hashid up in `tasks`; a hit marks
//! the task for restoration: side-effect children are re-registered in
//! reverse order (full restore), results are resolved back into live
//! objects through the `objects` table, and the task is driven straight to
//! its recorded final state without its body ever running.

use std::sync::Arc;

use mona::{obj_from_spec, Error, Obj, Session, SessionPlugin, State, Task, Value, WeakObj};
use mona_hash::Hash;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error as ThisError;
use tracing::{debug, warn};

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS objects (
    hashid  TEXT PRIMARY KEY,
    typetag TEXT,
    spec    BLOB
);
CREATE TABLE IF NOT EXISTS tasks (
    hashid       TEXT PRIMARY KEY,
    state        TEXT,
    side_effects TEXT,
    result_type  TEXT,
    result       BLOB,
        FOREIGN KEY (hashid) REFERENCES objects(hashid)
);
CREATE TABLE IF NOT EXISTS sessions (
    sessionid INTEGER PRIMARY KEY,
    created   TEXT
);
CREATE TABLE IF NOT EXISTS targets (
    objectid  TEXT,
    sessionid INTEGER,
    label     TEXT,
    metadata  BLOB,
        PRIMARY KEY (objectid, sessionid),
        FOREIGN KEY (objectid) REFERENCES objects(hashid),
        FOREIGN KEY (sessionid) REFERENCES sessions(sessionid)
);
";

const SESSIONID_KEY: &str = "cache:sessionid";

/// When rows are written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    /// Write rows as things happen, row by row.
    Eager,
    /// Buffer everything in memory, flush once at session exit.
    OnExit,
    /// Read-only: restore, never write.
    Never,
}

#[derive(Debug, ThisError)]
enum CacheError {
    #[error(transparent)]
    Sql(#[from] rusqlite::Error),
    #[error("cannot encode cached value: {0}")]
    Encoding(#[from] postcard::Error),
    #[error("corrupt cache: {0}")]
    Corrupt(String),
}

impl From<CacheError> for Error {
    fn from(err: CacheError) -> Error {
        Error::Storage(Box::new(err))
    }
}

struct TaskRow {
    state: State,
    side_effects: Option<String>,
    result_type: Option<String>,
    result: Option<rusqlite::types::Value>,
}

enum Restored {
    Obj(Obj),
    Raw(Value),
}

/// The cache plugin. Cheap to clone; all clones share the connection.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<Inner>,
}

struct Inner {
    db: Mutex<Connection>,
    write: WriteMode,
    full_restore: bool,
    /// Objects waiting for the exit-time flush (deferred write mode).
    buffered: Mutex<FxHashMap<Hash, Obj>>,
    /// Live instances by hashid, so restoration never duplicates an object.
    object_cache: Mutex<FxHashMap<Hash, WeakObj>>,
    /// Tasks already driven through restoration this session.
    restored: Mutex<FxHashSet<Hash>>,
    /// Work list while a restoration cascade is in progress.
    pending_restore: Mutex<Vec<Arc<Task>>>,
}

impl Cache {
    /// Open (creating tables if missing) a cache at the given path.
    pub fn from_path(
        path: impl AsRef<std::path::Path>,
        write: WriteMode,
        full_restore: bool,
    ) -> Result<Arc<Cache>, Error> {
        let db = Connection::open(path).map_err(CacheError::Sql)?;
        db.execute_batch(SCHEMA).map_err(CacheError::Sql)?;
        Ok(Arc::new(Cache {
            inner: Arc::new(Inner {
                db: Mutex::new(db),
                write,
                full_restore,
                buffered: Mutex::new(FxHashMap::default()),
                object_cache: Mutex::new(FxHashMap::default()),
                restored: Mutex::new(FxHashSet::default()),
                pending_restore: Mutex::new(Vec::new()),
            }),
        }))
    }

    // ----- rows -----

    fn task_row(&self, hashid: &Hash) -> Result<Option<TaskRow>, CacheError> {
        let db = self.inner.db.lock();
        let row = db
            .query_row(
                "SELECT state, side_effects, result_type, result FROM tasks WHERE hashid = ?1",
                params![hashid.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, rusqlite::types::Value>(3)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(state, side_effects, result_type, result)| {
            let state = State::from_name(&state)
                .ok_or_else(|| CacheError::Corrupt(format!("unknown state: {state:?}")))?;
            let result = match result {
                rusqlite::types::Value::Null => None,
                other => Some(other),
            };
            Ok(TaskRow {
                state,
                side_effects,
                result_type,
                result,
            })
        })
        .transpose()
    }

    fn object_row(&self, hashid: &Hash) -> Result<(String, Vec<u8>), CacheError> {
        let db = self.inner.db.lock();
        db.query_row(
            "SELECT typetag, spec FROM objects WHERE hashid = ?1",
            params![hashid.as_str()],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)),
        )
        .optional()?
        .ok_or_else(|| CacheError::Corrupt(format!("missing object row: {hashid}")))
    }

    fn latest_metadata(&self, hashid: &Hash) -> Result<Option<Vec<u8>>, CacheError> {
        let db = self.inner.db.lock();
        Ok(db
            .query_row(
                "SELECT metadata FROM targets WHERE objectid = ?1 ORDER BY sessionid DESC LIMIT 1",
                params![hashid.as_str()],
                |row| row.get::<_, Option<Vec<u8>>>(0),
            )
            .optional()?
            .flatten())
    }

    fn store_objects(&self, objs: &[Obj]) -> Result<(), CacheError> {
        let db = self.inner.db.lock();
        let mut stmt =
            db.prepare_cached("INSERT OR IGNORE INTO objects VALUES (?1, ?2, ?3)")?;
        for obj in objs {
            stmt.execute(params![obj.hashid().as_str(), obj.typetag(), obj.spec()])?;
        }
        Ok(())
    }

    fn store_targets(&self, sess: &Arc<Session>, objs: &[Obj]) -> Result<(), CacheError> {
        let Some(Value::Int(sessionid)) = sess.storage_get(SESSIONID_KEY) else {
            return Err(CacheError::Corrupt("no session row for targets".into()));
        };
        let db = self.inner.db.lock();
        let mut stmt =
            db.prepare_cached("INSERT OR IGNORE INTO targets VALUES (?1, ?2, ?3, ?4)")?;
        for obj in objs {
            let label = match obj {
                Obj::Task(task) => Some(task.label()),
                _ => None,
            };
            stmt.execute(params![
                obj.hashid().as_str(),
                sessionid,
                label,
                obj.metadata()
            ])?;
        }
        Ok(())
    }

    fn insert_task_row(&self, task: &Task) -> Result<(), CacheError> {
        let db = self.inner.db.lock();
        db.execute(
            "INSERT INTO tasks VALUES (?1, ?2, NULL, NULL, NULL)",
            params![task.hashid().as_str(), task.state().name()],
        )?;
        Ok(())
    }

    fn update_state(&self, task: &Task) -> Result<(), CacheError> {
        let db = self.inner.db.lock();
        db.execute(
            "UPDATE tasks SET state = ?1 WHERE hashid = ?2",
            params![task.state().name(), task.hashid().as_str()],
        )?;
        Ok(())
    }

    /// Write the task's final record: state, side-effect list, and result —
    /// either the hashid of a stored object or a pickled opaque value.
    fn store_result(&self, sess: &Arc<Session>, task: &Arc<Task>) -> Result<(), Error> {
        let state = task.state();
        let (result_type, result): (&str, rusqlite::types::Value) = if state == State::Awaiting {
            let fut = task.future_result()?;
            ("HASHED", fut.hashid().as_str().to_string().into())
        } else if let Some(obj) = task.result_obj() {
            ("HASHED", obj.hashid().as_str().to_string().into())
        } else {
            let raw = task.result_raw().ok_or(Error::TaskState {
                label: task.label(),
                msg: "no result to store",
            })?;
            let blob = postcard::to_allocvec(&raw).map_err(CacheError::Encoding)?;
            ("PICKLED", blob.into())
        };
        let side_effects = sess
            .side_effects_of(task)
            .iter()
            .map(|t| t.hashid().as_str().to_string())
            .collect::<Vec<_>>()
            .join(",");
        let db = self.inner.db.lock();
        db.execute(
            "REPLACE INTO tasks VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                task.hashid().as_str(),
                state.name(),
                side_effects,
                result_type,
                result
            ],
        )
        .map_err(CacheError::Sql)?;
        Ok(())
    }

    fn store_session(&self, sess: &Arc<Session>) -> Result<(), CacheError> {
        let created = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string();
        let db = self.inner.db.lock();
        db.execute("INSERT INTO sessions VALUES (NULL, ?1)", params![created])?;
        sess.storage_set(SESSIONID_KEY, Value::Int(db.last_insert_rowid()));
        Ok(())
    }

    /// Forget recorded execution state so tasks run again on the next
    /// session: every task, or only the ones that never finished (the
    /// `reset --running` tooling path). Returns how many rows changed.
    pub fn reset(&self, only_unfinished: bool) -> Result<usize, Error> {
        let db = self.inner.db.lock();
        let changed = if only_unfinished {
            db.execute(
                "UPDATE tasks SET state = 'PENDING', side_effects = NULL, \
                 result_type = NULL, result = NULL WHERE state NOT IN ('DONE', 'ERROR')",
                [],
            )
        } else {
            db.execute(
                "UPDATE tasks SET state = 'PENDING', side_effects = NULL, \
                 result_type = NULL, result = NULL",
                [],
            )
        }
        .map_err(CacheError::Sql)?;
        Ok(changed)
    }

    // ----- restoration -----

    /// Load the live object named by `hashid`, materializing it (and its
    /// components, recursively) from the objects table. Restored tasks are
    /// re-registered in the session; with partial restore, tasks already
    /// past `HAS_RUN` come back as terminal cached sentinels.
    fn get_object(&self, sess: &Arc<Session>, hashid: &Hash) -> Result<Obj, Error> {
        if let Some(obj) = self
            .inner
            .object_cache
            .lock()
            .get(hashid)
            .and_then(WeakObj::upgrade)
        {
            return Ok(obj);
        }
        let (typetag, spec) = self.object_row(hashid)?;
        let mut obj: Option<Obj> = None;
        if typetag == "task" && !self.inner.full_restore {
            if let Some(row) = self.task_row(hashid)? {
                if row.state > State::HasRun {
                    let spec = String::from_utf8(spec.clone())
                        .map_err(|_| CacheError::Corrupt(format!("non-utf8 task spec: {hashid}")))?;
                    obj = Some(Obj::Task(Task::cached(hashid.clone(), spec)));
                }
            }
        }
        let obj = match obj {
            Some(obj) => obj,
            None => obj_from_spec(&typetag, &spec, &mut |h: &Hash| self.get_object(sess, h))?,
        };
        if obj.hashid() != hashid {
            return Err(CacheError::Corrupt(format!(
                "object {hashid} reconstructed with hash {}",
                obj.hashid()
            ))
            .into());
        }
        if let Some(metadata) = self.latest_metadata(hashid)? {
            obj.set_metadata(&metadata)?;
        }
        let obj = match obj {
            Obj::Task(task) => {
                let (task, registered) = sess.register_task(task)?;
                if registered && !self.inner.full_restore {
                    self.inner.pending_restore.lock().push(task.clone());
                }
                Obj::Task(task)
            }
            other => other,
        };
        self.inner
            .object_cache
            .lock()
            .insert(hashid.clone(), obj.downgrade());
        Ok(obj)
    }

    fn get_result(&self, sess: &Arc<Session>, row: &TaskRow) -> Result<Restored, Error> {
        match row.result_type.as_deref() {
            Some("HASHED") => {
                let Some(rusqlite::types::Value::Text(hash)) = &row.result else {
                    return Err(CacheError::Corrupt("hashed result is not text".into()).into());
                };
                let hash = Hash::from_hex(hash)
                    .map_err(|err| CacheError::Corrupt(err.to_string()))?;
                Ok(Restored::Obj(self.get_object(sess, &hash)?))
            }
            Some("PICKLED") => {
                let Some(rusqlite::types::Value::Blob(blob)) = &row.result else {
                    return Err(CacheError::Corrupt("pickled result is not a blob".into()).into());
                };
                let value: Value =
                    postcard::from_bytes(blob).map_err(CacheError::Encoding)?;
                Ok(Restored::Raw(value))
            }
            other => Err(CacheError::Corrupt(format!("bad result type: {other:?}")).into()),
        }
    }

    /// Drive one cached task to its recorded state, queueing side-effect
    /// children (in reverse order, so they restore before the parent's
    /// result resolves) when full restore is on.
    fn restore_task(&self, sess: &Arc<Session>, task: &Arc<Task>) -> Result<(), Error> {
        if !self.inner.restored.lock().insert(task.hashid().clone()) {
            return Ok(());
        }
        let Some(row) = self.task_row(task.hashid())? else {
            return Ok(());
        };
        if row.state < State::HasRun {
            return Ok(());
        }
        debug!("restoring from cache: {}", task.label());
        task.set_running();
        if self.inner.full_restore {
            if let Some(side_effects) = row.side_effects.as_deref().filter(|s| !s.is_empty()) {
                let mut children = Vec::new();
                for hashid in side_effects.split(',') {
                    let hashid = Hash::from_hex(hashid)
                        .map_err(|err| CacheError::Corrupt(err.to_string()))?;
                    match self.get_object(sess, &hashid)? {
                        Obj::Task(child) => {
                            sess.add_side_effect_of(task, &child);
                            children.push(child);
                        }
                        other => {
                            return Err(CacheError::Corrupt(format!(
                                "side effect {hashid} is a {}",
                                other.typetag()
                            ))
                            .into())
                        }
                    }
                }
                let mut pending = self.inner.pending_restore.lock();
                pending.extend(children.into_iter().rev());
            }
        }
        task.set_has_run();
        match self.get_result(sess, &row)? {
            Restored::Obj(obj) => {
                sess.apply_result_obj(task, obj)?;
            }
            Restored::Raw(value) => sess.apply_result_raw(task, value),
        }
        Ok(())
    }
}

impl SessionPlugin for Cache {
    fn name(&self) -> &'static str {
        "db_cache"
    }

    fn post_enter(&self, sess: &Arc<Session>) -> Result<(), Error> {
        if self.inner.write == WriteMode::Eager {
            self.store_session(sess)?;
        }
        Ok(())
    }

    fn post_create(&self, task: &Arc<Task>) -> Result<(), Error> {
        let sess = Session::active()?;
        let mut touched: Vec<Arc<Task>> = Vec::new();
        if self.task_row(task.hashid())?.is_some() {
            self.inner.pending_restore.lock().push(task.clone());
            loop {
                let Some(next) = self.inner.pending_restore.lock().pop() else {
                    break;
                };
                self.restore_task(&sess, &next)?;
                touched.push(next);
            }
        } else if self.inner.write == WriteMode::Eager {
            self.store_objects(&[task.as_obj()])?;
            self.insert_task_row(task)?;
            touched.push(task.clone());
        }
        if self.inner.write == WriteMode::Eager && !touched.is_empty() {
            let objs: Vec<Obj> = touched.iter().map(Task::as_obj).collect();
            self.store_targets(&sess, &objs)?;
        }
        Ok(())
    }

    fn post_task_run(&self, task: &Arc<Task>) -> Result<(), Error> {
        if self.inner.write != WriteMode::Eager {
            return Ok(());
        }
        let sess = Session::active()?;
        self.store_result(&sess, task)?;
        if task.state() < State::Done {
            // The result is still awaited; patch the row when it lands.
            let cache = self.clone();
            let weak = Arc::downgrade(task);
            task.on_done(Box::new(move || {
                if let Some(task) = weak.upgrade() {
                    if let Err(err) = cache.update_state(&task) {
                        warn!("failed to update cached state: {err}");
                    }
                }
            }));
        }
        Ok(())
    }

    fn save_hashed(&self, objs: &[Obj]) -> Result<(), Error> {
        if self.inner.write == WriteMode::Eager {
            let sess = Session::active()?;
            self.store_objects(objs)?;
            self.store_targets(&sess, objs)?;
        } else {
            let mut buffered = self.inner.buffered.lock();
            for obj in objs {
                buffered.insert(obj.hashid().clone(), obj.clone());
            }
        }
        Ok(())
    }

    fn pre_exit(&self, sess: &Arc<Session>) -> Result<(), Error> {
        if self.inner.write == WriteMode::OnExit {
            self.store_session(sess)?;
            let tasks = sess.all_tasks();
            for task in &tasks {
                if task.state() > State::HasRun {
                    self.store_result(sess, task)?;
                } else {
                    self.update_state(task)?;
                }
            }
            let mut objs: Vec<Obj> = self.inner.buffered.lock().values().cloned().collect();
            objs.extend(tasks.iter().map(Task::as_obj));
            self.store_objects(&objs)?;
            self.store_targets(sess, &objs)?;
        }
        self.inner.buffered.lock().clear();
        self.inner.object_cache.lock().clear();
        self.inner.restored.lock().clear();
        Ok(())
    }
}
