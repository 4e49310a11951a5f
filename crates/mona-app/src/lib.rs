#![deny(clippy::all)]

//! Repository assembly.
//!
//! An [`App`] owns the on-disk repository tree:
//!
//! ```text
//! <root>/
//!   config.toml       # optional front-end configuration (not parsed here)
//!   LAST_ENTRY        # JSON array [entry_name, args…] from the last run
//!   cache.db          # relational store of objects/tasks/sessions/targets
//!   files/HH/REST     # content-addressed file blobs
//!   tmpdir/mona_…     # managed per-task scratch directories
//! ```
//!
//! and builds sessions with the standard plugin set: parallel scheduler,
//! tmpdir manager, file manager, and persistent cache. [`Entries`] bind rule
//! names to per-argument string parsers so front-ends can invoke rules with
//! plain string arguments.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use mona::{Error, Parallel, Rule, Session, SessionPlugin, Task, TmpdirManager, Value};
use mona_cache::{Cache, WriteMode};
use mona_files::FileManager;
use rustc_hash::FxHashMap;
use tracing::info;

pub const MONA_DIR_ENV: &str = "MONA_DIR";

const DEFAULT_DIR: &str = ".mona";
const FILES: &str = "files";
const TMPDIR: &str = "tmpdir";
const CACHE: &str = "cache.db";
const LAST_ENTRY: &str = "LAST_ENTRY";

/// Options for [`App::session`].
pub struct SessionOpts {
    pub ncores: Option<usize>,
    pub write: WriteMode,
    pub full_restore: bool,
    pub warn_not_run: bool,
}

impl Default for SessionOpts {
    fn default() -> Self {
        SessionOpts {
            ncores: None,
            write: WriteMode::Eager,
            full_restore: false,
            warn_not_run: false,
        }
    }
}

pub struct App {
    root: Utf8PathBuf,
}

impl App {
    /// Locate the repository: an explicit path, `$MONA_DIR`, or `.mona`.
    pub fn new(root: Option<Utf8PathBuf>) -> App {
        let root = root
            .or_else(|| std::env::var(MONA_DIR_ENV).ok().map(Utf8PathBuf::from))
            .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_DIR));
        App { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn is_initialized(&self) -> bool {
        self.root.is_dir()
    }

    /// Create the repository tree; idempotent.
    pub fn init(&self) -> Result<(), Error> {
        if self.is_initialized() {
            info!("already initialized in {}", self.root);
            return Ok(());
        }
        info!("initializing an empty repository in {}", self.root);
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir(self.root.join(FILES))?;
        std::fs::create_dir(self.root.join(TMPDIR))?;
        Ok(())
    }

    /// A session with the standard plugin set.
    pub fn session(&self, opts: SessionOpts) -> Result<Arc<Session>, Error> {
        let plugins: Vec<Arc<dyn SessionPlugin>> = vec![
            Parallel::new(opts.ncores),
            TmpdirManager::new(self.root.join(TMPDIR)),
            FileManager::new(self.root.join(FILES), true),
            Cache::from_path(self.root.join(CACHE), opts.write, opts.full_restore)?,
        ];
        Ok(Session::with_warn(plugins, opts.warn_not_run))
    }

    /// The `[entry, args…]` recorded by the last run.
    pub fn last_entry(&self) -> Result<Vec<String>, Error> {
        let raw = std::fs::read_to_string(self.root.join(LAST_ENTRY))?;
        serde_json::from_str(&raw).map_err(|err| Error::InvalidInput(err.to_string()))
    }

    pub fn set_last_entry(&self, entry: &str, args: &[String]) -> Result<(), Error> {
        let mut record = vec![entry.to_string()];
        record.extend(args.iter().cloned());
        let encoded = serde_json::to_string(&record)
            .map_err(|err| Error::InvalidInput(err.to_string()))?;
        std::fs::write(self.root.join(LAST_ENTRY), encoded)?;
        Ok(())
    }
}

/// Parses one string argument of an entry into a value.
pub type ArgParser = fn(&str) -> Result<Value, Error>;

pub fn int_arg(raw: &str) -> Result<Value, Error> {
    raw.parse::<i64>()
        .map(Value::Int)
        .map_err(|_| Error::InvalidInput(format!("not an integer: {raw:?}")))
}

pub fn str_arg(raw: &str) -> Result<Value, Error> {
    Ok(Value::Str(raw.to_string()))
}

pub fn float_arg(raw: &str) -> Result<Value, Error> {
    raw.parse::<f64>()
        .map(Value::Float)
        .map_err(|_| Error::InvalidInput(format!("not a number: {raw:?}")))
}

struct Entry {
    rule: &'static Rule,
    parsers: Vec<ArgParser>,
}

/// Named entry points: a rule plus per-argument parsers, so the repository
/// can be driven with string arguments.
#[derive(Default)]
pub struct Entries {
    entries: FxHashMap<String, Entry>,
}

impl Entries {
    pub fn new() -> Entries {
        Entries::default()
    }

    pub fn add(&mut self, name: impl Into<String>, rule: &'static Rule, parsers: Vec<ArgParser>) {
        self.entries.insert(name.into(), Entry { rule, parsers });
    }

    /// Create the entry's task in the active session from string arguments.
    pub fn create_task(&self, name: &str, args: &[&str]) -> Result<Arc<Task>, Error> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| Error::InvalidInput(format!("unknown entry: {name:?}")))?;
        if args.len() != entry.parsers.len() {
            return Err(Error::InvalidInput(format!(
                "entry {name:?} takes {} args, got {}",
                entry.parsers.len(),
                args.len()
            )));
        }
        let values = entry
            .parsers
            .iter()
            .zip(args)
            .map(|(parse, raw)| parse(raw))
            .collect::<Result<Vec<_>, _>>()?;
        entry.rule.call(values)
    }
}
