#![deny(clippy::all)]

//! A content-addressed, memoizing workflow engine.
//!
//! Users write rules — functions that create tasks instead of running. A
//! task's identity is the hash of its rule and arguments, the session
//! deduplicates tasks by that hash, and evaluation walks the resulting DAG,
//! running every task at most once. Results may themselves be futures
//! (tasks returning tasks), containers of futures, or indexed views into a
//! future, and the traversal keeps extending itself until the requested
//! value is available.
//!
//! Durability comes from plugins: a file store content-addresses file
//! bytes, and a persistent cache records tasks and objects so a rerun only
//! executes what changed.
//!
//! ```ignore
//! mona::rule! {
//!     pub fn add(args) {
//!         Ok(Value::Int(args[0].as_int()? + args[1].as_int()?))
//!     }
//! }
//!
//! mona::rule! {
//!     pub fn fib(args) uses [fib, add] {
//!         let n = args[0].as_int()?;
//!         if n < 2 {
//!             return Ok(Value::Int(n));
//!         }
//!         let a = fib.call([Value::Int(n - 1)])?;
//!         let b = fib.call([Value::Int(n - 2)])?;
//!         Ok(add.call([a.as_obj().into(), b.as_obj().into()])?.as_obj().into())
//!     }
//! }
//!
//! let sess = Session::new(vec![]);
//! let guard = sess.enter()?;
//! let task = fib.call([Value::Int(10)])?;
//! assert_eq!(sess.eval(task.as_obj().into())?, Value::Int(55));
//! guard.exit()?;
//! ```

pub mod dirtask;
mod error;
pub mod files;
mod futures;
mod graph;
pub mod hashing;
mod json;
pub mod plugins;
mod rule;
pub mod runners;
mod session;
mod task;
mod util;
mod value;

pub use error::{Error, Failure, RunError, Unresolved};
pub use files::{File, FileStore};
pub use futures::{Fut, State};
pub use graph::{Action, Priority, DEFAULT_PRIORITY};
pub use hashing::{ensure_hashed, maybe_hashed, obj_from_spec, HashedBytes, HashedComposite, Obj, Resolver, WeakObj};
pub use mona_hash::Hash;
pub use plugins::{parallel::Parallel, tmpdir::TmpdirManager, Execute, Job, SessionPlugin};
pub use rule::{FuncDep, Helper, Rule, RuleBody};
pub use runners::{run_process, run_shell};
pub use session::{EvalOptions, FailureHandler, Session, SessionGuard, TaskFilter};
pub use task::{Task, TaskComponent, TaskComposite, TaskOpts};
pub use util::{make_executable, make_nonwritable, make_writable};
pub use value::{Key, Value};
