use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use mona::{dirtask::dir_task, files::File, Session, SessionPlugin, State, TaskOpts, Value};
use mona_cache::{Cache, WriteMode};
use mona_files::FileManager;
use mona::TmpdirManager;

static ADD_RUNS: AtomicUsize = AtomicUsize::new(0);
static CALC_RUNS: AtomicUsize = AtomicUsize::new(0);

mona::rule! {
    pub fn cadd(args) {
        ADD_RUNS.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Int(args[0].as_int()? + args[1].as_int()?))
    }
}

mona::rule! {
    pub fn cfib(args) uses [cfib, cadd] {
        let n = args[0].as_int()?;
        if n < 2 {
            return Ok(Value::Int(n));
        }
        let a = cfib.call([Value::Int(n - 1)])?;
        let b = cfib.call([Value::Int(n - 2)])?;
        Ok(cadd.call([a.as_obj().into(), b.as_obj().into()])?.as_obj().into())
    }
}

mona::rule! {
    pub fn ccalcs(args) uses [dir_task] {
        let _ = &args;
        CALC_RUNS.fetch_add(1, Ordering::SeqCst);
        let mut pairs = Vec::new();
        for dist in 0..5i64 {
            let script = File::from_str("script", "#!/bin/sh\nexpr $(cat data) \"*\" 2; true\n")?;
            let data = File::from_str("data", &dist.to_string())?;
            let task = dir_task.call_with(
                [script.into(), Value::List(vec![data.into()])],
                TaskOpts {
                    label: Some(format!("/ccalcs/dist={dist}")),
                    ..TaskOpts::default()
                },
            )?;
            pairs.push(Value::List(vec![
                Value::Int(dist),
                task.get("STDOUT").as_obj().into(),
            ]));
        }
        Ok(Value::List(pairs))
    }
}

mona::rule! {
    pub fn canalysis(args) {
        let mut sum = 0;
        for pair in args[0].as_list()? {
            let stdout = pair.as_list()?[1].as_file()?;
            sum += stdout
                .read_text()?
                .trim()
                .parse::<i64>()
                .map_err(|err| mona::Failure::msg(err))?;
        }
        Ok(Value::Int(sum))
    }
}

fn cache_plugins(
    root: &std::path::Path,
    write: WriteMode,
    full_restore: bool,
) -> Vec<Arc<dyn SessionPlugin>> {
    let files = camino::Utf8PathBuf::from_path_buf(root.join("files")).unwrap();
    let tmpdir = camino::Utf8PathBuf::from_path_buf(root.join("tmpdir")).unwrap();
    vec![
        TmpdirManager::new(tmpdir),
        FileManager::new(files, true),
        Cache::from_path(root.join("cache.db"), write, full_restore).unwrap(),
    ]
}

#[test]
fn fibonacci_is_memoized_across_sessions() {
    let repo = tempfile::tempdir().unwrap();

    let sess = Session::with_warn(cache_plugins(repo.path(), WriteMode::Eager, false), false);
    let guard = sess.enter().unwrap();
    let task = cfib.call([Value::Int(10)]).unwrap();
    assert_eq!(sess.eval(task.as_obj().into()).unwrap(), Value::Int(55));
    guard.exit().unwrap();
    let first_run_adds = ADD_RUNS.load(Ordering::SeqCst);
    assert!(first_run_adds > 0);

    // Fresh session, same cache: nothing re-executes.
    let sess = Session::with_warn(cache_plugins(repo.path(), WriteMode::Eager, false), false);
    let guard = sess.enter().unwrap();
    let task = cfib.call([Value::Int(10)]).unwrap();
    assert!(task.done(), "cached task restores straight to done");
    assert_eq!(sess.eval(task.as_obj().into()).unwrap(), Value::Int(55));
    guard.exit().unwrap();
    assert_eq!(ADD_RUNS.load(Ordering::SeqCst), first_run_adds);
}

#[test]
fn dir_tasks_restore_without_subprocesses() {
    let repo = tempfile::tempdir().unwrap();

    let sess = Session::with_warn(cache_plugins(repo.path(), WriteMode::Eager, false), false);
    let guard = sess.enter().unwrap();
    let calcs_task = ccalcs.call(Vec::new()).unwrap();
    let analysis_task = canalysis.call([calcs_task.as_obj().into()]).unwrap();
    assert_eq!(
        sess.eval(analysis_task.as_obj().into()).unwrap(),
        Value::Int(20)
    );
    guard.exit().unwrap();
    let runs_before = CALC_RUNS.load(Ordering::SeqCst);

    // Read-only full restore: the whole graph comes back, nothing runs.
    let sess = Session::with_warn(cache_plugins(repo.path(), WriteMode::Never, true), false);
    let guard = sess.enter().unwrap();
    let calcs_task = ccalcs.call(Vec::new()).unwrap();
    let analysis_task = canalysis.call([calcs_task.as_obj().into()]).unwrap();
    assert_eq!(
        sess.eval(analysis_task.as_obj().into()).unwrap(),
        Value::Int(20)
    );
    assert_eq!(CALC_RUNS.load(Ordering::SeqCst), runs_before);

    let dir_tasks: Vec<_> = sess
        .all_tasks()
        .into_iter()
        .filter(|t| t.rule_name().as_deref() == Some("dir_task"))
        .collect();
    assert_eq!(dir_tasks.len(), 5);
    assert!(dir_tasks.iter().all(|t| t.state() == State::Done));
    guard.exit().unwrap();
}

mod edited {
    use super::*;

    pub static EDITED_ADD_RUNS: AtomicUsize = AtomicUsize::new(0);

    pub mod v1 {
        use super::*;

        mona::rule! {
            pub fn sadd(args) {
                Ok(Value::Int(args[0].as_int()? + args[1].as_int()?))
            }
        }

        mona::rule! {
            pub fn sfib(args) uses [sfib, sadd] {
                let n = args[0].as_int()?;
                if n < 2 {
                    return Ok(Value::Int(n));
                }
                let a = sfib.call([Value::Int(n - 1)])?;
                let b = sfib.call([Value::Int(n - 2)])?;
                Ok(sadd.call([a.as_obj().into(), b.as_obj().into()])?.as_obj().into())
            }
        }
    }

    pub mod v2 {
        use super::*;

        mona::rule! {
            pub fn sadd(args) {
                EDITED_ADD_RUNS.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Int(args[0].as_int()? + args[1].as_int()? + 0))
            }
        }

        mona::rule! {
            pub fn sfib(args) uses [sfib, sadd] {
                let n = args[0].as_int()?;
                if n < 2 {
                    return Ok(Value::Int(n));
                }
                let a = sfib.call([Value::Int(n - 1)])?;
                let b = sfib.call([Value::Int(n - 2)])?;
                Ok(sadd.call([a.as_obj().into(), b.as_obj().into()])?.as_obj().into())
            }
        }
    }
}

#[test]
fn editing_a_function_invalidates_its_dependents() {
    let repo = tempfile::tempdir().unwrap();

    // The two versions digest differently even though they compute the same.
    assert_ne!(
        edited::v1::sadd.func_hash().unwrap(),
        edited::v2::sadd.func_hash().unwrap()
    );
    assert_ne!(
        edited::v1::sfib.func_hash().unwrap(),
        edited::v2::sfib.func_hash().unwrap()
    );

    let sess = Session::with_warn(cache_plugins(repo.path(), WriteMode::Eager, false), false);
    let guard = sess.enter().unwrap();
    let task = edited::v1::sfib.call([Value::Int(5)]).unwrap();
    assert_eq!(sess.eval(task.as_obj().into()).unwrap(), Value::Int(5));
    guard.exit().unwrap();

    // Same cache, edited `sadd`: every dependent re-executes.
    let sess = Session::with_warn(cache_plugins(repo.path(), WriteMode::Eager, false), false);
    let guard = sess.enter().unwrap();
    let task = edited::v2::sfib.call([Value::Int(5)]).unwrap();
    assert!(!task.done(), "an edited function is not a cache hit");
    assert_eq!(sess.eval(task.as_obj().into()).unwrap(), Value::Int(5));
    guard.exit().unwrap();
    assert!(edited::EDITED_ADD_RUNS.load(Ordering::SeqCst) > 0);
}

static IDENT_RUNS: AtomicUsize = AtomicUsize::new(0);

mona::rule! {
    pub fn rident(args) {
        IDENT_RUNS.fetch_add(1, Ordering::SeqCst);
        let mut args = args;
        Ok(args.remove(0))
    }
}

#[test]
fn reset_forces_reexecution() {
    let repo = tempfile::tempdir().unwrap();
    let cache = Cache::from_path(repo.path().join("cache.db"), WriteMode::Eager, false).unwrap();

    let sess = Session::with_warn(vec![cache.clone()], false);
    let guard = sess.enter().unwrap();
    let task = rident.call([Value::Int(9)]).unwrap();
    assert_eq!(sess.eval(task.as_obj().into()).unwrap(), Value::Int(9));
    guard.exit().unwrap();
    assert_eq!(IDENT_RUNS.load(Ordering::SeqCst), 1);

    // A fresh session restores from the cache...
    let sess = Session::with_warn(vec![cache.clone()], false);
    let guard = sess.enter().unwrap();
    let task = rident.call([Value::Int(9)]).unwrap();
    assert!(task.done());
    guard.exit().unwrap();
    assert_eq!(IDENT_RUNS.load(Ordering::SeqCst), 1);

    // ...until the recorded state is reset.
    assert!(cache.reset(false).unwrap() > 0);
    let sess = Session::with_warn(vec![cache], false);
    let guard = sess.enter().unwrap();
    let task = rident.call([Value::Int(9)]).unwrap();
    assert_eq!(sess.eval(task.as_obj().into()).unwrap(), Value::Int(9));
    guard.exit().unwrap();
    assert_eq!(IDENT_RUNS.load(Ordering::SeqCst), 2);
}
