use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use mona::{Error, EvalOptions, Failure, Session, State, TaskOpts, Value};
use pretty_assertions::assert_eq;

mona::rule! {
    pub fn identity(args) {
        let mut args = args;
        Ok(args.remove(0))
    }
}

mona::rule! {
    pub fn total(args) {
        let mut sum = 0;
        for item in args[0].as_list()? {
            sum += item.as_int()?;
        }
        Ok(Value::Int(sum))
    }
}

mona::rule! {
    pub fn add(args) {
        Ok(Value::Int(args[0].as_int()? + args[1].as_int()?))
    }
}

mona::rule! {
    pub fn fib(args) uses [fib, add] {
        let n = args[0].as_int()?;
        if n < 2 {
            return Ok(Value::Int(n));
        }
        let a = fib.call([Value::Int(n - 1)])?;
        let b = fib.call([Value::Int(n - 2)])?;
        Ok(add.call([a.as_obj().into(), b.as_obj().into()])?.as_obj().into())
    }
}

mona::rule! {
    pub fn recurse(args) uses [recurse] {
        let i = args[0].as_int()?;
        if i < 5 {
            return Ok(recurse.call([Value::Int(i + 1)])?.as_obj().into());
        }
        Ok(Value::Int(i))
    }
}

mona::rule! {
    pub fn negate_once(args) uses [negate_once] {
        let x = args[0].as_int()?;
        if x < 0 {
            return Ok(Value::Int(x));
        }
        Ok(negate_once.call([Value::Int(-x)])?.as_obj().into())
    }
}

mona::rule! {
    pub fn multi(args) uses [identity] {
        let n = args[0].as_int()?;
        let mut items = Vec::new();
        for x in 0..n {
            let task = identity.call_with(
                [Value::Int(x)],
                TaskOpts {
                    default: Some(Value::Int(0)),
                    ..TaskOpts::default()
                },
            )?;
            items.push(task.as_obj().into());
        }
        Ok(Value::List(items))
    }
}

mona::rule! {
    pub fn boom(args) {
        let _ = &args;
        Err(Failure::msg("kaboom").into())
    }
}

#[test]
fn pass_through() {
    let sess = Session::new(vec![]);
    let guard = sess.enter().unwrap();
    assert_eq!(sess.eval(Value::Int(10)).unwrap(), Value::Int(10));
    guard.exit().unwrap();
}

#[test]
fn fibonacci() {
    let sess = Session::new(vec![]);
    let guard = sess.enter().unwrap();
    let task = fib.call([Value::Int(10)]).unwrap();
    assert_eq!(sess.eval(task.as_obj().into()).unwrap(), Value::Int(55));
    guard.exit().unwrap();
}

#[test]
fn fibonacci_deduplicates_tasks() {
    let n_tasks = {
        let sess = Session::new(vec![]);
        let guard = sess.enter().unwrap();
        let task = fib.call([Value::Int(10)]).unwrap();
        sess.eval(task.as_obj().into()).unwrap();
        let n = sess.task_count();
        guard.exit().unwrap();
        n
    };
    let sess = Session::new(vec![]);
    let guard = sess.enter().unwrap();
    let five = fib.call([Value::Int(5)]).unwrap();
    let ten = fib.call([Value::Int(10)]).unwrap();
    let both = Value::List(vec![five.as_obj().into(), ten.as_obj().into()]);
    assert_eq!(
        sess.eval(both).unwrap(),
        Value::List(vec![Value::Int(5), Value::Int(55)])
    );
    // fib(5) is a sub-graph of fib(10): no new tasks beyond the first run.
    assert_eq!(sess.task_count(), n_tasks);
    guard.exit().unwrap();
}

#[test]
fn recursion_resolves_through_returned_futures() {
    let sess = Session::new(vec![]);
    let guard = sess.enter().unwrap();
    let task = recurse.call([Value::Int(0)]).unwrap();
    assert_eq!(sess.eval(task.as_obj().into()).unwrap(), Value::Int(5));
    assert!(task.done());
    assert_eq!(task.result().unwrap(), Value::Int(5));
    assert_eq!(sess.task_count(), 6);
    guard.exit().unwrap();
}

#[test]
fn returned_done_future() {
    let sess = Session::new(vec![]);
    let guard = sess.enter().unwrap();
    let neg = negate_once.call([Value::Int(-4)]).unwrap();
    sess.eval(neg.as_obj().into()).unwrap();
    let task = negate_once.call([Value::Int(4)]).unwrap();
    assert_eq!(sess.eval(task.as_obj().into()).unwrap(), Value::Int(-4));
    guard.exit().unwrap();
}

#[test]
fn identical_args_produce_the_same_task() {
    let sess = Session::new(vec![]);
    let guard = sess.enter().unwrap();
    let via_bytes = identity.call([Value::bytes(&b"same"[..])]).unwrap();
    let via_obj = identity
        .call([mona::ensure_hashed(Value::bytes(&b"same"[..])).unwrap().into()])
        .unwrap();
    assert_eq!(via_bytes.hashid(), via_obj.hashid());
    assert!(Arc::ptr_eq(&via_bytes, &via_obj));
    assert_eq!(sess.task_count(), 1);
    sess.eval(via_bytes.as_obj().into()).unwrap();
    guard.exit().unwrap();
}

#[test]
fn component_indexing_resolves_chained_keys() {
    let sess = Session::new(vec![]);
    let guard = sess.enter().unwrap();
    let mut map = std::collections::BTreeMap::new();
    map.insert("a".to_string(), Value::List(vec![Value::Int(10), Value::Int(20)]));
    let task = identity.call([Value::Map(map)]).unwrap();
    let component = task.get("a").get(1u64);
    let value = sess.eval(component.as_obj().into()).unwrap();
    assert_eq!(value, Value::Int(20));
    guard.exit().unwrap();
}

#[test]
fn execution_limit_shuts_the_traversal_down() {
    let sess = Session::new(vec![]);
    let guard = sess.enter().unwrap();
    let task = fib.call([Value::Int(6)]).unwrap();
    let err = sess
        .eval_with(
            task.as_obj().into(),
            EvalOptions {
                limit: Some(1),
                ..EvalOptions::default()
            },
        )
        .unwrap_err();
    match err {
        Error::Unresolved(unresolved) => assert!(unresolved.limit_reached),
        other => panic!("unexpected error: {other}"),
    }
    guard.exit().unwrap();
}

#[test]
fn task_filter_skips_execution() {
    let sess = Session::new(vec![]);
    let guard = sess.enter().unwrap();
    let task = identity.call([Value::Int(1)]).unwrap();
    let err = sess
        .eval_with(
            task.as_obj().into(),
            EvalOptions {
                filter: Some(Box::new(|_| false)),
                ..EvalOptions::default()
            },
        )
        .unwrap_err();
    match err {
        Error::Unresolved(unresolved) => assert!(unresolved.skipped),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(task.state(), State::Ready);
    guard.exit().unwrap();
}

#[test]
fn handled_failures_keep_the_traversal_alive() {
    let sess = Session::new(vec![]);
    let guard = sess.enter().unwrap();
    let failing = boom.call([Value::Int(0)]).unwrap();
    let fine = identity.call([Value::Int(7)]).unwrap();
    let handled = Arc::new(AtomicUsize::new(0));
    let seen = handled.clone();
    let err = sess
        .eval_with(
            Value::List(vec![failing.as_obj().into(), fine.as_obj().into()]),
            EvalOptions {
                handler: Some(Box::new(move |_, failure| {
                    assert!(!failure.is_process());
                    seen.fetch_add(1, Ordering::SeqCst);
                    true
                })),
                ..EvalOptions::default()
            },
        )
        .unwrap_err();
    match err {
        Error::Unresolved(unresolved) => assert_eq!(unresolved.handled.len(), 1),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(handled.load(Ordering::SeqCst), 1);
    assert_eq!(failing.state(), State::Error);
    assert!(fine.done());
    guard.exit().unwrap();
}

#[test]
fn unhandled_failures_propagate() {
    let sess = Session::new(vec![]);
    let guard = sess.enter().unwrap();
    let failing = boom.call([Value::Int(1)]).unwrap();
    let err = sess.eval(failing.as_obj().into()).unwrap_err();
    assert!(matches!(err, Error::TaskFailed { .. }));
    guard.exit().unwrap();
}

mod helper_hash {
    pub mod v1 {
        use mona::Value;

        mona::helper! {
            DOUBLE: fn double(x: i64) -> i64 {
                x * 2
            }
        }

        mona::rule! {
            pub fn hdouble(args) helpers [DOUBLE] {
                Ok(Value::Int(double(args[0].as_int()?)))
            }
        }
    }

    pub mod v2 {
        use mona::Value;

        mona::helper! {
            DOUBLE: fn double(x: i64) -> i64 {
                x + x
            }
        }

        mona::rule! {
            pub fn hdouble(args) helpers [DOUBLE] {
                Ok(Value::Int(double(args[0].as_int()?)))
            }
        }
    }
}

#[test]
fn editing_a_helper_changes_the_function_hash() {
    // The two rule bodies are textually identical; only the source of the
    // helper they delegate to differs.
    assert_ne!(
        helper_hash::v1::hdouble.func_hash().unwrap(),
        helper_hash::v2::hdouble.func_hash().unwrap()
    );
}

#[test]
fn partial_evaluation_uses_defaults() {
    let sess = Session::new(vec![]);
    let guard = sess.enter().unwrap();
    let main = multi.call([Value::Int(3)]).unwrap();
    sess.run_task(&main).unwrap();
    // Run just one of the generated tasks; the others fall back to their
    // default of zero.
    let children = sess.side_effects_of(&main);
    assert_eq!(children.len(), 3);
    sess.run_task(&children[2]).unwrap();
    let sum = total.call([main.as_obj().into()]).unwrap();
    assert_eq!(sum.call().unwrap(), Value::Int(2));
    guard.exit().unwrap();
}
