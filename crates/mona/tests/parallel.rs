use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use mona::{
    dirtask::dir_task, files::File, run_process, run_shell, Error, EvalOptions, Failure, Parallel,
    Session, State, TaskOpts, Value,
};

mona::rule! {
    pub fn shell_double(args) {
        let _ = &args;
        let out = run_shell("expr `cat` \"*\" 2", Some(b"2"))?;
        let n = std::str::from_utf8(&out)
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .ok_or_else(|| Failure::msg("bad output"))?;
        Ok(Value::Int(n))
    }
}

mona::rule! {
    pub fn process_double(args) {
        let _ = &args;
        let out = run_process(&["/bin/sh", "-c", "expr `cat` \"*\" 2"], Some(b"2"))?;
        let n = std::str::from_utf8(&out)
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .ok_or_else(|| Failure::msg("bad output"))?;
        Ok(Value::Int(n))
    }
}

mona::rule! {
    pub fn pcalcs(args) uses [dir_task] {
        // args[0] selects which dist (if any) gets a broken script.
        let broken = args[0].as_int()?;
        let mut pairs = Vec::new();
        for dist in 0..5i64 {
            let source = if dist == broken {
                "#!/bin/sh\nexit 1\n".to_string()
            } else {
                "#!/bin/sh\nexpr $(cat data) \"*\" 2; true\n".to_string()
            };
            let script = File::from_str("script", &source)?;
            let data = File::from_str("data", &dist.to_string())?;
            let mut sentinel = std::collections::BTreeMap::new();
            sentinel.insert(
                "STDOUT".to_string(),
                Value::File(File::from_str("STDOUT", "0\n")?),
            );
            let task = dir_task.call_with(
                [script.into(), Value::List(vec![data.into()])],
                TaskOpts {
                    label: Some(format!("/pcalcs/dist={dist}")),
                    default: Some(Value::Map(sentinel)),
                    ..TaskOpts::default()
                },
            )?;
            task.set_storage("ncores", Value::Int(1));
            pairs.push(Value::List(vec![
                Value::Int(dist),
                task.get("STDOUT").as_obj().into(),
            ]));
        }
        Ok(Value::List(pairs))
    }
}

mona::rule! {
    pub fn panalysis(args) {
        let mut sum = 0;
        for pair in args[0].as_list()? {
            let stdout = pair.as_list()?[1].as_file()?;
            let text = stdout.read_text()?;
            sum += text
                .trim()
                .parse::<i64>()
                .map_err(|err| Failure::msg(err))?;
        }
        Ok(Value::Int(sum))
    }
}

#[test]
fn shell_runs_under_the_scheduler() {
    let sess = Session::new(vec![Parallel::new(None)]);
    let guard = sess.enter().unwrap();
    let task = shell_double.call(Vec::new()).unwrap();
    assert_eq!(sess.eval(task.as_obj().into()).unwrap(), Value::Int(4));
    guard.exit().unwrap();
}

#[test]
fn process_runs_under_the_scheduler() {
    let sess = Session::new(vec![Parallel::new(Some(2))]);
    let guard = sess.enter().unwrap();
    let task = process_double.call(Vec::new()).unwrap();
    assert_eq!(sess.eval(task.as_obj().into()).unwrap(), Value::Int(4));
    guard.exit().unwrap();
}

#[test]
fn parallel_calcs_sum_to_twenty() {
    let sess = Session::new(vec![Parallel::new(None)]);
    let guard = sess.enter().unwrap();
    let calcs_task = pcalcs.call([Value::Int(-1)]).unwrap();
    let analysis_task = panalysis.call([calcs_task.as_obj().into()]).unwrap();
    assert_eq!(
        sess.eval(analysis_task.as_obj().into()).unwrap(),
        Value::Int(20)
    );
    guard.exit().unwrap();
}

#[test]
fn handled_process_failure_falls_back_to_defaults() {
    let sess = Session::new(vec![Parallel::new(None)]);
    let guard = sess.enter().unwrap();
    let calcs_task = pcalcs.call([Value::Int(2)]).unwrap();
    let analysis_task = panalysis.call([calcs_task.as_obj().into()]).unwrap();
    let handled = Arc::new(AtomicUsize::new(0));
    let seen = handled.clone();
    let err = sess
        .eval_with(
            analysis_task.as_obj().into(),
            EvalOptions {
                handler: Some(Box::new(move |_, failure| {
                    if failure.is_process() {
                        seen.fetch_add(1, Ordering::SeqCst);
                        true
                    } else {
                        false
                    }
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

    // The failing task errored; the others ran to completion, and the
    // analysis can still be evaluated speculatively with the sentinel
    // default standing in for the broken calculation.
    let failing = sess
        .side_effects_of(&calcs_task)
        .iter()
        .find(|t| t.label() == "/pcalcs/dist=2")
        .expect("dist=2 task exists")
        .clone();
    assert_eq!(failing.state(), State::Error);
    assert_eq!(analysis_task.call().unwrap(), Value::Int(16));
    guard.exit().unwrap();
}
