use mona::{dirtask::dir_task, files::File, Error, Failure, Session, TaskOpts, TmpdirManager, Value};

const DOUBLER: &str = "#!/bin/sh\nexpr $(cat data) \"*\" 2; true\n";

mona::rule! {
    pub fn calcs(args) uses [dir_task] {
        let _ = &args;
        let mut pairs = Vec::new();
        for dist in 0..5i64 {
            let script = File::from_str("script", DOUBLER)?;
            let data = File::from_str("data", &dist.to_string())?;
            let task = dir_task.call_with(
                [script.into(), Value::List(vec![data.into()])],
                TaskOpts {
                    label: Some(format!("/calcs/dist={dist}")),
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
    pub fn analysis(args) {
        let mut sum = 0;
        for pair in args[0].as_list()? {
            let stdout = pair.as_list()?[1].as_file()?;
            let text = stdout.read_text()?;
            sum += text
                .trim()
                .parse::<i64>()
                .map_err(|err| mona::Failure::msg(err))?;
        }
        Ok(Value::Int(sum))
    }
}

#[test]
fn doubling_calcs_sum_to_twenty() {
    let sess = Session::new(vec![]);
    let guard = sess.enter().unwrap();
    let calcs_task = calcs.call(Vec::new()).unwrap();
    let analysis_task = analysis.call([calcs_task.as_obj().into()]).unwrap();
    assert_eq!(
        sess.eval(analysis_task.as_obj().into()).unwrap(),
        Value::Int(20)
    );

    // Spot-check one captured STDOUT: 2 * 2.
    let stdout = sess
        .side_effects_of(&calcs_task)
        .iter()
        .find(|t| t.label() == "/calcs/dist=2")
        .expect("dist=2 task exists")
        .result()
        .unwrap()
        .index(&"STDOUT".into())
        .unwrap();
    match stdout {
        Value::File(file) => assert_eq!(file.read_text().unwrap(), "4\n"),
        other => panic!("expected a file, got {other:?}"),
    }
    guard.exit().unwrap();
}

#[test]
fn symlinked_inputs_are_staged() {
    let sess = Session::new(vec![]);
    let guard = sess.enter().unwrap();
    let script = File::from_str("script", "#!/bin/sh\nexpr $(cat input) \"*\" 2; true\n").unwrap();
    let data = File::from_str("data", "3").unwrap();
    let task = dir_task
        .call(
            [
                script.into(),
                Value::List(vec![
                    data.into(),
                    Value::List(vec![Value::Path("input".into()), Value::Str("data".into())]),
                ]),
            ],
        )
        .unwrap();
    let result = sess.eval(task.as_obj().into()).unwrap();
    let stdout = result.index(&"STDOUT".into()).unwrap();
    match stdout {
        Value::File(file) => assert_eq!(file.read_text().unwrap(), "6\n"),
        other => panic!("expected a file, got {other:?}"),
    }
    guard.exit().unwrap();
}

#[test]
fn invalid_input_shapes_are_rejected() {
    let sess = Session::new(vec![]);
    let guard = sess.enter().unwrap();
    let task = dir_task
        .call([Value::Str("not a file".into()), Value::List(vec![])])
        .unwrap();
    let err = sess.eval(task.as_obj().into()).unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    guard.exit().unwrap();
}

#[test]
fn failing_executables_carry_their_output() {
    let sess = Session::new(vec![]);
    let guard = sess.enter().unwrap();
    let script = File::from_str("script", "#!/bin/sh\necho partial\necho broken >&2\nexit 2\n").unwrap();
    let task = dir_task
        .call([script.into(), Value::List(vec![])])
        .unwrap();
    let err = sess.eval(task.as_obj().into()).unwrap_err();
    match err {
        Error::TaskFailed { failure, .. } => match failure {
            Failure::Process {
                code,
                stdout,
                stderr,
                ..
            } => {
                assert_eq!(code, 2);
                assert_eq!(&stdout[..], b"partial\n");
                assert_eq!(&stderr[..], b"broken\n");
            }
            other => panic!("expected a process failure, got {other}"),
        },
        other => panic!("unexpected error: {other}"),
    }
    guard.exit().unwrap();
}

#[test]
fn managed_failures_are_raw_and_keep_the_directory() {
    let repo = tempfile::tempdir().unwrap();
    let tmproot = repo.path().join("tmpdir");
    let sess = Session::new(vec![TmpdirManager::new(
        tmproot.to_str().unwrap().to_string(),
    )]);
    let guard = sess.enter().unwrap();
    let script = File::from_str("script", "#!/bin/sh\necho partial\nexit 7\n").unwrap();
    let task = dir_task
        .call([script.into(), Value::List(vec![])])
        .unwrap();
    let err = sess.eval(task.as_obj().into()).unwrap_err();
    // The raw exit is re-raised, not wrapped with captured output...
    match err {
        Error::TaskFailed {
            failure: Failure::Exit { code, .. },
            ..
        } => assert_eq!(code, 7),
        other => panic!("expected a raw exit failure, got {other}"),
    }

    // ...because the scratch directory is retained for inspection, with the
    // captured output still in place.
    let kept: Vec<_> = std::fs::read_dir(&tmproot)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(kept.len(), 1);
    assert_eq!(std::fs::read(kept[0].join("STDOUT")).unwrap(), b"partial\n");
    guard.exit().unwrap();
}
