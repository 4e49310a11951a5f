//! The dir-task runtime: stage files, run an executable, collect outputs.
//!
//! `dir_task(exe, inputs)` materializes `exe` as `EXE` and each input into a
//! scratch directory, runs `EXE` with stdin closed and stdout/stderr
//! captured into `STDOUT`/`STDERR`, and returns every new regular file as a
//! map of path → file. With a tmpdir manager installed a failing directory
//! is retained for inspection and the raw exit failure is re-raised
//! unwrapped; without one the directory is always cleaned up and the
//! failure carries the captured output instead.

use std::process::{Command, Stdio};

use camino::{Utf8Path, Utf8PathBuf};
use rustc_hash::FxHashSet;
use walkdir::WalkDir;

use crate::{
    error::{Error, Failure, RunError},
    files::File,
    session::Session,
    util::make_executable,
    value::Value,
};

/// Name under which the executable is materialized.
pub const EXE_NAME: &str = "EXE";

const STDOUT_NAME: &str = "STDOUT";
const STDERR_NAME: &str = "STDERR";

enum DirtaskInput {
    File(File),
    Symlink { path: Utf8PathBuf, target: String },
}

impl DirtaskInput {
    fn path(&self) -> &Utf8Path {
        match self {
            DirtaskInput::File(file) => file.path(),
            DirtaskInput::Symlink { path, .. } => path,
        }
    }
}

crate::rule! {
    /// Rule wrapping an executable and its input files.
    ///
    /// The result is a map of every file the executable created, including
    /// the captured `STDOUT` and `STDERR`.
    pub fn dir_task(args) helpers [PARSE_ARGS, CHECKOUT_FILES, RUN_IN, COLLECT_OUTPUTS] {
        let (exe, inputs) = parse_args(&args)?;
        let input_names: FxHashSet<String> = std::iter::once(EXE_NAME.to_string())
            .chain(inputs.iter().map(|inp| inp.path().to_string()))
            .collect();
        let sess = Session::active()?;
        match sess.tmpdir_manager() {
            Some(manager) => {
                let scratch = manager.tempdir()?;
                match run_in(scratch.path(), &exe, &inputs, &input_names, false) {
                    Ok(outputs) => Ok(outputs),
                    Err(err) => {
                        scratch.retain();
                        Err(err)
                    }
                }
            }
            None => {
                let dir = tempfile::tempdir().map_err(Error::Io)?;
                let path = Utf8Path::from_path(dir.path())
                    .ok_or_else(|| Error::InvalidInput("non-utf8 tmpdir".into()))?;
                run_in(path, &exe, &inputs, &input_names, true)
            }
        }
    }
}

crate::helper! {
    PARSE_ARGS: fn parse_args(args: &[Value]) -> Result<(File, Vec<DirtaskInput>), RunError> {
        let [exe, inputs] = args else {
            return Err(Error::InvalidInput(format!(
                "dir_task takes an executable and a list of inputs, got {} args",
                args.len()
            ))
            .into());
        };
        let exe = exe.as_file()?.clone();
        let mut parsed = Vec::new();
        for input in inputs.as_list()? {
            match input {
                Value::File(file) => parsed.push(DirtaskInput::File(file.clone())),
                Value::List(pair) => match pair.as_slice() {
                    [Value::Path(path), Value::Str(target)] => parsed.push(DirtaskInput::Symlink {
                        path: path.clone(),
                        target: target.clone(),
                    }),
                    _ => return Err(Error::InvalidInput(format!("{input:?}")).into()),
                },
                other => return Err(Error::InvalidInput(format!("{other:?}")).into()),
            }
        }
        Ok((exe, parsed))
    }
}

crate::helper! {
    CHECKOUT_FILES: fn checkout_files(
        root: &Utf8Path,
        exe: &File,
        inputs: &[DirtaskInput],
    ) -> Result<(), Error> {
        exe.materialize_at(&root.join(EXE_NAME), false)?;
        make_executable(root.join(EXE_NAME))?;
        for input in inputs {
            if let Some(parent) = input.path().parent() {
                std::fs::create_dir_all(root.join(parent))?;
            }
            match input {
                DirtaskInput::File(file) => file.target_in(root, false)?,
                DirtaskInput::Symlink { path, target } => {
                    symlink(target, root.join(path).as_std_path())?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn symlink(target: &str, link: &std::path::Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn symlink(target: &str, link: &std::path::Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}

crate::helper! {
    RUN_IN: fn run_in(
        dir: &Utf8Path,
        exe: &File,
        inputs: &[DirtaskInput],
        input_names: &FxHashSet<String>,
        capture_output: bool,
    ) -> Result<Value, RunError> {
        checkout_files(dir, exe, inputs)?;
        let exe_path = dir.join(EXE_NAME);
        let stdout = std::fs::File::create(dir.join(STDOUT_NAME)).map_err(Error::Io)?;
        let stderr = std::fs::File::create(dir.join(STDERR_NAME)).map_err(Error::Io)?;
        let status = Command::new(exe_path.as_std_path())
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .status()
            .map_err(Error::Io)?;
        if !status.success() {
            let argv = vec![exe_path.to_string()];
            let code = status.code().unwrap_or(-1);
            // Without a tmpdir manager the directory is about to vanish, so
            // the failure is wrapped with the captured output; a managed
            // directory is retained and the raw exit surfaces instead.
            let failure = if capture_output {
                let stdout = std::fs::read(dir.join(STDOUT_NAME)).unwrap_or_default();
                let stderr = std::fs::read(dir.join(STDERR_NAME)).unwrap_or_default();
                Failure::Process {
                    argv,
                    code,
                    stdout: stdout.into(),
                    stderr: stderr.into(),
                }
            } else {
                Failure::Exit { argv, code }
            };
            return Err(RunError::Failure(failure));
        }
        collect_outputs(dir, input_names).map_err(RunError::Fatal)
    }
}

crate::helper! {
    /// Every regular file that is not a declared input becomes an output,
    /// registered with the file store.
    COLLECT_OUTPUTS: fn collect_outputs(
        dir: &Utf8Path,
        input_names: &FxHashSet<String>,
    ) -> Result<Value, Error> {
        let mut files = Vec::new();
        for entry in WalkDir::new(dir) {
            let entry = entry.map_err(|err| Error::Io(err.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = Utf8Path::from_path(entry.path())
                .ok_or_else(|| Error::InvalidInput(format!("non-utf8 output: {:?}", entry.path())))?;
            let rel = path
                .strip_prefix(dir)
                .map_err(|_| Error::InvalidInput(format!("output escaped tmpdir: {path}")))?;
            if input_names.contains(rel.as_str()) {
                continue;
            }
            files.push((rel.to_owned(), path.to_owned()));
        }
        let mut outputs = std::collections::BTreeMap::new();
        for (rel, abs) in files {
            let file = File::from_path(&abs, Some(dir), false)?;
            outputs.insert(rel.to_string(), Value::File(file));
        }
        Ok(Value::Map(outputs))
    }
}
