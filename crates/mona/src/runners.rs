//! Subprocess helpers for rule bodies.
//!
//! A nonzero exit becomes a [`Failure::Process`] carrying argv, the exit
//! code, and the captured output, so the failure can be routed through an
//! evaluation's exception handler.

use std::{
    io::Write,
    process::{Command, Stdio},
};

use bytes::Bytes;
use tracing::error;

use crate::error::{Failure, RunError};

/// Run a subprocess, feeding `input` to stdin and capturing stdout/stderr.
/// Returns the standard output.
pub fn run_process(argv: &[&str], input: Option<&[u8]>) -> Result<Bytes, RunError> {
    let (program, rest) = argv
        .split_first()
        .ok_or_else(|| Failure::msg("empty argv"))?;
    let mut command = Command::new(program);
    command
        .args(rest)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = command.spawn().map_err(crate::error::Error::Io)?;
    if let Some(input) = input {
        let mut stdin = child.stdin.take().expect("stdin was piped");
        stdin.write_all(input).map_err(crate::error::Error::Io)?;
    }
    let output = child
        .wait_with_output()
        .map_err(crate::error::Error::Io)?;
    if !output.status.success() {
        error!("got nonzero exit code in {argv:?}");
        return Err(RunError::Failure(Failure::Process {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            code: output.status.code().unwrap_or(-1),
            stdout: output.stdout.into(),
            stderr: output.stderr.into(),
        }));
    }
    Ok(Bytes::from(output.stdout))
}

/// Run a command through the shell.
pub fn run_shell(cmd: &str, input: Option<&[u8]>) -> Result<Bytes, RunError> {
    run_process(&["/bin/sh", "-c", cmd], input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout() {
        let out = run_shell("echo hello", None).unwrap();
        assert_eq!(&out[..], b"hello\n");
    }

    #[test]
    fn feeds_stdin() {
        let out = run_shell("expr `cat` \"*\" 2", Some(b"2")).unwrap();
        assert_eq!(&out[..], b"4\n");
    }

    #[test]
    fn nonzero_exit_is_a_process_failure() {
        let err = run_shell("echo oops >&2; exit 3", None).unwrap_err();
        match err {
            RunError::Failure(Failure::Process {
                code,
                stderr,
                ..
            }) => {
                assert_eq!(code, 3);
                assert_eq!(&stderr[..], b"oops\n");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
