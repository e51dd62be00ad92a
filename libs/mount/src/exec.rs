//! External command runner.

use std::ffi::{OsStr, OsString};
use std::path::Path;

use tokio::process::Command;
use tracing::debug;

use crate::error::ExecError;

/// Captured output of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run `program` with `args`, failing on a non-zero exit status.
pub async fn run<I, S>(program: &Path, args: I) -> Result<CommandOutput, ExecError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<OsString> = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
    let cmd = cmdline(program, &args);
    debug!(cmd = %cmd, "Running command");

    let output = Command::new(program)
        .args(&args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| ExecError::Spawn {
            cmd: cmd.clone(),
            source,
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        return Err(ExecError::Status {
            cmd,
            status: output.status,
            stderr: stderr.trim().to_string(),
        });
    }
    Ok(CommandOutput { stdout, stderr })
}

/// Like `run`, but any stderr output also counts as failure.
pub async fn run_strict<I, S>(program: &Path, args: I) -> Result<CommandOutput, ExecError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<OsString> = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
    let output = run(program, &args).await?;
    if !output.stderr.trim().is_empty() {
        return Err(ExecError::Stderr {
            cmd: cmdline(program, &args),
            stdout: output.stdout,
            stderr: output.stderr.trim().to_string(),
        });
    }
    Ok(output)
}

fn cmdline(program: &Path, args: &[OsString]) -> String {
    let mut line = program.display().to_string();
    for arg in args {
        line.push(' ');
        line.push_str(&arg.to_string_lossy());
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let out = run(Path::new("/bin/sh"), ["-c", "echo hello"]).await.unwrap();
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_an_error() {
        let err = run(Path::new("/bin/sh"), ["-c", "echo boom >&2; exit 3"])
            .await
            .unwrap_err();
        match err {
            ExecError::Status { stderr, .. } => assert_eq!(stderr, "boom"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_strict_rejects_stderr_with_clean_exit() {
        let args = ["-c", "echo warning >&2; exit 0"];
        assert!(run(Path::new("/bin/sh"), args).await.is_ok());
        assert!(matches!(
            run_strict(Path::new("/bin/sh"), args).await,
            Err(ExecError::Stderr { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let err = run(Path::new("/nonexistent/tool"), ["x"]).await.unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }
}
