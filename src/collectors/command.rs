use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::time;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("'{program}' did not finish within {timeout:?}")]
    Timeout { program: String, timeout: Duration },
    #[error("'{program}' exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// Runs `argv[0]` with the remaining arguments and returns its stdout.
///
/// The child is killed if the timeout elapses.
pub async fn run_command(
    argv: &[String],
    cwd: Option<&Path>,
    timeout: Duration,
) -> Result<String, CommandError> {
    let (program, args) = match argv.split_first() {
        Some(split) => split,
        None => {
            return Err(CommandError::Spawn {
                program: String::new(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
            })
        }
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let child = cmd.spawn().map_err(|source| CommandError::Spawn {
        program: program.clone(),
        source,
    })?;

    let output = match time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => {
            return Err(CommandError::Spawn {
                program: program.clone(),
                source,
            })
        }
        Err(_elapsed) => {
            return Err(CommandError::Timeout {
                program: program.clone(),
                timeout,
            })
        }
    };

    if !output.status.success() {
        return Err(CommandError::Failed {
            program: program.clone(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}
