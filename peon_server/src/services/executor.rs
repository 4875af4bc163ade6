//! Process execution — build commands with streamed output, and one-shot
//! invocations of the external tools peon drives (git, tar, rsync).

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;

use std::borrow::Cow;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("could not run '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("command '{command}' exited with error code {code}\n{output}")]
    Exit {
        command: String,
        code: i32,
        output: String,
    },
}

/// Run `command` through `sh -c` in `cwd` with `env` added to the process environment.
///
/// Output lines are prefixed with `[stdout] ` or `[stderr] ` and accumulated in
/// arrival order; `on_output` receives every prefixed line as it arrives.
pub async fn run_shell(
    command: &str,
    cwd: &Path,
    env: &BTreeMap<String, String>,
    mut on_output: impl FnMut(&str),
) -> Result<String, CommandError> {
    let spawn_error = |source| CommandError::Spawn {
        command: command.to_string(),
        source,
    };

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(spawn_error)?;

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return Err(spawn_error(std::io::Error::other("output pipes not captured")));
    };
    let mut stdout = BufReader::new(stdout);
    let mut stderr = BufReader::new(stderr);
    let (mut stdout_buf, mut stderr_buf) = (Vec::new(), Vec::new());
    let (mut stdout_open, mut stderr_open) = (true, true);
    let mut output = String::new();

    // read_until keeps partial reads in the buffer when the other branch wins.
    while stdout_open || stderr_open {
        let (from_stdout, read) = tokio::select! {
            read = stdout.read_until(b'\n', &mut stdout_buf), if stdout_open => (true, read),
            read = stderr.read_until(b'\n', &mut stderr_buf), if stderr_open => (false, read),
        };
        let (prefix, buf, open) = if from_stdout {
            ("[stdout] ", &mut stdout_buf, &mut stdout_open)
        } else {
            ("[stderr] ", &mut stderr_buf, &mut stderr_open)
        };
        match read {
            Ok(0) => *open = false,
            Ok(_) => {
                let line = format!("{prefix}{}\n", decode_line(buf));
                buf.clear();
                on_output(&line);
                output.push_str(&line);
            }
            Err(e) => {
                tracing::warn!(command, "could not read command output: {e}");
                *open = false;
            }
        }
    }

    let status = child.wait().await.map_err(spawn_error)?;
    if status.success() {
        Ok(output)
    } else {
        Err(CommandError::Exit {
            command: command.to_string(),
            code: status.code().unwrap_or(-1),
            output,
        })
    }
}

/// A raw output line without its line ending; invalid UTF-8 is replaced.
fn decode_line(raw: &[u8]) -> Cow<'_, str> {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw)
}

/// Run a tool to completion, returning its stdout. A non-zero exit carries stderr.
pub async fn run_tool<I, S>(program: &str, args: I, cwd: Option<&Path>) -> Result<String, CommandError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<_> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
    let command_line = std::iter::once(program.to_string())
        .chain(args.iter().map(|a| a.to_string_lossy().into_owned()))
        .collect::<Vec<_>>()
        .join(" ");

    let mut cmd = Command::new(program);
    cmd.args(&args).stdin(Stdio::null());
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }

    tracing::debug!(command = %command_line, "running tool");

    let output = cmd.output().await.map_err(|source| CommandError::Spawn {
        command: command_line.clone(),
        source,
    })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(CommandError::Exit {
            command: command_line,
            code: output.status.code().unwrap_or(-1),
            output: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
