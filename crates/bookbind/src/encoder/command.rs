use std::collections::VecDeque;
use std::ffi::OsStr;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use super::EncodingError;

/// Lines of stderr kept for error reports.
const STDERR_TAIL_LINES: usize = 20;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

pub(crate) struct ToolOutput {
    pub stdout: Vec<u8>,
    pub elapsed_secs: f64,
}

/// Command for an external tool; the child is killed if its future is dropped.
pub(crate) fn tool_command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    cmd.env("LC_ALL", "C")
        .stdin(Stdio::null())
        .kill_on_drop(true);
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        cmd.as_std_mut().creation_flags(CREATE_NO_WINDOW);
    }
    cmd
}

/// Runs `command` to completion, logging stderr and collecting stdout.
///
/// A non-zero exit becomes [`EncodingError::Failed`] carrying the last lines of stderr.
pub(crate) async fn run_tool(tool: &str, command: &mut Command) -> Result<ToolOutput, EncodingError> {
    let start = Instant::now();
    command.stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|source| EncodingError::Spawn {
        tool: tool.to_string(),
        source,
    })?;

    let mut stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let read_stdout = async {
        let mut buf = Vec::new();
        if let Some(out) = stdout.as_mut() {
            out.read_to_end(&mut buf).await?;
        }
        Ok::<_, std::io::Error>(buf)
    };

    let read_stderr = async {
        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        if let Some(err) = stderr {
            let mut lines = BufReader::new(err).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.to_lowercase().contains("error") {
                    warn!(tool, "stderr: {}", line);
                } else {
                    debug!(tool, "stderr: {}", line);
                }
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }
        tail
    };

    let (stdout, tail, status) = tokio::join!(read_stdout, read_stderr, child.wait());
    let status = status?;
    let stdout = stdout?;

    if !status.success() {
        return Err(EncodingError::Failed {
            tool: tool.to_string(),
            code: status.code(),
            stderr: tail.into_iter().collect::<Vec<_>>().join("\n"),
        });
    }

    Ok(ToolOutput {
        stdout,
        elapsed_secs: start.elapsed().as_secs_f64(),
    })
}
