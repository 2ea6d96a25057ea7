//! Runs the external database tools and captures their diagnostic stream.

use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// Number of trailing stderr lines kept for error reports.
const STDERR_TAIL_LINES: usize = 20;

/// Result of running an external tool to completion.
#[derive(Debug)]
pub struct ToolOutput {
    pub status: ExitStatus,
    /// Last lines the tool wrote to stderr.
    pub stderr_tail: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }
}

/// Run `program` with `args`, streaming stderr into the debug log.
///
/// The tool's exit status is the only success signal; stderr content is
/// informational (mongodump and mongorestore report progress there).
pub async fn run_tool(program: &str, args: &[String]) -> std::io::Result<ToolOutput> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "stderr was not captured"))?;

    let mut reader = BufReader::new(stderr);
    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buf).trim_end().to_string();
        if line.is_empty() {
            continue;
        }
        tracing::debug!(tool = program, "{}", line);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    let status = child.wait().await?;
    Ok(ToolOutput {
        status,
        stderr_tail: Vec::from(tail).join("\n"),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_tool_success_with_stderr_noise() {
        let args = vec!["-c".to_string(), "echo 'writing things' >&2; exit 0".to_string()];
        let output = run_tool("sh", &args).await.unwrap();
        assert!(output.success());
        assert_eq!(output.stderr_tail, "writing things");
    }

    #[tokio::test]
    async fn test_run_tool_reports_exit_code_and_tail() {
        let args = vec![
            "-c".to_string(),
            "for i in $(seq 1 30); do echo line$i >&2; done; exit 3".to_string(),
        ];
        let output = run_tool("sh", &args).await.unwrap();
        assert!(!output.success());
        assert_eq!(output.exit_code(), Some(3));
        let lines: Vec<&str> = output.stderr_tail.lines().collect();
        assert_eq!(lines.len(), STDERR_TAIL_LINES);
        assert_eq!(lines.last(), Some(&"line30"));
        assert_eq!(lines.first(), Some(&"line11"));
    }

    #[tokio::test]
    async fn test_run_tool_missing_program() {
        let result = run_tool("/nonexistent/tool-that-does-not-exist", &[]).await;
        assert!(result.is_err());
    }
}
