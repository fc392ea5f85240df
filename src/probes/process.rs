//! Line-oriented external commands (`ping`, `traceroute`, `netstat`).
//!
//! The child's stdout and stderr are read to completion as one merged
//! stream of lines. No input is ever written to the child.

use crate::errors::{MonitorError, Result};
use log::debug;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// Run `program` and hand every output line to `on_line`.
///
/// Reading stops at EOF of both streams. When `deadline` elapses first the
/// child is killed and a timeout error is returned.
pub async fn run_lines<F>(
    program: &str,
    args: &[&str],
    deadline: Duration,
    mut on_line: F,
) -> Result<ExitStatus>
where
    F: FnMut(&str),
{
    debug!("Spawning {} {}", program, args.join(" "));

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| MonitorError::process(format!("cannot launch {}", program), e))?;

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take())
    else {
        return Err(MonitorError::new(
            crate::errors::ErrorKind::Process,
            format!("{}: output streams unavailable", program),
        ));
    };

    let mut stdout = BufReader::new(stdout);
    let mut stderr = BufReader::new(stderr);
    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();

    let read_all = async {
        let mut stdout_open = true;
        let mut stderr_open = true;

        // Partial reads stay in the buffer when the other branch wins
        while stdout_open || stderr_open {
            tokio::select! {
                read = stdout.read_until(b'\n', &mut stdout_buf), if stdout_open => match read {
                    Ok(0) => stdout_open = false,
                    Ok(_) => emit_line(&mut stdout_buf, &mut on_line),
                    Err(e) => {
                        debug!("{} stdout closed: {}", program, e);
                        stdout_open = false;
                    }
                },
                read = stderr.read_until(b'\n', &mut stderr_buf), if stderr_open => match read {
                    Ok(0) => stderr_open = false,
                    Ok(_) => emit_line(&mut stderr_buf, &mut on_line),
                    Err(e) => {
                        debug!("{} stderr closed: {}", program, e);
                        stderr_open = false;
                    }
                },
            }
        }

        child.wait().await
    };

    match tokio::time::timeout(deadline, read_all).await {
        Ok(status) => status
            .map_err(|e| MonitorError::io(format!("waiting for {}", program), e)),
        Err(_) => Err(MonitorError::timeout(format!(
            "{} did not finish within {:?}",
            program, deadline
        ))),
    }
}

/// Decode one buffered line, replacing bytes that are not UTF-8.
fn emit_line<F: FnMut(&str)>(buf: &mut Vec<u8>, on_line: &mut F) {
    {
        let text = String::from_utf8_lossy(buf);
        on_line(text.trim_end_matches(['\n', '\r']));
    }
    buf.clear();
}

/// Run `program` and collect its merged output.
pub async fn capture_lines(
    program: &str,
    args: &[&str],
    deadline: Duration,
) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    run_lines(program, args, deadline, |line| lines.push(line.to_string())).await?;
    Ok(lines)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[tokio::test]
    async fn test_capture_merges_stdout_and_stderr() {
        let lines = capture_lines(
            "sh",
            &["-c", "echo out; echo err 1>&2"],
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(lines.len(), 2);
        assert!(lines.contains(&"out".to_string()));
        assert!(lines.contains(&"err".to_string()));
    }

    #[tokio::test]
    async fn test_non_utf8_line_does_not_end_stream() {
        let lines = capture_lines(
            "sh",
            &["-c", "printf 'V\\341lasz\\n'; echo after"],
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(lines, vec!["V\u{FFFD}lasz".to_string(), "after".to_string()]);
    }

    #[tokio::test]
    async fn test_last_line_without_newline_is_kept() {
        let lines = capture_lines("sh", &["-c", "printf 'a\\r\\nb'"], Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(lines, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_program_is_process_error() {
        let err = capture_lines(
            "netpulse-definitely-not-a-command",
            &[],
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Process);
    }

    #[tokio::test]
    async fn test_deadline_kills_child() {
        let err = capture_lines("sleep", &["5"], Duration::from_millis(100))
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Timeout);
    }
}
