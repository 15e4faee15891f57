use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};
use wait_timeout::ChildExt;

use crate::error::Result;

/// Grace window between the polite signal and the hard kill.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Captured outcome of one verification-command run.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: i32,
    pub duration: Duration,
    /// Trailing bytes of the combined stdout/stderr stream, bounded by the
    /// configured budget. Earlier bytes are discarded while draining.
    pub tail: String,
    pub timed_out: bool,
}

impl CommandResult {
    pub fn ok(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

/// Run *cmd* through `sh -c` under *cwd* with a hard wall-clock timeout.
/// The child gets its own process group so a timeout can take down the whole
/// tree: SIGTERM, a short grace, then SIGKILL. The runner never interprets
/// the command's content.
pub fn run(cmd: &str, cwd: &Path, timeout: Duration, tail_budget: usize) -> Result<CommandResult> {
    info!("running command: {cmd}");
    let started = Instant::now();

    let mut command = Command::new("sh");
    command
        .args(["-c", cmd])
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let mut child = command.spawn()?;
    let pid = child.id();

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_handle = thread::spawn(move || read_tail(stdout, tail_budget));
    let stderr_handle = thread::spawn(move || read_tail(stderr, tail_budget));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout)? {
        Some(status) => status,
        None => {
            timed_out = true;
            warn!("command exceeded {}s, signalling process group", timeout.as_secs());
            terminate_group(pid, &mut child)?;
            child.wait()?
        }
    };

    let stdout_tail = stdout_handle.join().unwrap_or_default();
    let stderr_tail = stderr_handle.join().unwrap_or_default();

    let mut combined = stdout_tail;
    combined.extend_from_slice(&stderr_tail);
    if combined.len() > tail_budget {
        let cut = combined.len() - tail_budget;
        combined.drain(..cut);
    }

    let exit_code = if timed_out {
        124
    } else {
        status.code().unwrap_or(-1)
    };

    let result = CommandResult {
        exit_code,
        duration: started.elapsed(),
        tail: String::from_utf8_lossy(&combined).into_owned(),
        timed_out,
    };
    info!(
        "command finished: exit={} timed_out={} in {:.1}s",
        result.exit_code,
        result.timed_out,
        result.duration.as_secs_f64()
    );
    Ok(result)
}

/// Drain a pipe to EOF keeping only the last *limit* bytes.
fn read_tail<R: Read>(reader: Option<R>, limit: usize) -> Vec<u8> {
    let Some(mut reader) = reader else {
        return Vec::new();
    };
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];

    while let Ok(n) = reader.read(&mut chunk) {
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > limit {
            let cut = buf.len() - limit;
            buf.drain(..cut);
        }
    }
    buf
}

#[cfg(unix)]
fn terminate_group(pid: u32, child: &mut std::process::Child) -> Result<()> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let group = Pid::from_raw(pid as i32);
    let _ = killpg(group, Signal::SIGTERM);

    if child.wait_timeout(KILL_GRACE)?.is_none() {
        warn!("process group ignored SIGTERM, sending SIGKILL");
        let _ = killpg(group, Signal::SIGKILL);
    }
    Ok(())
}

#[cfg(not(unix))]
fn terminate_group(_pid: u32, child: &mut std::process::Child) -> Result<()> {
    let _ = child.kill();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_exit_code_and_output() {
        let dir = tempfile::tempdir().unwrap();
        let result = run(
            "echo out; echo err >&2; exit 3",
            dir.path(),
            Duration::from_secs(10),
            4096,
        )
        .unwrap();

        assert_eq!(result.exit_code, 3);
        assert!(!result.timed_out);
        assert!(result.tail.contains("out"));
        assert!(result.tail.contains("err"));
    }

    #[test]
    fn success_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let result = run("true", dir.path(), Duration::from_secs(10), 4096).unwrap();
        assert!(result.ok());
        assert_eq!(result.exit_code, 0);
    }

    #[test]
    fn tail_is_bounded_and_keeps_the_end() {
        let dir = tempfile::tempdir().unwrap();
        let result = run(
            "seq 1 5000",
            dir.path(),
            Duration::from_secs(30),
            512,
        )
        .unwrap();

        assert!(result.tail.len() <= 512);
        assert!(result.tail.contains("5000"));
        assert!(!result.tail.contains("\n1\n"));
    }

    #[test]
    fn timeout_kills_within_grace() {
        let dir = tempfile::tempdir().unwrap();
        let started = Instant::now();
        let result = run(
            "sleep 30",
            dir.path(),
            Duration::from_millis(300),
            4096,
        )
        .unwrap();

        assert!(result.timed_out);
        assert!(!result.ok());
        assert_eq!(result.exit_code, 124);
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
