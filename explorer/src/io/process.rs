//! Helpers for running child processes (adb, oracle and vision commands) with
//! timeouts and bounded output.

use std::io::{self, Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    /// Turn timeouts and non-zero exits into errors labelled with `label`.
    pub fn into_success(self, label: &str, timeout: Duration) -> Result<Self> {
        if self.timed_out {
            warn!(label, timeout_secs = timeout.as_secs(), "command timed out");
            return Err(anyhow!("{label} timed out after {timeout:?}"));
        }
        if !self.status.success() {
            warn!(label, exit_code = ?self.status.code(), "command failed");
            return Err(anyhow!(
                "{label} failed with status {:?}: {}",
                self.status.code(),
                self.stderr_text()
            ));
        }
        Ok(self)
    }
}

/// Run `cmd` to completion or until `timeout`, capturing at most
/// `output_limit_bytes` of each output stream.
///
/// Both pipes are drained on reader threads for the whole lifetime of the
/// child; bytes past the limit are counted and discarded.
#[instrument(skip_all, fields(program = ?cmd.get_program(), timeout_secs = timeout.as_secs()))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|err| {
        error!(err = %err, "failed to spawn command");
        anyhow!(err).context(format!("spawn {:?}", cmd.get_program()))
    })?;
    debug!(pid = child.id(), "child spawned");

    let stdout = spawn_reader(child.stdout.take(), "stdout", output_limit_bytes)?;
    let stderr = spawn_reader(child.stderr.take(), "stderr", output_limit_bytes)?;

    if let Some(input) = stdin {
        let mut pipe = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        // The child may exit without consuming everything.
        if let Err(err) = pipe.write_all(input) {
            warn!(err = %err, bytes = input.len(), "stdin not fully written");
        }
    }

    let timed_out = child
        .wait_timeout(timeout)
        .context("wait for command")?
        .is_none();
    if timed_out {
        warn!("command timed out, killing");
        child.kill().context("kill command")?;
    }
    let status = child.wait().context("reap command")?;

    let stdout = join_reader(stdout, "stdout")?;
    let stderr = join_reader(stderr, "stderr")?;
    if stdout.dropped > 0 || stderr.dropped > 0 {
        warn!(
            stdout_dropped = stdout.dropped,
            stderr_dropped = stderr.dropped,
            "output over limit"
        );
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout: stdout.bytes,
        stderr: stderr.bytes,
        stdout_truncated: stdout.dropped,
        stderr_truncated: stderr.dropped,
        timed_out,
    })
}

/// Build a [`Command`] from an argv-style vector.
pub fn command_from_argv(argv: &[String]) -> Result<Command> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("command must be a non-empty array"))?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    Ok(cmd)
}

/// Bytes kept from one stream and the count discarded past the limit.
#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    dropped: usize,
}

type Reader = JoinHandle<Result<Captured>>;

fn spawn_reader<R>(stream: Option<R>, name: &str, limit: usize) -> Result<Reader>
where
    R: Read + Send + 'static,
{
    let stream = stream.ok_or_else(|| anyhow!("{name} was not piped"))?;
    Ok(thread::spawn(move || drain_limited(stream, limit)))
}

fn join_reader(handle: Reader, name: &str) -> Result<Captured> {
    handle
        .join()
        .map_err(|_| anyhow!("{name} reader thread panicked"))?
        .with_context(|| format!("read {name}"))
}

fn drain_limited<R: Read>(mut reader: R, limit: usize) -> Result<Captured> {
    let mut captured = Captured::default();
    (&mut reader)
        .take(limit as u64)
        .read_to_end(&mut captured.bytes)
        .context("read output")?;
    let dropped = io::copy(&mut reader, &mut io::sink()).context("drain output")?;
    captured.dropped = usize::try_from(dropped).unwrap_or(usize::MAX);
    Ok(captured)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_stdout_and_pipes_stdin() {
        let output = run_command_with_timeout(
            sh("cat; echo done"),
            Some(b"hello\n"),
            Duration::from_secs(5),
            1024,
        )
        .expect("run");
        assert!(output.status.success());
        assert_eq!(output.stdout_text(), "hello\ndone\n");
    }

    #[test]
    fn truncates_output_beyond_limit() {
        let output =
            run_command_with_timeout(sh("printf 0123456789"), None, Duration::from_secs(5), 4)
                .expect("run");
        assert_eq!(output.stdout, b"0123");
        assert_eq!(output.stdout_truncated, 6);
    }

    #[test]
    fn kills_on_timeout() {
        let output =
            run_command_with_timeout(sh("sleep 5"), None, Duration::from_millis(100), 1024)
                .expect("run");
        assert!(output.timed_out);
        let err = output
            .into_success("sleeper", Duration::from_millis(100))
            .unwrap_err();
        assert!(err.to_string().contains("sleeper timed out"));
    }

    #[test]
    fn non_zero_exit_is_an_error_with_stderr() {
        let output = run_command_with_timeout(
            sh("echo broken >&2; exit 3"),
            None,
            Duration::from_secs(5),
            1024,
        )
        .expect("run");
        let err = output
            .into_success("adb", Duration::from_secs(5))
            .unwrap_err();
        assert!(err.to_string().contains("Some(3)"));
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn drain_counts_bytes_past_the_limit() {
        let captured = drain_limited(&b"abcdef"[..], 0).expect("drain");
        assert!(captured.bytes.is_empty());
        assert_eq!(captured.dropped, 6);
    }

    #[test]
    fn empty_argv_is_rejected() {
        assert!(command_from_argv(&[]).is_err());
    }
}
