//! Child processes for the sandbox and the language-model adapter.
//!
//! Every child gets a deadline, stdout/stderr are captured up to a byte
//! limit each, and stdout/stderr lines can be mirrored into per-command
//! stream files that `stream_logs` reads back.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Bytes read past the capture limit and discarded.
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn truncated(&self) -> bool {
        self.stdout_truncated + self.stderr_truncated > 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Stream files mirroring the child's output line by line.
#[derive(Debug, Clone, Default)]
pub struct TeePaths {
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
}

/// One captured stream.
#[derive(Debug, Default)]
struct Captured {
    kept: Vec<u8>,
    dropped: usize,
}

/// Spawn `cmd`, optionally feed it `stdin`, and wait at most `timeout`.
///
/// Both pipes are drained on reader threads (and stdin written on its own
/// thread) so a chatty child never blocks on a full pipe. A child that
/// outlives the deadline is killed and reported with `timed_out`.
#[instrument(skip_all, fields(timeout_ms = timeout.as_millis() as u64, limit = output_limit_bytes))]
pub fn run_command(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    tee: &TeePaths,
) -> Result<CommandOutput> {
    let stdin_mode = if stdin.is_some() { Stdio::piped() } else { Stdio::null() };
    cmd.stdin(stdin_mode).stdout(Stdio::piped()).stderr(Stdio::piped());
    let stdout_file = create_stream_file(tee.stdout.as_deref())?;
    let stderr_file = create_stream_file(tee.stderr.as_deref())?;

    let started = Instant::now();
    let mut child = cmd.spawn().context("spawn command")?;
    debug!(pid = child.id(), "child spawned");

    let writer = match stdin {
        Some(input) => Some(feed_stdin(&mut child, input.to_vec())?),
        None => None,
    };
    let stdout_reader = capture(child.stdout.take(), "stdout", output_limit_bytes, stdout_file)?;
    let stderr_reader = capture(child.stderr.take(), "stderr", output_limit_bytes, stderr_file)?;

    let (status, timed_out) = wait_or_kill(&mut child, timeout)?;
    let duration = started.elapsed();

    let out = join(stdout_reader).context("collect stdout")?;
    let err = join(stderr_reader).context("collect stderr")?;
    if let Some(writer) = writer
        && let Err(e) = join(writer)
    {
        // The child may exit without reading all of its input.
        debug!(err = %e, "stdin not fully written");
    }

    if out.dropped + err.dropped > 0 {
        warn!(stdout_dropped = out.dropped, stderr_dropped = err.dropped, "output over limit");
    }
    debug!(exit_code = ?status.code(), timed_out, ms = duration.as_millis() as u64, "child finished");
    Ok(CommandOutput {
        status,
        stdout: out.kept,
        stderr: err.kept,
        stdout_truncated: out.dropped,
        stderr_truncated: err.dropped,
        timed_out,
        duration,
    })
}

fn wait_or_kill(child: &mut Child, timeout: Duration) -> Result<(ExitStatus, bool)> {
    if let Some(status) = child.wait_timeout(timeout).context("wait for child")? {
        return Ok((status, false));
    }
    warn!(timeout_ms = timeout.as_millis() as u64, "deadline passed, killing child");
    child.kill().context("kill child")?;
    let status = child.wait().context("reap killed child")?;
    Ok((status, true))
}

fn feed_stdin(child: &mut Child, input: Vec<u8>) -> Result<JoinHandle<Result<()>>> {
    let mut pipe = child.stdin.take().ok_or_else(|| anyhow!("child stdin is not piped"))?;
    Ok(thread::spawn(move || {
        pipe.write_all(&input).context("write child stdin")?;
        Ok(())
    }))
}

fn capture<R: Read + Send + 'static>(
    pipe: Option<R>,
    name: &'static str,
    limit: usize,
    mirror: Option<BufWriter<File>>,
) -> Result<JoinHandle<Result<Captured>>> {
    let pipe = pipe.ok_or_else(|| anyhow!("child {name} is not piped"))?;
    Ok(thread::spawn(move || drain(pipe, limit, mirror)))
}

fn join<T>(handle: JoinHandle<Result<T>>) -> Result<T> {
    handle
        .join()
        .unwrap_or_else(|_| Err(anyhow!("pipe thread panicked")))
}

fn create_stream_file(path: Option<&Path>) -> Result<Option<BufWriter<File>>> {
    let Some(path) = path else {
        return Ok(None);
    };
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("create log dir {}", dir.display()))?;
    }
    let file = File::create(path).with_context(|| format!("create log file {}", path.display()))?;
    Ok(Some(BufWriter::new(file)))
}

/// Read `pipe` to the end, keeping the first `limit` bytes.
fn drain<R: Read>(pipe: R, limit: usize, mut mirror: Option<BufWriter<File>>) -> Result<Captured> {
    let mut reader = BufReader::new(pipe);
    let mut captured = Captured::default();
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).context("read child output")?;
        if n == 0 {
            break;
        }
        if let Some(file) = mirror.as_mut()
            && let Err(e) = file.write_all(&line).and_then(|()| file.flush())
        {
            warn!(err = %e, "stream file write failed; no longer mirroring");
            mirror = None;
        }
        let room = limit.saturating_sub(captured.kept.len()).min(n);
        captured.kept.extend_from_slice(&line[..room]);
        captured.dropped += n - room;
    }
    Ok(captured)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]);
        cmd
    }

    #[test]
    fn keeps_first_bytes_and_counts_the_rest() {
        let output = run_command(
            sh("printf 'abcdefgh\\n'; echo bad >&2; exit 4"),
            None,
            Duration::from_secs(10),
            3,
            &TeePaths::default(),
        )
        .expect("run");
        assert_eq!(output.status.code(), Some(4));
        assert_eq!(output.stdout_lossy(), "abc");
        assert_eq!(output.stdout_truncated, 6);
        assert_eq!(output.stderr_lossy(), "bad");
        assert_eq!(output.stderr_truncated, 1);
        assert!(output.truncated());
    }

    #[test]
    fn mirrors_stdout_and_passes_stdin() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("sandbox/0001.stdout.log");
        let tee = TeePaths {
            stdout: Some(log.clone()),
            stderr: None,
        };
        let output = run_command(sh("cat"), Some(b"one\ntwo\n"), Duration::from_secs(10), 1024, &tee)
            .expect("run");
        assert!(output.status.success());
        assert!(!output.timed_out);
        assert_eq!(output.stdout_lossy(), "one\ntwo\n");
        assert_eq!(fs::read_to_string(log).expect("read"), "one\ntwo\n");
    }

    #[test]
    fn deadline_kills_the_child() {
        let output = run_command(
            sh("sleep 5"),
            None,
            Duration::from_millis(100),
            1024,
            &TeePaths::default(),
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(!output.status.success());
        assert!(output.duration < Duration::from_secs(5));
    }
}
