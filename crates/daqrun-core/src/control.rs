// daqrun-core/src/control.rs
// Client for the babiconjson command channel
use daqrun_common::{
    event_count_from_reply, extract_reply, run_status_from_reply, scan_run_status,
    CommandErrorKind, CommandResult, ControlCommand, RunStatus,
};
use once_cell::sync::Lazy;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Timeout for ordinary commands.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Status reads must be quick; a slow reply is treated as unknown.
pub const STATUS_TIMEOUT: Duration = Duration::from_secs(3);

const READ_CHUNK: usize = 4096;

/// Bound on reaping the control binary once its output is collected.
const REAP_TIMEOUT: Duration = Duration::from_secs(1);

static HAS_STDBUF: Lazy<bool> = Lazy::new(|| stdbuf_on(std::env::var_os("PATH")));

/// The operations a capture session needs from the DAQ control process.
#[allow(async_fn_in_trait)]
pub trait ControlChannel {
    /// Current run status, `UNKNOWN` when it cannot be read
    async fn run_status(&self) -> RunStatus;

    /// Built-event counter, 0 when it cannot be read
    async fn event_built_number(&self) -> u64;

    /// Start the run in no-save or regular mode
    async fn start(&self, no_save: bool) -> CommandResult;

    /// Stop the run with the given ender tag
    async fn stop(&self, ender: &str) -> CommandResult;
}

/// Stateless client: every command runs `<binary> <host>` once, feeds the
/// command on stdin and reads the reply out of whatever the process prints.
#[derive(Debug, Clone)]
pub struct ControlClient {
    host: String,
    binary: PathBuf,
    use_stdbuf: bool,
}

impl ControlClient {
    pub fn new(host: impl Into<String>, binary: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            binary: binary.into(),
            use_stdbuf: *HAS_STDBUF,
        }
    }

    /// Toggle the `stdbuf -o0 -e0` wrapper that disables output buffering of
    /// the control binary. Enabled by default when `stdbuf` is on `PATH`.
    pub fn with_stdbuf(mut self, enabled: bool) -> Self {
        self.use_stdbuf = enabled;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Run one command and return the first JSON object in its output.
    pub async fn send_command(&self, command: &ControlCommand, timeout: Duration) -> CommandResult {
        match self.run_raw(command, timeout).await {
            Ok(merged) => extract_reply(&merged),
            Err(diagnostic) => CommandResult::error(CommandErrorKind::ProcessNotFound, diagnostic),
        }
    }

    /// Run one command and return stdout and stderr merged into one text.
    ///
    /// A timeout is not an error: the process is killed and whatever it
    /// printed so far is returned. `Err` carries a diagnostic when the
    /// control binary cannot be started at all.
    pub async fn run_raw(&self, command: &ControlCommand, timeout: Duration) -> Result<String, String> {
        let program = self.resolve_binary()?;

        let mut cmd = if self.use_stdbuf {
            let mut cmd = Command::new("stdbuf");
            cmd.args(["-o0", "-e0"]).arg(&program);
            cmd
        } else {
            Command::new(&program)
        };
        cmd.arg(&self.host)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group: a terminal Ctrl-C must not kill a command in flight
        #[cfg(unix)]
        cmd.process_group(0);

        let line = command.to_string();
        debug!("control command: {}", line);

        let mut child = cmd
            .spawn()
            .map_err(|e| format!("{}: {}", self.binary.display(), e))?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = format!("{}\n", line);
            if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                debug!("control binary closed stdin early: {}", e);
            }
        }

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => return Err(format!("{}: output pipes unavailable", self.binary.display())),
        };

        let deadline = Instant::now() + timeout;
        let (out, err, timed_out) = collect_until(stdout, stderr, deadline).await;

        if timed_out {
            warn!(
                "control command '{}' timed out after {:?}, using partial output",
                line, timeout
            );
            if let Err(e) = child.start_kill() {
                debug!("failed to kill control binary: {}", e);
            }
        }
        match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => debug!("control binary exited: {}", status),
            Ok(Err(e)) => debug!("failed to wait for control binary: {}", e),
            Err(_) => {
                warn!("control binary still running after its output closed, killing it");
                if let Err(e) = child.start_kill() {
                    debug!("failed to kill control binary: {}", e);
                }
            }
        }

        let merged = format!(
            "{}\n{}",
            String::from_utf8_lossy(&out),
            String::from_utf8_lossy(&err)
        );
        debug!("control reply: {}", merged.trim());
        Ok(merged)
    }

    /// Path of the control binary to run. Bare names are looked up on
    /// `PATH` so a missing command is reported the same way as a missing
    /// path, with or without the `stdbuf` wrapper.
    fn resolve_binary(&self) -> Result<PathBuf, String> {
        if self.binary.components().count() > 1 {
            if self.binary.exists() {
                Ok(self.binary.clone())
            } else {
                Err(format!("{}: not found", self.binary.display()))
            }
        } else {
            which::which(&self.binary).map_err(|e| format!("{}: {}", self.binary.display(), e))
        }
    }

    pub async fn start(&self, no_save: bool) -> CommandResult {
        self.send_command(&ControlCommand::Start { no_save }, DEFAULT_COMMAND_TIMEOUT)
            .await
    }

    pub async fn stop(&self, ender: &str) -> CommandResult {
        let command = ControlCommand::Stop {
            ender: ender.to_string(),
        };
        self.send_command(&command, DEFAULT_COMMAND_TIMEOUT).await
    }

    /// Built-event counter. Any failure reads as 0.
    pub async fn event_built_number(&self) -> u64 {
        let result = self
            .send_command(&ControlCommand::GetEventNumber, DEFAULT_COMMAND_TIMEOUT)
            .await;
        event_count_from_reply(&result)
    }

    /// Run status, normalized to uppercase.
    ///
    /// The raw output is probed for a `"runstatus":"..."` fragment first, so
    /// a reply that is readable but not valid JSON still yields a status.
    /// Otherwise the command is repeated and the parsed reply is searched
    /// under `runinfo` and then at the top level.
    pub async fn run_status(&self) -> RunStatus {
        if let Ok(raw) = self.run_raw(&ControlCommand::GetConfig, STATUS_TIMEOUT).await {
            if let Some(status) = scan_run_status(&raw) {
                return status;
            }
        }
        let result = self
            .send_command(&ControlCommand::GetConfig, STATUS_TIMEOUT)
            .await;
        run_status_from_reply(&result)
    }

    /// Poll the counter until it is above zero or `timeout` passes.
    /// Returns whether an event was seen and the last counter value.
    pub async fn wait_for_event(&self, timeout: Duration, poll: Duration) -> (bool, u64) {
        let deadline = Instant::now() + timeout;
        let mut last = 0;
        while Instant::now() < deadline {
            last = self.event_built_number().await;
            if last > 0 {
                return (true, last);
            }
            tokio::time::sleep(poll).await;
        }
        (false, last)
    }
}

impl ControlChannel for ControlClient {
    async fn run_status(&self) -> RunStatus {
        ControlClient::run_status(self).await
    }

    async fn event_built_number(&self) -> u64 {
        ControlClient::event_built_number(self).await
    }

    async fn start(&self, no_save: bool) -> CommandResult {
        ControlClient::start(self, no_save).await
    }

    async fn stop(&self, ender: &str) -> CommandResult {
        ControlClient::stop(self, ender).await
    }
}

/// Read both pipes until they close or the deadline passes.
async fn collect_until<O, E>(mut stdout: O, mut stderr: E, deadline: Instant) -> (Vec<u8>, Vec<u8>, bool)
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut out = Vec::new();
    let mut err = Vec::new();
    let mut out_chunk = [0u8; READ_CHUNK];
    let mut err_chunk = [0u8; READ_CHUNK];
    let mut out_open = true;
    let mut err_open = true;

    while out_open || err_open {
        tokio::select! {
            read = stdout.read(&mut out_chunk), if out_open => match read {
                Ok(0) | Err(_) => out_open = false,
                Ok(n) => out.extend_from_slice(&out_chunk[..n]),
            },
            read = stderr.read(&mut err_chunk), if err_open => match read {
                Ok(0) | Err(_) => err_open = false,
                Ok(n) => err.extend_from_slice(&err_chunk[..n]),
            },
            _ = tokio::time::sleep_until(deadline) => return (out, err, true),
        }
    }
    (out, err, false)
}

/// Whether an executable `stdbuf` exists on the given search path.
fn stdbuf_on<P: AsRef<OsStr>>(paths: Option<P>) -> bool {
    which::which_in("stdbuf", paths, "/").is_ok()
}
