// daqrun-core/src/capture.rs
// Lifecycle of the external capture (analyzer) process
use daqrun_common::RunConfig;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// Program and arguments used to launch the capture process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CaptureCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Analyzer in online batch mode with the configured event limit, host
    /// and output file.
    pub fn analyzer(config: &RunConfig) -> Self {
        Self::new(&config.capture_binary, config.capture_args())
    }
}

impl fmt::Display for CaptureCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Signal used to ask the capture process to exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGINT, what a terminal Ctrl-C delivers; lets the analyzer close its
    /// output file
    Interrupt,
    /// SIGTERM
    Terminate,
}

#[cfg(unix)]
impl StopSignal {
    fn as_raw(&self) -> libc::c_int {
        match self {
            StopSignal::Interrupt => libc::SIGINT,
            StopSignal::Terminate => libc::SIGTERM,
        }
    }
}

/// Handle to the running capture process.
///
/// The handle owns the child for the whole session. Once an exit has been
/// observed the process is never signalled again. Dropping the handle kills a
/// process that is still running.
pub struct CaptureProcess {
    child: Child,
    pid: Option<u32>,
    exit_code: Option<i32>,
}

impl CaptureProcess {
    /// Spawn the capture process with inherited stdio.
    pub fn spawn(command: &CaptureCommand) -> std::io::Result<Self> {
        let child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let pid = child.id();
        info!("analyzer started (pid {:?})", pid);
        Ok(Self {
            child,
            pid,
            exit_code: None,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit code if the process has already exited, without blocking.
    pub fn try_exit_code(&mut self) -> Option<i32> {
        if self.exit_code.is_some() {
            return self.exit_code;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => Some(self.record_exit(status)),
            Ok(None) => None,
            Err(e) => {
                warn!("failed to poll analyzer status: {}", e);
                None
            }
        }
    }

    /// Block until the process exits on its own.
    pub async fn wait(&mut self) -> std::io::Result<i32> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        let status = self.child.wait().await?;
        Ok(self.record_exit(status))
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL.
    pub async fn terminate(&mut self, grace: Duration) -> Option<i32> {
        self.shutdown(StopSignal::Terminate, grace).await
    }

    /// SIGINT, wait up to `grace`, then SIGKILL.
    pub async fn interrupt(&mut self, grace: Duration) -> Option<i32> {
        self.shutdown(StopSignal::Interrupt, grace).await
    }

    /// Ask the process to exit with `signal`, escalating to a kill when it is
    /// still running after `grace`. Returns the exit code when one was
    /// observed.
    pub async fn shutdown(&mut self, signal: StopSignal, grace: Duration) -> Option<i32> {
        if let Some(code) = self.try_exit_code() {
            debug!("analyzer already exited with code {}", code);
            return Some(code);
        }

        self.send_signal(signal);
        if let Ok(Ok(status)) = tokio::time::timeout(grace, self.child.wait()).await {
            return Some(self.record_exit(status));
        }

        warn!(
            "analyzer did not exit within {:?} after {:?}, killing it",
            grace, signal
        );
        if let Err(e) = self.child.start_kill() {
            error!("failed to kill analyzer: {}", e);
        }
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => Some(self.record_exit(status)),
            Ok(Err(e)) => {
                error!("failed to reap analyzer: {}", e);
                None
            }
            Err(_) => {
                error!("analyzer still running after kill");
                None
            }
        }
    }

    #[cfg(unix)]
    fn send_signal(&mut self, signal: StopSignal) {
        let Some(pid) = self.pid else {
            return;
        };
        let result = unsafe { libc::kill(pid as libc::pid_t, signal.as_raw()) };
        if result == 0 {
            debug!("sent {:?} to analyzer (pid {})", signal, pid);
        } else {
            warn!(
                "failed to signal analyzer (pid {}): {}",
                pid,
                std::io::Error::last_os_error()
            );
        }
    }

    #[cfg(not(unix))]
    fn send_signal(&mut self, _signal: StopSignal) {
        let _ = self.child.start_kill();
    }

    fn record_exit(&mut self, status: ExitStatus) -> i32 {
        let code = exit_code_of(status);
        self.exit_code = Some(code);
        code
    }
}

/// Exit code of a finished process; death by signal N reads as 128 + N.
#[cfg(unix)]
fn exit_code_of(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}
