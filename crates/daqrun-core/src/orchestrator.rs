// daqrun-core/src/orchestrator.rs
// One capture session: preflight, analyzer spawn, DAQ start, trigger wait,
// completion wait and the final stop
use daqrun_common::{
    AbortReason, FailureReason, RunConfig, RunStatus, SessionOutcome, SessionReport,
};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::capture::{CaptureCommand, CaptureProcess};
use crate::control::ControlChannel;
use crate::interrupt::Interrupt;

/// How the trigger wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TriggerWait {
    Triggered,
    CaptureExited(i32),
    TimedOut,
    Interrupted,
}

/// Counter values seen while waiting for the trigger
#[derive(Debug, Clone, Copy)]
struct Progress {
    baseline: u64,
    last: u64,
    triggered: bool,
}

/// Drives one capture session against a control channel.
pub struct Orchestrator<C> {
    /// Session configuration
    config: RunConfig,
    /// DAQ control channel
    control: C,
    /// Capture process command line
    capture: CaptureCommand,
    /// External interrupt latch
    interrupt: Interrupt,
}

impl<C: ControlChannel> Orchestrator<C> {
    /// Create an orchestrator that launches the configured analyzer
    pub fn new(config: RunConfig, control: C, interrupt: Interrupt) -> Self {
        let capture = CaptureCommand::analyzer(&config);
        Self {
            config,
            control,
            capture,
            interrupt,
        }
    }

    /// Launch `capture` instead of the configured analyzer
    pub fn with_capture_command(mut self, capture: CaptureCommand) -> Self {
        self.capture = capture;
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Run the session to a terminal state.
    ///
    /// Once the start command has been accepted, every exit path sends the
    /// stop command (unless `no_stop` is set) and never leaves the analyzer
    /// running.
    pub async fn run(&self) -> SessionReport {
        // Preflight
        let run_status = self.control.run_status().await;
        let baseline = self.control.event_built_number().await;
        info!(
            "precheck runstatus={}, eventbuiltnumber={}",
            run_status, baseline
        );
        let mut progress = Progress {
            baseline,
            last: baseline,
            triggered: false,
        };

        if !run_status.is_idle() && !self.config.force_if_active {
            warn!("DAQ already active. Abort for safety (use --force-if-active to override).");
            let outcome = SessionOutcome::Aborted(AbortReason::DaqActive(run_status.clone()));
            return self.finish(run_status, progress, outcome);
        }
        if self.interrupt.is_set() {
            return self.finish(
                run_status,
                progress,
                SessionOutcome::Aborted(AbortReason::Interrupted),
            );
        }

        // Spawn the analyzer first so it is ready when data starts flowing
        info!("starting analyzer: {}", self.capture);
        let mut capture = match CaptureProcess::spawn(&self.capture) {
            Ok(capture) => capture,
            Err(e) => {
                error!("failed to start analyzer: {}", e);
                let outcome = SessionOutcome::Failed(FailureReason::SpawnFailed(e.to_string()));
                return self.finish(run_status, progress, outcome);
            }
        };

        if self.pause(self.config.settle_delay).await {
            capture.interrupt(self.config.kill_grace).await;
            return self.finish(
                run_status,
                progress,
                SessionOutcome::Aborted(AbortReason::Interrupted),
            );
        }

        // Start the run
        let started = self.control.start(self.config.start_mode.is_no_save()).await;
        if self.interrupt.is_set() {
            // The DAQ may have applied the start before the interrupt landed
            let outcome = self.abort_interrupted(&mut capture).await;
            return self.finish(run_status, progress, outcome);
        }
        if started.is_error() {
            error!("start returned error: {}", started);
            capture.terminate(self.config.kill_grace).await;
            let outcome = SessionOutcome::Failed(FailureReason::StartRejected(started.to_string()));
            return self.finish(run_status, progress, outcome);
        }
        info!("start sent ({})", self.config.start_mode);

        // Wait for the first trigger
        let outcome = match self.wait_for_trigger(&mut capture, &mut progress).await {
            TriggerWait::Triggered => {
                info!("trigger detected: {} -> {}", progress.baseline, progress.last);
                self.wait_for_completion(&mut capture).await
            }
            TriggerWait::CaptureExited(code) => {
                warn!("analyzer exited early with code {} before trigger", code);
                self.send_stop().await;
                SessionOutcome::Failed(FailureReason::EarlyExit(code))
            }
            TriggerWait::TimedOut => {
                warn!(
                    "timeout waiting trigger ({:?})",
                    self.config.trigger_timeout
                );
                capture.terminate(self.config.kill_grace).await;
                self.send_stop().await;
                SessionOutcome::TimedOut
            }
            TriggerWait::Interrupted => self.abort_interrupted(&mut capture).await,
        };

        self.finish(run_status, progress, outcome)
    }

    /// Poll until the counter moves past the preflight baseline, the
    /// analyzer exits, the deadline passes or an interrupt arrives.
    async fn wait_for_trigger(
        &self,
        capture: &mut CaptureProcess,
        progress: &mut Progress,
    ) -> TriggerWait {
        let deadline = Instant::now() + self.config.trigger_timeout;

        while Instant::now() < deadline {
            if self.interrupt.is_set() {
                return TriggerWait::Interrupted;
            }
            if let Some(code) = capture.try_exit_code() {
                return TriggerWait::CaptureExited(code);
            }

            let current = self.control.event_built_number().await;
            if current != progress.last {
                info!("eventbuiltnumber={}", current);
                progress.last = current;
            }
            if current > progress.baseline {
                progress.triggered = true;
                return TriggerWait::Triggered;
            }

            if self.pause(self.config.trigger_poll).await {
                return TriggerWait::Interrupted;
            }
        }

        if self.interrupt.is_set() {
            TriggerWait::Interrupted
        } else {
            TriggerWait::TimedOut
        }
    }

    /// Wait for the analyzer to reach its event limit and exit, then stop
    /// the run. No timeout: once triggered the analyzer bounds itself.
    async fn wait_for_completion(&self, capture: &mut CaptureProcess) -> SessionOutcome {
        info!(
            "waiting analyzer completion (maxevt={})",
            self.config.max_events
        );

        let exited = tokio::select! {
            exited = capture.wait() => Some(exited),
            _ = self.interrupt.fired() => None,
        };

        let outcome = match exited {
            None => return self.abort_interrupted(capture).await,
            Some(Ok(0)) => {
                info!("analyzer exited with code 0");
                SessionOutcome::Completed
            }
            Some(Ok(code)) => {
                info!("analyzer exited with code {}", code);
                SessionOutcome::Failed(FailureReason::CaptureFailed(code))
            }
            Some(Err(e)) => {
                error!("failed to wait for analyzer: {}", e);
                SessionOutcome::Failed(FailureReason::CaptureLost(e.to_string()))
            }
        };

        self.send_stop().await;
        outcome
    }

    /// Interrupt path: ask the analyzer to finish, kill it if it lingers,
    /// and still stop the run.
    async fn abort_interrupted(&self, capture: &mut CaptureProcess) -> SessionOutcome {
        warn!("interrupted: terminating analyzer");
        capture.interrupt(self.config.kill_grace).await;
        self.send_stop().await;
        SessionOutcome::Aborted(AbortReason::Interrupted)
    }

    /// Send the stop command unless suppressed. A failed stop is reported
    /// but does not change the outcome.
    async fn send_stop(&self) {
        if self.config.no_stop {
            return;
        }
        let stopped = self.control.stop(&self.config.ender).await;
        if stopped.is_error() {
            warn!("stop returned error: {}", stopped);
        } else {
            info!("stop sent");
        }
    }

    /// Sleep for `duration`; returns true if the interrupt fired first.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.interrupt.is_set(),
            _ = self.interrupt.fired() => true,
        }
    }

    fn finish(
        &self,
        run_status: RunStatus,
        progress: Progress,
        outcome: SessionOutcome,
    ) -> SessionReport {
        info!("session finished: {} (exit code {})", outcome, outcome.exit_code());
        SessionReport {
            run_status,
            baseline: progress.baseline,
            last_event_count: progress.last,
            triggered: progress.triggered,
            outcome,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::interrupt::InterruptTrigger;
    use daqrun_common::{CommandErrorKind, CommandResult};
    use serde_json::{Map, Value};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Scripted control channel that records every command it receives
    struct FakeControl {
        status: RunStatus,
        counters: Mutex<VecDeque<u64>>,
        last_counter: Mutex<u64>,
        start_reply: CommandResult,
        interrupt_on_start: Option<InterruptTrigger>,
        commands: Mutex<Vec<String>>,
    }

    impl FakeControl {
        fn new(status: &str, counters: &[u64]) -> Self {
            Self {
                status: RunStatus::new(status),
                counters: Mutex::new(counters.iter().copied().collect()),
                last_counter: Mutex::new(0),
                start_reply: ok_reply(),
                interrupt_on_start: None,
                commands: Mutex::new(Vec::new()),
            }
        }

        fn rejecting_start(mut self) -> Self {
            self.start_reply =
                CommandResult::error(CommandErrorKind::NoJsonResponse, "babicon: busy");
            self
        }

        /// Fire `trigger` while the start command is in flight
        fn interrupting_start(mut self, trigger: InterruptTrigger) -> Self {
            self.interrupt_on_start = Some(trigger);
            self
        }

        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }

        fn count(&self, prefix: &str) -> usize {
            self.commands()
                .iter()
                .filter(|c| c.starts_with(prefix))
                .count()
        }

        fn record(&self, command: String) {
            self.commands.lock().unwrap().push(command);
        }
    }

    fn ok_reply() -> CommandResult {
        let mut map = Map::new();
        map.insert("ok".to_string(), Value::Bool(true));
        CommandResult::Reply(map)
    }

    impl ControlChannel for &FakeControl {
        async fn run_status(&self) -> RunStatus {
            self.record("getconfig".to_string());
            self.status.clone()
        }

        async fn event_built_number(&self) -> u64 {
            self.record("getevtnumber".to_string());
            let next = self.counters.lock().unwrap().pop_front();
            let mut last = self.last_counter.lock().unwrap();
            if let Some(value) = next {
                *last = value;
            }
            *last
        }

        async fn start(&self, no_save: bool) -> CommandResult {
            self.record(if no_save { "nssta" } else { "start" }.to_string());
            if let Some(trigger) = &self.interrupt_on_start {
                trigger.fire();
            }
            self.start_reply.clone()
        }

        async fn stop(&self, ender: &str) -> CommandResult {
            self.record(format!("stop {}", ender));
            ok_reply()
        }
    }

    fn test_config() -> RunConfig {
        RunConfig {
            trigger_timeout: Duration::from_secs(1),
            trigger_poll: Duration::from_millis(100),
            settle_delay: Duration::from_millis(50),
            kill_grace: Duration::from_secs(1),
            ender: "unit_test".to_string(),
            ..RunConfig::default()
        }
    }

    fn sh(script: &str) -> CaptureCommand {
        CaptureCommand::new("/bin/sh", vec!["-c".to_string(), script.to_string()])
    }

    fn orchestrator<'a>(
        config: RunConfig,
        control: &'a FakeControl,
        capture: CaptureCommand,
    ) -> Orchestrator<&'a FakeControl> {
        Orchestrator::new(config, control, Interrupt::never()).with_capture_command(capture)
    }

    #[tokio::test]
    async fn test_active_daq_aborts_without_spawning() {
        let temp_dir = TempDir::new().unwrap();
        let marker = temp_dir.path().join("spawned");
        let control = FakeControl::new("ACTIVE", &[5]);
        let capture = sh(&format!("touch {}", marker.display()));

        let report = orchestrator(test_config(), &control, capture).run().await;

        assert_eq!(report.exit_code(), 3);
        assert!(matches!(
            report.outcome,
            SessionOutcome::Aborted(AbortReason::DaqActive(_))
        ));
        assert_eq!(control.commands(), vec!["getconfig", "getevtnumber"]);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_force_if_active_proceeds() {
        let control = FakeControl::new("ACTIVE", &[5, 6]);
        let config = RunConfig {
            force_if_active: true,
            ..test_config()
        };

        let report = orchestrator(config, &control, sh("sleep 0.3")).run().await;

        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.run_status.as_str(), "ACTIVE");
        assert_eq!(control.count("nssta"), 1);
    }

    #[tokio::test]
    async fn test_trigger_detected_then_completion() {
        let control = FakeControl::new("IDLE", &[5, 5, 5, 6]);

        let report = orchestrator(test_config(), &control, sh("sleep 0.5"))
            .run()
            .await;

        assert_eq!(report.outcome, SessionOutcome::Completed);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.baseline, 5);
        assert_eq!(report.last_event_count, 6);
        assert!(report.triggered);
        assert_eq!(control.count("stop unit_test"), 1);
        assert_eq!(control.count("nssta"), 1);
    }

    #[tokio::test]
    async fn test_save_mode_sends_start() {
        let control = FakeControl::new("IDLE", &[0, 1]);
        let config = RunConfig {
            start_mode: daqrun_common::StartMode::Save,
            ..test_config()
        };

        orchestrator(config, &control, sh("exit 0")).run().await;

        assert_eq!(control.count("start"), 1);
        assert_eq!(control.count("nssta"), 0);
    }

    #[tokio::test]
    async fn test_capture_failure_after_trigger_is_propagated() {
        let control = FakeControl::new("IDLE", &[5, 6]);

        let report = orchestrator(test_config(), &control, sh("sleep 0.3; exit 3"))
            .run()
            .await;

        assert_eq!(report.exit_code(), 3);
        assert_eq!(
            report.outcome,
            SessionOutcome::Failed(FailureReason::CaptureFailed(3))
        );
        assert_eq!(control.count("stop"), 1);
    }

    #[tokio::test]
    async fn test_early_exit_propagates_code_and_stops() {
        let control = FakeControl::new("IDLE", &[5]);

        let report = orchestrator(test_config(), &control, sh("exit 7"))
            .run()
            .await;

        assert_eq!(report.exit_code(), 7);
        assert!(!report.triggered);
        assert_eq!(control.count("stop unit_test"), 1);
    }

    #[tokio::test]
    async fn test_early_exit_with_zero_maps_to_five() {
        let control = FakeControl::new("IDLE", &[5]);
        let config = RunConfig {
            no_stop: true,
            ..test_config()
        };

        let report = orchestrator(config, &control, sh("exit 0")).run().await;

        assert_eq!(report.exit_code(), 5);
        assert_eq!(control.count("stop"), 0);
    }

    #[tokio::test]
    async fn test_trigger_timeout() {
        let control = FakeControl::new("IDLE", &[5]);
        let config = RunConfig {
            trigger_timeout: Duration::from_millis(400),
            trigger_poll: Duration::from_millis(50),
            ..test_config()
        };

        let report = orchestrator(config, &control, sh("exec sleep 30"))
            .run()
            .await;

        assert_eq!(report.outcome, SessionOutcome::TimedOut);
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.last_event_count, 5);
        assert_eq!(control.count("stop unit_test"), 1);
    }

    #[tokio::test]
    async fn test_start_rejected_terminates_capture_without_stop() {
        let control = FakeControl::new("IDLE", &[5]).rejecting_start();

        let started = std::time::Instant::now();
        let report = orchestrator(test_config(), &control, sh("exec sleep 30"))
            .run()
            .await;

        assert_eq!(report.exit_code(), 4);
        assert_eq!(control.count("stop"), 0);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_spawn_failure_sends_no_commands() {
        let control = FakeControl::new("IDLE", &[5]);
        let capture = CaptureCommand::new("/nonexistent/rfsoc_ridf_analyzer", vec![]);

        let report = orchestrator(test_config(), &control, capture).run().await;

        assert_eq!(report.exit_code(), 2);
        assert_eq!(control.commands(), vec!["getconfig", "getevtnumber"]);
    }

    #[tokio::test]
    async fn test_interrupt_during_trigger_wait() {
        let temp_dir = TempDir::new().unwrap();
        let marker = temp_dir.path().join("sigint");
        let control = FakeControl::new("IDLE", &[5]);
        let (trigger, interrupt) = Interrupt::pair();
        let config = RunConfig {
            trigger_timeout: Duration::from_secs(10),
            ..test_config()
        };
        let capture = sh(&format!(
            "trap 'touch {}; exit 0' INT; while true; do sleep 0.1; done",
            marker.display()
        ));
        let orchestrator =
            Orchestrator::new(config, &control, interrupt).with_capture_command(capture);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.fire();
        });
        let started = std::time::Instant::now();
        let report = orchestrator.run().await;

        assert_eq!(report.exit_code(), 130);
        assert_eq!(control.count("stop unit_test"), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(marker.exists(), "analyzer did not receive SIGINT");
    }

    #[tokio::test]
    async fn test_interrupt_during_start_still_stops() {
        let (trigger, interrupt) = Interrupt::pair();
        let control = FakeControl::new("IDLE", &[5])
            .rejecting_start()
            .interrupting_start(trigger);
        let orchestrator = Orchestrator::new(test_config(), &control, interrupt)
            .with_capture_command(sh("exec sleep 30"));

        let started = std::time::Instant::now();
        let report = orchestrator.run().await;

        assert_eq!(report.exit_code(), 130);
        assert_eq!(
            report.outcome,
            SessionOutcome::Aborted(AbortReason::Interrupted)
        );
        assert_eq!(
            control.commands(),
            vec!["getconfig", "getevtnumber", "nssta", "stop unit_test"]
        );
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_interrupt_during_completion_wait() {
        let control = FakeControl::new("IDLE", &[5, 6]);
        let (trigger, interrupt) = Interrupt::pair();
        let config = RunConfig {
            no_stop: true,
            ..test_config()
        };
        let orchestrator =
            Orchestrator::new(config, &control, interrupt).with_capture_command(sh("exec sleep 30"));

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(400)).await;
            trigger.fire();
        });
        let report = orchestrator.run().await;

        assert!(report.triggered);
        assert_eq!(
            report.outcome,
            SessionOutcome::Aborted(AbortReason::Interrupted)
        );
        assert_eq!(control.count("stop"), 0);
    }

    #[tokio::test]
    async fn test_interrupt_before_spawn() {
        let temp_dir = TempDir::new().unwrap();
        let marker = temp_dir.path().join("spawned");
        let control = FakeControl::new("IDLE", &[5]);
        let (trigger, interrupt) = Interrupt::pair();
        trigger.fire();
        let orchestrator = Orchestrator::new(test_config(), &control, interrupt)
            .with_capture_command(sh(&format!("touch {}", marker.display())));

        let report = orchestrator.run().await;

        assert_eq!(report.exit_code(), 130);
        assert_eq!(control.count("nssta"), 0);
        assert_eq!(control.count("stop"), 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!marker.exists());
    }
}
