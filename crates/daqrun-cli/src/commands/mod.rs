use anyhow::{Context, Result};
use clap::{Args, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tracing::error;

use crate::client::{control_client, expand_path, DEFAULT_BABICONJSON};
use daqrun_common::{CommandResult, ControlCommand, RunConfig, StartMode};
use daqrun_core::{Interrupt, Orchestrator, DEFAULT_COMMAND_TIMEOUT};

/// daqrun subcommands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start DAQ, wait for trigger, and save online analyzer output
    Take(TakeArgs),
    /// Print the DAQ run status
    Status(ChannelArgs),
    /// Print the built-event counter
    Counter(ChannelArgs),
    /// Send a start command
    Start(StartArgs),
    /// Send a stop command
    Stop(StopArgs),
    /// Wait until the built-event counter is above zero
    WaitEvent(WaitEventArgs),
    /// Send a raw command line and print the extracted reply
    Send(SendArgs),
}

impl Commands {
    /// Run the command and return the process exit code
    pub async fn execute(self) -> Result<i32> {
        match self {
            Commands::Take(args) => cmd_take(args).await,
            Commands::Status(args) => cmd_status(args).await,
            Commands::Counter(args) => cmd_counter(args).await,
            Commands::Start(args) => cmd_start(args).await,
            Commands::Stop(args) => cmd_stop(args).await,
            Commands::WaitEvent(args) => cmd_wait_event(args).await,
            Commands::Send(args) => cmd_send(args).await,
        }
    }
}

/// DAQ start mode as written on the command line
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StartModeArg {
    /// Start without saving on the DAQ side
    Nssta,
    /// Regular recorded start
    Start,
}

impl From<StartModeArg> for StartMode {
    fn from(arg: StartModeArg) -> Self {
        match arg {
            StartModeArg::Nssta => StartMode::NoSave,
            StartModeArg::Start => StartMode::Save,
        }
    }
}

/// Arguments for the `take` command. Flags override values from `--config`.
#[derive(Debug, Args)]
pub struct TakeArgs {
    /// JSON file with run settings
    #[clap(long, value_name = "FILE")]
    pub config: Option<String>,

    /// babiconjson EB host
    #[clap(long)]
    pub eb_host: Option<String>,

    /// Host/IP passed to the analyzer --online
    #[clap(long)]
    pub online_host: Option<String>,

    /// Path to babiconjson
    #[clap(long, value_name = "PATH")]
    pub babiconjson: Option<String>,

    /// Path to the analyzer
    #[clap(long, value_name = "PATH")]
    pub analyzer: Option<String>,

    /// Events to collect in the analyzer
    #[clap(short = 'n', long)]
    pub maxevt: Option<u64>,

    /// Output ROOT file
    #[clap(short = 'o', long)]
    pub output: Option<String>,

    /// DAQ start mode
    #[clap(long, value_enum)]
    pub start: Option<StartModeArg>,

    /// Seconds to wait for trigger
    #[clap(long, value_name = "SECS")]
    pub trigger_timeout: Option<f64>,

    /// Trigger poll interval in seconds
    #[clap(long, value_name = "SECS")]
    pub trigger_poll: Option<f64>,

    /// Stop ender text
    #[clap(long)]
    pub ender: Option<String>,

    /// Proceed even if runstatus is not IDLE
    #[clap(long)]
    pub force_if_active: bool,

    /// Do not send stop after capture
    #[clap(long)]
    pub no_stop: bool,
}

impl TakeArgs {
    /// Build the run configuration: defaults, then the config file, then
    /// flags.
    pub fn into_config(self) -> Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => RunConfig::load(&expand_path(path))?,
            None => RunConfig::default(),
        };

        if let Some(host) = self.eb_host {
            config.eb_host = host;
        }
        if let Some(host) = self.online_host {
            config.online_host = host;
        }
        if let Some(path) = self.babiconjson {
            config.control_binary = expand_path(&path);
        }
        if let Some(path) = self.analyzer {
            config.capture_binary = expand_path(&path);
        }
        if let Some(maxevt) = self.maxevt {
            config.max_events = maxevt;
        }
        if let Some(output) = self.output {
            config.output = expand_path(&output);
        }
        if let Some(mode) = self.start {
            config.start_mode = mode.into();
        }
        if let Some(secs) = self.trigger_timeout {
            config.trigger_timeout = seconds(secs).context("invalid --trigger-timeout")?;
        }
        if let Some(secs) = self.trigger_poll {
            config.trigger_poll = seconds(secs).context("invalid --trigger-poll")?;
        }
        if let Some(ender) = self.ender {
            config.ender = ender;
        }
        config.force_if_active |= self.force_if_active;
        config.no_stop |= self.no_stop;

        Ok(config)
    }
}

/// Where to reach the DAQ control binary
#[derive(Debug, Args)]
pub struct ChannelArgs {
    /// babiconjson EB host
    #[clap(long, default_value = "localhost")]
    pub eb_host: String,

    /// Path to babiconjson
    #[clap(long, value_name = "PATH", default_value = DEFAULT_BABICONJSON)]
    pub babiconjson: String,
}

/// Arguments for the `start` command
#[derive(Debug, Args)]
pub struct StartArgs {
    #[clap(flatten)]
    pub channel: ChannelArgs,

    /// Regular recorded start instead of nssta
    #[clap(long)]
    pub save: bool,
}

/// Arguments for the `stop` command
#[derive(Debug, Args)]
pub struct StopArgs {
    #[clap(flatten)]
    pub channel: ChannelArgs,

    /// Stop ender text
    #[clap(long, default_value = "quick_stop")]
    pub ender: String,
}

/// Arguments for the `wait-event` command
#[derive(Debug, Args)]
pub struct WaitEventArgs {
    #[clap(flatten)]
    pub channel: ChannelArgs,

    /// Seconds to wait
    #[clap(long, value_name = "SECS", default_value_t = 15.0)]
    pub timeout: f64,

    /// Poll interval in seconds
    #[clap(long, value_name = "SECS", default_value_t = 0.5)]
    pub poll: f64,
}

/// Arguments for the `send` command
#[derive(Debug, Args)]
pub struct SendArgs {
    #[clap(flatten)]
    pub channel: ChannelArgs,

    /// Command line sent to babiconjson
    #[clap(value_name = "COMMAND", num_args = 1.., required = true)]
    pub command: Vec<String>,

    /// Seconds before the command is cut off
    #[clap(long, value_name = "SECS", default_value_t = 10.0)]
    pub timeout: f64,
}

impl ChannelArgs {
    fn client(&self) -> daqrun_core::ControlClient {
        control_client(&self.eb_host, &expand_path(&self.babiconjson))
    }
}

fn seconds(secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs).with_context(|| format!("{} is not a valid duration", secs))
}

/// Print a command result; error results exit with 1
fn report(result: &CommandResult) -> Result<i32> {
    let json = serde_json::to_string_pretty(&result.to_value())
        .context("Failed to serialize reply")?;
    println!("{}", json);
    Ok(if result.is_error() { 1 } else { 0 })
}

pub async fn cmd_take(args: TakeArgs) -> Result<i32> {
    let config = args.into_config()?;
    if let Err(e) = config.validate() {
        error!("Error: {}", e);
        return Ok(e.exit_code().code());
    }

    let control = control_client(&config.eb_host, &config.control_binary);
    let interrupt = Interrupt::on_ctrl_c();
    let report = Orchestrator::new(config, control, interrupt).run().await;
    Ok(report.exit_code())
}

pub async fn cmd_status(args: ChannelArgs) -> Result<i32> {
    let status = args.client().run_status().await;
    println!("{}", status);
    Ok(if status.is_unknown() { 1 } else { 0 })
}

pub async fn cmd_counter(args: ChannelArgs) -> Result<i32> {
    let count = args.client().event_built_number().await;
    println!("{}", count);
    Ok(0)
}

pub async fn cmd_start(args: StartArgs) -> Result<i32> {
    let result = args.channel.client().start(!args.save).await;
    report(&result)
}

pub async fn cmd_stop(args: StopArgs) -> Result<i32> {
    let result = args.channel.client().stop(&args.ender).await;
    report(&result)
}

pub async fn cmd_wait_event(args: WaitEventArgs) -> Result<i32> {
    let timeout = seconds(args.timeout).context("invalid --timeout")?;
    let poll = seconds(args.poll).context("invalid --poll")?;
    let (triggered, last) = args.channel.client().wait_for_event(timeout, poll).await;
    println!(
        "{}",
        serde_json::json!({"triggered": triggered, "eventbuiltnumber": last})
    );
    Ok(if triggered { 0 } else { 1 })
}

pub async fn cmd_send(args: SendArgs) -> Result<i32> {
    let timeout = if args.timeout > 0.0 {
        seconds(args.timeout).context("invalid --timeout")?
    } else {
        DEFAULT_COMMAND_TIMEOUT
    };
    let command = ControlCommand::Raw(args.command.join(" "));
    let result = args.channel.client().send_command(&command, timeout).await;
    report(&result)
}
