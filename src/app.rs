use std::path::PathBuf;
use std::process::{Command, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};

use crate::prelude::*;
use clap::{
    Args, Parser, Subcommand,
    builder::{Styles, styling},
};
use itertools::Itertools;
use log::LevelFilter;
use procwatch::client::{CollectorHandler, HandlerConfig};
use procwatch::collector::run_collector;
use procwatch::config::ProcwatchConfig;
use procwatch::process;
use procwatch::watchdog::{self, Watchdog};

/// Exit code of `run` when the watchdog killed the command, same as coreutils `timeout`
pub const TIMEOUT_EXIT_CODE: i32 = 124;
const TIMER_EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

fn create_styles() -> Styles {
    styling::Styles::styled()
        .header(styling::AnsiColor::Green.on_default() | styling::Effects::BOLD)
        .usage(styling::AnsiColor::Green.on_default() | styling::Effects::BOLD)
        .literal(styling::AnsiColor::Yellow.on_default() | styling::Effects::BOLD)
        .placeholder(styling::AnsiColor::Cyan.on_default())
}

#[derive(Parser, Debug)]
#[command(version, about = "Process tree supervision and log collection", styles = create_styles())]
pub struct Cli {
    /// The configuration name to use
    /// If provided, the configuration will be loaded from ~/.config/procwatch/{config-name}.yaml
    /// Otherwise, loads from ~/.config/procwatch/config.yaml
    #[arg(long, env = "PROCWATCH_CONFIG_NAME", global = true)]
    pub config_name: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a log collector in the foreground until a client requests its shutdown
    Serve(ServeArgs),
    /// Kill processes along with all of their descendants
    KillTree(KillTreeArgs),
    /// List the descendants of a process, direct children first
    Children { pid: u32 },
    /// Show what is known about a process
    Info {
        pid: u32,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// List the PIDs of the running processes with the given name (case insensitive)
    List { name: String },
    /// Run a command, killing its whole process tree if it outlives the timeout
    Run(RunArgs),
    /// Send one record to a log collector
    Log(LogArgs),
    /// Ask a log collector to stop and wait for it to exit
    ShutdownCollector(ShutdownCollectorArgs),
    /// Timer process spawned by the watchdog
    #[command(hide = true)]
    WatchdogTimer {
        #[arg(long)]
        pid: u32,
        #[arg(long)]
        timeout_ms: u64,
    },
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Port to listen on, on the loopback interface
    #[arg(long)]
    port: Option<u16>,
    /// File receiving the records, truncated on startup
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct KillTreeArgs {
    #[arg(required = true)]
    pids: Vec<u32>,
    /// Report processes that survive instead of failing
    #[arg(long)]
    no_raise: bool,
    /// How long each process gets to exit before being force killed
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Timeout in seconds
    #[arg(long)]
    timeout: u64,
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[derive(Args, Debug)]
struct CollectorAddressArgs {
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
}

#[derive(Args, Debug)]
struct LogArgs {
    /// Logger name written in front of the record
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "info")]
    level: log::Level,
    #[command(flatten)]
    address: CollectorAddressArgs,
    message: String,
}

#[derive(Args, Debug)]
struct ShutdownCollectorArgs {
    /// PID of the collector process
    #[arg(long)]
    pid: u32,
    /// Seconds to wait for the collector to exit
    #[arg(long, default_value_t = 5)]
    timeout: u64,
    /// Name the shutdown request is sent under
    #[arg(long, default_value = "procwatch")]
    name: String,
    #[command(flatten)]
    address: CollectorAddressArgs,
}

impl CollectorAddressArgs {
    fn handler_config(&self, name: &str, config: &ProcwatchConfig) -> HandlerConfig {
        HandlerConfig::new(name)
            .with_host(
                self.host
                    .clone()
                    .unwrap_or_else(|| config.collector.host.clone()),
            )
            .with_port(self.port.unwrap_or(config.collector.port))
    }
}

/// Run the CLI and return the exit code of the process.
pub async fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config = ProcwatchConfig::load_with_override(cli.config_name.as_deref())?;

    match cli.command {
        Commands::Serve(args) => {
            let port = args.port.unwrap_or(config.collector.port);
            let log_file = args.log_file.unwrap_or(config.collector.log_file);
            run_collector(port, &log_file).await?;
        }
        Commands::KillTree(args) => {
            let mut options = config.kill.kill_options(!args.no_raise);
            if let Some(timeout_ms) = args.timeout_ms {
                options.timeout = Duration::from_millis(timeout_ms);
            }
            let pids = args.pids;
            let killed =
                tokio::task::spawn_blocking(move || process::kill_tree_multiple(&pids, options))
                    .await??;
            println!("{}", killed.iter().join(" "));
        }
        Commands::Children { pid } => {
            println!("{}", process::children(pid).iter().join(" "));
        }
        Commands::Info { pid, json } => {
            let info = process::info(pid)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                println!("pid: {}", info.pid);
                println!("name: {}", info.name);
                if let Some(parent) = info.parent {
                    println!("parent: {parent}");
                }
                if let Some(executable) = &info.executable {
                    println!("executable: {}", executable.display());
                }
                println!("command line: {}", info.command_line.iter().join(" "));
                println!("children: {}", info.children.iter().join(" "));
            }
        }
        Commands::List { name } => {
            for pid in process::list_alive(&name) {
                println!("{pid}");
            }
        }
        Commands::Run(args) => {
            return tokio::task::spawn_blocking(move || run_with_watchdog(args, &config)).await?;
        }
        Commands::Log(args) => {
            let handler = CollectorHandler::new(
                args.address
                    .handler_config(&args.name, &config)
                    .with_level(LevelFilter::Trace),
            );
            handler.emit(args.level, args.message).with_context(|| {
                format!(
                    "Failed to send the record to the collector on port {}",
                    handler.config().port
                )
            })?;
            handler.close();
        }
        Commands::ShutdownCollector(args) => {
            let handler = CollectorHandler::new(args.address.handler_config(&args.name, &config));
            let timeout = Duration::from_secs(args.timeout);
            let collector_pid = args.pid;
            let stopped = tokio::task::spawn_blocking(move || {
                handler.request_shutdown(collector_pid, timeout)
            })
            .await?;
            if !stopped {
                bail!(
                    "Log collector {} still running {timeout:?} after the shutdown request",
                    args.pid
                );
            }
            info!("Log collector {} stopped", args.pid);
        }
        Commands::WatchdogTimer { pid, timeout_ms } => {
            let timeout = Duration::from_millis(timeout_ms);
            tokio::task::spawn_blocking(move || watchdog::run_timer(pid, timeout)).await??;
        }
    }
    Ok(0)
}

fn exit_code(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(1)
}

fn run_with_watchdog(args: RunArgs, config: &ProcwatchConfig) -> Result<i32> {
    let Some((program, program_args)) = args.command.split_first() else {
        bail!("No command to run");
    };
    let timeout = Duration::from_secs(args.timeout);

    let mut child = Command::new(program)
        .args(program_args)
        .spawn()
        .with_context(|| format!("Failed to spawn {program}"))?;
    let started = Instant::now();

    let mut watchdog = match Watchdog::new(child.id(), timeout) {
        Ok(watchdog) => watchdog,
        Err(e) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(e.into());
        }
    };
    if let Err(e) = watchdog.start() {
        let _ = child.kill();
        let _ = child.wait();
        return Err(e).context("Failed to start the watchdog");
    }

    let status = child.wait()?;

    if started.elapsed() >= timeout {
        // The timer may still be busy with the rest of the tree
        let deadline = Instant::now() + config.kill.timeout() + Duration::from_secs(2);
        while watchdog.is_timer_alive() && Instant::now() < deadline {
            thread::sleep(TIMER_EXIT_POLL_INTERVAL);
        }
        if watchdog.is_expired() {
            warn!("{program} timed out after {timeout:?}");
            return Ok(TIMEOUT_EXIT_CODE);
        }
    }

    watchdog.stop();
    Ok(exit_code(status))
}
