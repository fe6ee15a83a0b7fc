//! ferricd - Ferric IRC Daemon
//!
//! Thin binary around the ferricd library: CLI surface, config
//! test mode, daemonization handshake, logging, signal latches and
//! the pid file.

use std::io::{BufRead, Write};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use ferricd::config::{validation, Config};
use ferricd::network::dns::DnsService;
use ferricd::network::gateway::Gateway;
use ferricd::state::Nexus;
use ferricd::sync::manager::LinkScheduler;

/// Marks the re-executed daemon child; the parent waits for the
/// readiness line before exiting so launchers see a real verdict.
const DAEMON_ENV: &str = "FERRICD_DAEMONIZED";
const READY_LINE: &str = "FERRICD-READY";

#[derive(Parser, Debug)]
#[command(name = "ferricd", version, about = "Ferric IRC Daemon")]
struct Args {
    /// Configuration file path.
    #[arg(long, default_value = "ferricd.toml")]
    configfile: String,

    /// Log file path; defaults to standard output.
    #[arg(long)]
    logfile: Option<String>,

    /// Pid file path.
    #[arg(long)]
    pidfile: Option<String>,

    /// Stay in the foreground instead of detaching.
    #[arg(long)]
    foreground: bool,

    /// Parse and validate the configuration, then exit.
    #[arg(long)]
    conftest: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load(&args.configfile) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ferricd: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(errors) = validation::validate(&config) {
        for e in &errors {
            eprintln!("ferricd: config: {e}");
        }
        return ExitCode::FAILURE;
    }
    if args.conftest {
        println!("ferricd: configuration OK");
        return ExitCode::SUCCESS;
    }

    // Detach by re-executing ourselves; the child reports readiness
    // over its stdout so our exit code reflects whether the daemon
    // actually came up.
    if !args.foreground && std::env::var_os(DAEMON_ENV).is_none() {
        return launch_detached();
    }

    run(args, config)
}

fn launch_detached() -> ExitCode {
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            eprintln!("ferricd: cannot find own executable: {e}");
            return ExitCode::FAILURE;
        }
    };
    let child = std::process::Command::new(exe)
        .args(std::env::args_os().skip(1))
        .env(DAEMON_ENV, "1")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .spawn();
    let mut child = match child {
        Ok(child) => child,
        Err(e) => {
            eprintln!("ferricd: failed to detach: {e}");
            return ExitCode::FAILURE;
        }
    };

    let Some(stdout) = child.stdout.take() else {
        return ExitCode::FAILURE;
    };
    let reader = std::io::BufReader::new(stdout);
    for line in reader.lines() {
        match line {
            Ok(line) if line.trim() == READY_LINE => return ExitCode::SUCCESS,
            Ok(_) => continue,
            Err(_) => break,
        }
    }
    // The child died before reporting ready.
    let status = child.wait().ok();
    eprintln!("ferricd: daemon failed to initialize ({status:?})");
    ExitCode::FAILURE
}

fn init_tracing(config: &Config, logfile: Option<&str>) -> Result<(), String> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match logfile {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| format!("{path}: {e}"))?;
            let writer = Arc::new(file);
            match config.server.log_format {
                ferricd::config::LogFormat::Json => tracing_subscriber::fmt()
                    .with_env_filter(env_filter)
                    .with_writer(writer)
                    .with_ansi(false)
                    .json()
                    .init(),
                ferricd::config::LogFormat::Pretty => tracing_subscriber::fmt()
                    .with_env_filter(env_filter)
                    .with_writer(writer)
                    .with_ansi(false)
                    .init(),
            }
        }
        None => match config.server.log_format {
            ferricd::config::LogFormat::Json => tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .json()
                .init(),
            ferricd::config::LogFormat::Pretty => tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .init(),
        },
    }
    Ok(())
}

fn write_pidfile(path: &str) -> Result<(), String> {
    // A stale file from a dead process is overwritten; a live one is
    // a second daemon and we refuse.
    if let Ok(existing) = std::fs::read_to_string(path) {
        let pid = existing.trim();
        if !pid.is_empty() && std::path::Path::new(&format!("/proc/{pid}")).exists() {
            return Err(format!("{path}: daemon already running with pid {pid}"));
        }
    }
    std::fs::write(path, format!("{}\n", std::process::id())).map_err(|e| format!("{path}: {e}"))
}

fn run(args: Args, config: Config) -> ExitCode {
    if let Err(e) = init_tracing(&config, args.logfile.as_deref()) {
        eprintln!("ferricd: log: {e}");
        return ExitCode::FAILURE;
    }

    if let Some(pidfile) = &args.pidfile {
        if let Err(e) = write_pidfile(pidfile) {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    let code = runtime.block_on(run_daemon(args, config));

    code
}

async fn run_daemon(args: Args, config: Config) -> ExitCode {
    info!(
        server = %config.server.name,
        sid = %config.server.sid,
        network = %config.server.network,
        "starting ferricd"
    );

    let scheduler = Arc::new(LinkScheduler::from_config(&config));
    let nexus = Nexus::new(config);
    let dns = Arc::new(DnsService::new());

    let gateway = Gateway::new(nexus.clone(), dns.clone());
    if let Err(e) = gateway.bind().await {
        error!(error = %e, "failed to bind listeners");
        return ExitCode::FAILURE;
    }

    ferricd::tasks::spawn_all(nexus.clone(), scheduler, args.configfile.clone());

    // Signal latches: applied on the next 1-second sweep, never
    // mid-iteration.
    {
        let nexus = nexus.clone();
        tokio::spawn(async move {
            use std::sync::atomic::Ordering;
            use tokio::signal::unix::{signal, SignalKind};
            let Ok(mut hup) = signal(SignalKind::hangup()) else { return };
            let Ok(mut usr1) = signal(SignalKind::user_defined1()) else { return };
            let Ok(mut usr2) = signal(SignalKind::user_defined2()) else { return };
            let Ok(mut term) = signal(SignalKind::terminate()) else { return };
            let Ok(mut int) = signal(SignalKind::interrupt()) else { return };
            loop {
                tokio::select! {
                    _ = hup.recv() => {
                        info!("SIGHUP: rehash requested");
                        nexus.pending.rehash.store(true, Ordering::Relaxed);
                    }
                    _ = usr1.recv() => {
                        nexus.pending.reread_motd.store(true, Ordering::Relaxed);
                    }
                    _ = usr2.recv() => {
                        nexus.pending.reread_bans.store(true, Ordering::Relaxed);
                    }
                    _ = term.recv() => {
                        info!("SIGTERM: shutting down");
                        nexus.shutdown();
                        break;
                    }
                    _ = int.recv() => {
                        info!("SIGINT: shutting down");
                        nexus.shutdown();
                        break;
                    }
                }
            }
        });
    }

    // Tell the waiting parent we are up.
    if std::env::var_os(DAEMON_ENV).is_some() {
        println!("{READY_LINE}");
        let _ = std::io::stdout().flush();
    }

    // Park until shutdown.
    let mut shutdown_rx = nexus.shutdown_tx.subscribe();
    let _ = shutdown_rx.recv().await;

    info!("draining connections");
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    if let Some(pidfile) = &args.pidfile {
        let _ = std::fs::remove_file(pidfile);
    }
    ExitCode::SUCCESS
}
