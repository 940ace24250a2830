use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use futures::stream::StreamExt;
use signal_hook::consts::signal::{SIGINT, SIGQUIT, SIGTERM};
use signal_hook_tokio::Signals;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use script_supervisor::logger::{logs_stderr, logs_tracing, parse_level};
use script_supervisor::parse::parser;
use script_supervisor::shell::run_shell;
use script_supervisor::{Event, SupervisorBuilder, SupervisorHandle};

struct Args {
    config: PathBuf,
    console: bool,
}

fn parse_args() -> Result<Args> {
    let mut config = None;
    let mut console = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--console" => console = true,
            flag if flag.starts_with("--") => bail!("unknown option {flag}"),
            path if config.is_none() => config = Some(PathBuf::from(path)),
            extra => bail!("unexpected argument {extra}"),
        }
    }
    let config = config.context("usage: script-supervisor <config.yml> [--console]")?;
    Ok(Args { config, console })
}

async fn log_events(mut events: broadcast::Receiver<Event>) {
    loop {
        match events.recv().await {
            Ok(event) => debug!(event = event.name(), ?event, "supervisor event"),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event log fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn forward_signals(mut signals: Signals, handle: SupervisorHandle) {
    if let Some(signal) = signals.next().await {
        info!(signal, "shutdown signal received");
        if let Err(e) = handle.kill_child_process() {
            debug!(error = %e, "supervisor already stopped");
        }
    }
}



/*
    @@@
    @main();
    . Parses <config.yml>, sets up tracing (rolling file under log_dir, else stderr).
    . Builds and runs the supervisor, launches the script, turns SIGINT/SIGTERM/SIGQUIT into a forced shutdown.
    . Optionally hands the terminal to the operator console, then exits with the termination's exit code.
*/
#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;
    let cfg = parser(&args.config).with_context(|| format!("loading {}", args.config.display()))?;

    let level = parse_level(&cfg.log_level);
    let guard = match &cfg.log_dir {
        Some(dir) => Some(logs_tracing(dir, level)),
        None => {
            logs_stderr(level);
            None
        }
    };

    let supervisor = SupervisorBuilder::new(cfg.supervisor.clone())
        .build()
        .context("invalid supervisor config")?;
    let handle = supervisor.run();
    tokio::spawn(log_events(handle.subscribe()));

    let signals = Signals::new([SIGINT, SIGTERM, SIGQUIT]).context("installing signal handlers")?;
    let signals_handle = signals.handle();
    let signal_task = tokio::spawn(forward_signals(signals, handle.clone()));

    handle.launch().await.context("launching script")?;

    if args.console || cfg.console {
        let history = cfg.log_dir.as_ref().map(|dir| dir.join("history.txt"));
        tokio::select! {
            closed = run_shell(handle.clone(), history) => {
                if let Err(e) = closed {
                    warn!(error = %e, "console closed");
                }
            }
            _ = handle.wait() => {}
        }
    }

    let termination = handle.wait().await.context("supervisor ended unexpectedly")?;
    signals_handle.close();
    let _ = signal_task.await;
    info!(?termination, exit_code = termination.exit_code(), "exiting");

    // process::exit skips destructors; flush the log writer first.
    drop(guard);
    std::process::exit(termination.exit_code());
}
