mod cli;
mod constants;
mod format;
mod logging;
mod shutdown;
mod terminal;
mod ui;

use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;

use hds_miner_core::profile::{MinerProfile, ensure_profile, profile_path};
use hds_miner_device::{DevicePlatform, ScriptedPlatform};
use hds_miner_engine::{EngineConfig, EngineEvent, SessionError, start_engine};

use crate::cli::{Cli, ServerAddr, parse_server};
use crate::constants::{TUI_MAX_DEVICES, UI_REFRESH_INTERVAL};
use crate::format::{Line, format_event};
use crate::shutdown::{ShutdownController, ShutdownEvent, spawn_ctrl_c_handler};
use crate::terminal::StatusTerminal;
use crate::ui::Ui;

fn resolve_pool(cli: &Cli) -> anyhow::Result<(ServerAddr, String)> {
    let given = MinerProfile {
        server: cli.server.as_ref().map(ToString::to_string),
        api_key: cli.api_key.clone(),
    };
    let interactive = std::io::stdin().is_terminal() && std::io::stdout().is_terminal();
    let profile = ensure_profile(given, interactive)?;

    let (Some(server), Some(api_key)) = (profile.server, profile.api_key) else {
        anyhow::bail!("pool server and API key are required (use --server/--key or HDS_SERVER/HDS_API_KEY)");
    };
    let server = parse_server(&server).map_err(|err| anyhow::anyhow!("{err}"))?;
    Ok((server, api_key))
}

fn device_platform(cli: &Cli) -> anyhow::Result<Arc<dyn DevicePlatform>> {
    match cli.dry_run {
        Some(count) => Ok(Arc::new(ScriptedPlatform::idle(usize::from(count)))),
        None => anyhow::bail!(
            "this build has no GPU backend; run with --dry-run N to exercise the pool connection with N scripted devices"
        ),
    }
}

fn print_line(ui: Option<&Ui>, line: Line) {
    match (ui, line) {
        (Some(ui), Line::Out(msg) | Line::Err(msg)) => ui.println(&msg),
        (None, Line::Out(msg)) => println!("{msg}"),
        (None, Line::Err(msg)) => eprintln!("{msg}"),
    }
}

fn explain_login_rejected(code: i64) {
    let profile = profile_path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "the miner profile".to_string());
    eprintln!("The pool rejected the API key (result code {code}).");
    eprintln!("Check --key / HDS_API_KEY, or fix the key saved in {profile}.");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.debug);

    let (server, api_key) = resolve_pool(&cli)?;
    let platform = device_platform(&cli)?;

    let device_count = cli.dry_run.map(usize::from).unwrap_or(cli.devices.len());
    let tui_enabled = !cli.no_tui && std::io::stdout().is_terminal() && device_count <= TUI_MAX_DEVICES;

    let mut config = EngineConfig::new(server.host.clone(), server.port, api_key);
    config.devices = cli.devices.clone();
    config.forced_variant = cli.forced_variant();
    config.reconnect_delay = Duration::from_secs(cli.reconnect_delay);
    config.dispatch_timeout = cli.dispatch_timeout.map(Duration::from_secs);

    tracing::info!(%server, devices = ?config.devices, forced = ?config.forced_variant, "starting engine");
    let engine = start_engine(config, platform);
    let mut events = engine.subscribe();

    let shutdown = Arc::new(ShutdownController::new());
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel::<ShutdownEvent>();
    let status_terminal = if tui_enabled && std::io::stdin().is_terminal() {
        Some(StatusTerminal::enter(shutdown.clone(), shutdown_tx.clone())?)
    } else {
        None
    };
    if status_terminal.is_none() {
        spawn_ctrl_c_handler(shutdown.clone(), shutdown_tx);
    }

    let mut ui = tui_enabled.then(Ui::new);

    let mut startup = format!("hds-miner {} pool={server}", env!("CARGO_PKG_VERSION"));
    if let Some(variant) = cli.forced_variant() {
        startup.push_str(&format!(" variant={variant} (forced)"));
    }
    if let Some(count) = cli.dry_run {
        startup.push_str(&format!(" dry-run devices={count}"));
    }
    print_line(ui.as_ref(), Line::Out(startup));

    let mut ticker = tokio::time::interval(UI_REFRESH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut immediate_exit = false;

    loop {
        tokio::select! {
            ev_opt = shutdown_rx.recv() => {
                match ev_opt {
                    Some(ShutdownEvent::Graceful) => {
                        let msg = "Stop requested: finishing rounds in flight and flushing solutions (press CTRL+C again to exit immediately).";
                        match &mut ui {
                            Some(ui) => ui.set_stop_message(msg),
                            None => eprintln!("{msg}"),
                        }
                        engine.request_stop();
                    }
                    Some(ShutdownEvent::Immediate) => {
                        let msg = "Stop requested again: exiting immediately.";
                        match &mut ui {
                            Some(ui) => ui.set_stop_message(msg),
                            None => eprintln!("{msg}"),
                        }
                        immediate_exit = true;
                        break;
                    }
                    None => {}
                }
            }
            _ = ticker.tick(), if tui_enabled => {
                if let Some(ui) = &mut ui {
                    ui.refresh(&engine.snapshot(), Utc::now().timestamp());
                }
            }
            evt = events.recv() => {
                let evt = match evt {
                    Ok(v) => v,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                if evt == EngineEvent::Stopped {
                    break;
                }
                if let Some(line) = format_event(&evt) {
                    print_line(ui.as_ref(), line);
                }
            }
        }
    }

    if let Some(ui) = &mut ui {
        ui.refresh(&engine.snapshot(), Utc::now().timestamp());
        ui.freeze();
    }

    if immediate_exit {
        drop(status_terminal);
        std::process::exit(130);
    }

    let result = engine.wait().await;
    drop(status_terminal);

    if let Err(err) = &result {
        if let Some(SessionError::LoginRejected { code }) = err.downcast_ref::<SessionError>() {
            explain_login_rejected(*code);
            std::process::exit(1);
        }
    }
    result
}
