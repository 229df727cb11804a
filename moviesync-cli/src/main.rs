//! moviesync: run one device of a synchronized playback group.
//!
//! ```bash
//! # On the device that hosts the group
//! moviesync coordinator --loop-secs 30
//!
//! # On every other device
//! moviesync member 192.168.1.20 --loop-secs 30 --resync-secs 60
//! ```
//!
//! Operator commands on stdin: `play`, `loop`, `count`, `sync`, `quit`.
//! `RUST_LOG` controls verbosity (default `info`).

mod playback;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use moviesync_core::{
    local_ipv4, CoordinatorConfig, FileOffsetStore, GroupSession, MemberConfig, OffsetEstimator,
    SessionEvent, SystemClock, DEFAULT_PORT,
};
use tokio::io::{AsyncBufReadExt, BufReader};

use playback::Player;

/// Synchronized media playback across devices on one network
#[derive(Parser, Debug)]
#[command(name = "moviesync")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding the persisted clock offset
    #[arg(long, default_value = ".moviesync", env = "MOVIESYNC_STATE_DIR", global = true)]
    state_dir: PathBuf,

    /// Simulated media length; each cycle end triggers the next synchronized start
    #[arg(long, env = "MOVIESYNC_LOOP_SECS", global = true)]
    loop_secs: Option<f64>,

    #[command(subcommand)]
    role: RoleCommand,
}

#[derive(Subcommand, Debug)]
enum RoleCommand {
    /// Host the group and accept members
    Coordinator {
        /// Listening address
        #[arg(long, default_value_t = format!("0.0.0.0:{DEFAULT_PORT}"), env = "MOVIESYNC_BIND")]
        bind: String,

        /// Minimum lead between a play command and its target instant
        #[arg(long, default_value_t = moviesync_core::MIN_MARGIN_MS, env = "MOVIESYNC_MARGIN_MS")]
        margin_ms: i64,
    },
    /// Join a coordinator
    Member {
        /// Coordinator host, optionally with :port (default port 8888)
        coordinator: String,

        /// Re-run time sync every N seconds while joined
        #[arg(long, env = "MOVIESYNC_RESYNC_SECS")]
        resync_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let store = Arc::new(FileOffsetStore::in_dir(&args.state_dir));
    let estimator = OffsetEstimator::load(store.clone(), Arc::new(SystemClock))
        .with_context(|| format!("loading clock offset from {}", store.path().display()))?;
    let mut session = GroupSession::new(Arc::new(estimator));
    let mut events = session
        .take_event_rx()
        .context("event receiver already taken")?;

    match &args.role {
        RoleCommand::Coordinator { bind, margin_ms } => {
            let config = CoordinatorConfig {
                bind_addr: bind.clone(),
                min_margin_ms: *margin_ms,
                ..CoordinatorConfig::default()
            };
            let addr = session
                .start_as_coordinator(config)
                .await
                .context("starting coordinator")?;
            match local_ipv4() {
                Some(ip) => info!("Coordinator ready: members join with `moviesync member {ip}:{}`", addr.port()),
                None => info!("Coordinator ready on {addr}"),
            }
        }
        RoleCommand::Member {
            coordinator,
            resync_secs,
        } => {
            let config = MemberConfig {
                resync_interval: resync_secs.map(Duration::from_secs),
                ..MemberConfig::for_host(coordinator)
            };
            let target = config.coordinator_addr.clone();
            session
                .start_as_member(config)
                .await
                .with_context(|| format!("joining {target}"))?;
        }
    }

    let loop_length = args
        .loop_secs
        .filter(|s| *s > 0.0)
        .map(Duration::from_secs_f64);
    let (mut player, mut loop_finished) = Player::new(loop_length);
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::PlayScheduled { target_epoch_ms, delay }) => {
                    info!("Start scheduled in {} ms", delay.as_millis());
                    player.schedule(target_epoch_ms, delay);
                }
                Some(SessionEvent::Disconnected) => {
                    warn!("Lost the coordinator");
                    break;
                }
                Some(SessionEvent::MemberJoined { addr, .. }) => {
                    info!("{addr} joined ({} devices)", session.connected_count().await);
                }
                Some(SessionEvent::MemberLeft { addr, .. }) => {
                    info!("{addr} left ({} devices)", session.connected_count().await);
                }
                Some(other) => log::debug!("{other:?}"),
                None => break,
            },
            Some(()) = loop_finished.recv() => {
                if let Err(e) = session.notify_loop_finished().await {
                    error!("Loop end not delivered: {e}");
                }
            }
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if !handle_command(line.trim(), &session).await {
                        break;
                    }
                }
                // stdin closed: keep serving until Ctrl-C.
                Ok(None) => stdin_open = false,
                Err(e) => {
                    error!("stdin: {e}");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    player.stop();
    session.disconnect().await;
    info!("Session closed after {} playback starts", player.starts());
    Ok(())
}

/// Run one operator command. Returns false on `quit`.
async fn handle_command(command: &str, session: &GroupSession) -> bool {
    match command {
        "" => {}
        "play" => {
            if let Err(e) = session.request_play().await {
                error!("play: {e}");
            }
        }
        "loop" => {
            if let Err(e) = session.notify_loop_finished().await {
                error!("loop: {e}");
            }
        }
        "count" => info!("{} devices connected", session.connected_count().await),
        "sync" => match session.sync_time().await {
            Ok(offset) => info!("Clock offset now {offset} ms"),
            Err(e) => error!("sync: {e}"),
        },
        "quit" | "exit" => return false,
        other => warn!("Unknown command {other:?} (play, loop, count, sync, quit)"),
    }
    true
}
