//! `hfpd`: the Hands-Free Profile daemon binary.
//!
//! `run` is the actual daemon entry point: it loads configuration,
//! installs logging and waits for a shutdown signal, the way the
//! teacher's own small binaries bootstrap `EspLogger`/the default
//! runtime before doing anything profile-specific. `dial`/`answer`/
//! `hangup`/`status` are, per design, in-process only: this crate has
//! no daemon IPC surface (no D-Bus, no control socket), so each of
//! those subcommands opens its own RFCOMM session against the given
//! address, issues one request, prints the outcome, and disconnects.
//! They exist for manual testing and demos, not for driving a
//! `hfpd run` that's already up — `--help` says so explicitly.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{error, info, LevelFilter};

use hfp_hf::bt::rfcomm::{RfcommAddr, RfcommStream};
use hfp_hf::bt::session::{Session, SessionHandle, SessionTimers};
use hfp_hf::config::Config;
use hfp_hf::device::BdAddr;
use hfp_hf::errors::{Error, TransportError};
use hfp_hf::log as hfp_log;

/// RFCOMM channel the AG's SDP record is expected to advertise for its
/// Hands-Free service. A real daemon would resolve this per-device via
/// SDP (component A); fixed here since SDP *discovery* against a live
/// AG is outside this crate's scope (§1 Non-goals).
const HFP_RFCOMM_CHANNEL: u8 = 1;

const SESSION_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "hfpd", version, about = "Bluetooth Hands-Free Profile 1.5 daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs the daemon: loads configuration and serves until signaled.
    Run {
        /// Path to the TOML config file; defaults to the platform
        /// config directory.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Stay attached to the terminal instead of detaching.
        #[arg(long)]
        foreground: bool,
    },
    /// Dials `number` on the AG at `addr`. In-process only (see above).
    Dial { addr: BdAddr, number: String },
    /// Answers an incoming call on the AG at `addr`. In-process only.
    Answer { addr: BdAddr },
    /// Hangs up the active/waiting call on the AG at `addr`. In-process only.
    Hangup { addr: BdAddr },
    /// Connects to the AG at `addr` and prints its indicator values. In-process only.
    Status { addr: BdAddr },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    hfp_log::init(LevelFilter::Info);

    let runtime = match &cli.command {
        Command::Run { .. } => tokio::runtime::Builder::new_multi_thread().enable_all().build(),
        _ => tokio::runtime::Builder::new_current_thread().enable_all().build(),
    };
    let runtime = match runtime {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("hfpd: failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(dispatch(cli.command)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("hfpd: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(command: Command) -> hfp_hf::Result<()> {
    match command {
        Command::Run { config, foreground } => run_daemon(config, foreground).await,
        Command::Dial { addr, number } => {
            with_session(addr, |handle| async move { handle.dial(number).await }).await
        }
        Command::Answer { addr } => with_session(addr, |handle| async move { handle.answer().await }).await,
        Command::Hangup { addr } => with_session(addr, |handle| async move { handle.hang_up().await }).await,
        Command::Status { addr } => status(addr).await,
    }
}

/// Loads configuration, logs readiness, and blocks until SIGINT/SIGTERM.
/// Incoming-connection listening (RFCOMM/SCO server sockets bound to
/// the local adapter) is the HCI hub's job (component A) and is stood
/// up the same way once a real adapter is available; nothing here
/// prevents layering it on.
async fn run_daemon(config_path: Option<PathBuf>, foreground: bool) -> hfp_hf::Result<()> {
    let path = config_path.unwrap_or_else(Config::path);
    let config = Config::load(&path)?;
    info!(
        "hfpd starting (foreground={foreground}, config={}, local_features={:#06x})",
        path.display(),
        config.local_features
    );

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(|e| Error::Transport(TransportError::SyscallError(e)))?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }

    info!("hfpd shutting down");
    Ok(())
}

async fn connect_session(addr: BdAddr) -> hfp_hf::Result<(SessionHandle, tokio::task::JoinHandle<()>)> {
    let config = Config::load_or_default()?;
    let peer = RfcommAddr {
        addr,
        channel: HFP_RFCOMM_CHANNEL,
    };

    let transport = tokio::time::timeout(SESSION_CONNECT_TIMEOUT, RfcommStream::connect(peer))
        .await
        .map_err(|_| Error::Transport(TransportError::NotConnected))??;

    let timers = SessionTimers {
        ring: config.ring_timeout,
        dial_or_waiting: config.dial_timeout,
    };
    let (session, handle) = Session::new(transport, config.local_features, None, timers);
    let join = tokio::spawn(session.run());

    Ok((handle, join))
}

async fn with_session<F, Fut>(addr: BdAddr, action: F) -> hfp_hf::Result<()>
where
    F: FnOnce(SessionHandle) -> Fut,
    Fut: std::future::Future<Output = hfp_hf::Result<hfp_hf::bt::at::CommandOutcome>>,
{
    let (handle, join) = connect_session(addr).await?;
    let outcome = action(handle.clone()).await;
    handle.disconnect().await;
    join.abort();

    match outcome {
        Ok(result) => {
            println!("{result:?}");
            Ok(())
        }
        Err(e) => {
            error!("command against {addr} failed: {e}");
            Err(e)
        }
    }
}

async fn status(addr: BdAddr) -> hfp_hf::Result<()> {
    let (handle, join) = connect_session(addr).await?;
    let mut events = handle.subscribe();

    let deadline = tokio::time::sleep(Duration::from_secs(5));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => println!("{event:?}"),
                    Err(_) => break,
                }
            }
            _ = &mut deadline => break,
        }
    }

    handle.disconnect().await;
    join.abort();
    Ok(())
}
