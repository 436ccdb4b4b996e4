use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use clap::{Parser, ValueEnum};
use manuscripts_core::ReceiverMode;
use manuscripts_receiver::{
    AppState, CredentialStore, EventBus, MdnsAdvertiser, NamingScheme, RunningReceiver,
    ServerSettings, SessionState, StartOptions, StatusEvent, Store, advertise::primary_local_ip,
    bind_with_fallback,
    config::{ReceiverConfig, SavedConfig, load_config, save_config},
    stop::{StopReason, StopSignals, install_panic_trigger},
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Receiver,
    Share,
}

impl From<ModeArg> for ReceiverMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Receiver => ReceiverMode::Receiver,
            ModeArg::Share => ReceiverMode::Share,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "manuscripts-receiver", about = "Receive manuscript submissions on the local network")]
struct ReceiverArgs {
    /// Display name shown to senders.
    #[arg(long)]
    name: Option<String>,
    /// Shared passphrase; blank means none. Never saved.
    #[arg(long, env = "MANUSCRIPTS_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,
    /// Destination directory for received files.
    #[arg(long)]
    dest: Option<PathBuf>,
    #[arg(long, value_enum, default_value = "receiver")]
    mode: ModeArg,
    #[arg(long)]
    idle_timeout_secs: Option<u64>,
    #[arg(long)]
    grace_secs: Option<u64>,
    /// Prefix stored files with the sender's last name.
    #[arg(long)]
    prefix_sender: bool,
    /// Persist name, port, destination and naming for next time.
    #[arg(long)]
    save_config: bool,
}

impl ReceiverArgs {
    fn overrides(&self) -> SavedConfig {
        SavedConfig {
            display_name: self.name.clone(),
            port: self.port,
            destination: self.dest.clone(),
            naming: self.prefix_sender.then_some(NamingScheme::SenderPrefixed),
            idle_timeout_secs: self.idle_timeout_secs,
            grace_secs: self.grace_secs,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let panicked = install_panic_trigger();
    let args = ReceiverArgs::parse();
    if let Err(err) = run(args, panicked).await {
        error!("receiver failed: {err}");
        std::process::exit(1);
    }
}

async fn run(
    args: ReceiverArgs,
    panicked: tokio::sync::watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mode = ReceiverMode::from(args.mode);
    let saved = load_config(mode).merged(args.overrides());
    if args.save_config {
        match save_config(mode, &saved) {
            Ok(path) => info!(path = %path.display(), "configuration saved"),
            Err(err) => warn!("could not save configuration: {err}"),
        }
    }
    let config = ReceiverConfig::resolve(&saved, mode, chrono::Local::now().date_naive());

    let identity = Arc::new(CredentialStore::new());
    identity.configure(&config.display_name, args.passphrase.as_deref())?;

    let store = Arc::new(Store::open(&config.destination, config.naming)?);
    let swept = store.sweep_temp_files();
    if swept > 0 {
        info!(count = swept, "removed stale temp files from a previous run");
    }
    info!(dest = %store.dir().display(), "saving submissions");

    let bus = EventBus::new();
    let settings = ServerSettings {
        idle_timeout: config.idle_timeout,
        ..ServerSettings::default()
    };
    let state = AppState::new(identity, store, bus.clone(), settings);

    let listener = bind_with_fallback(SocketAddr::new(args.bind, config.port)).await?;
    let advertised_host = match args.bind {
        ip if !ip.is_unspecified() => ip.to_string(),
        _ => primary_local_ip()
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .to_string(),
    };

    let stop = StopSignals::install(panicked)?;
    tokio::spawn(log_status(bus));

    let advertiser = Arc::new(MdnsAdvertiser::new()?);
    let receiver = RunningReceiver::start(
        listener,
        state,
        advertiser,
        StartOptions {
            mode,
            advertised_host,
            grace_period: config.grace_period,
        },
    )
    .await?;
    info!(url = %receiver.record().submit_url(), "ready for submissions");

    match stop.wait().await {
        StopReason::Signal(name) => info!(signal = name, "stop requested"),
        StopReason::Panic => error!("a worker panicked; shutting down"),
    }
    let report = receiver.shutdown().await;
    if report.forced_sessions > 0 {
        warn!(sessions = report.forced_sessions, "some submissions were interrupted");
    }
    Ok(())
}

/// Terminal stand-in for the dashboard: one line per milestone.
async fn log_status(bus: EventBus) {
    let (active, mut rx) = bus.subscribe_with_snapshot();
    for session in active {
        info!(session_id = %session.session_id, state = ?session.state, "in flight");
    }
    loop {
        match rx.recv().await {
            Ok(StatusEvent::Listening { address, display_name }) => {
                info!(%address, name = %display_name, "listening");
            }
            Ok(StatusEvent::Session(event)) => match event.state {
                SessionState::Succeeded => {
                    let path = event
                        .stored
                        .as_ref()
                        .map(|stored| stored.final_path.display().to_string())
                        .unwrap_or_default();
                    info!(sender = %event.sender_name, file = %path, "received");
                }
                SessionState::Failed => warn!(
                    sender = %event.sender_name,
                    file = %event.file_name,
                    reason = ?event.reason,
                    "submission failed"
                ),
                state => info!(
                    session_id = %event.session_id,
                    sender = %event.sender_name,
                    ?state,
                    "session update"
                ),
            },
            Ok(StatusEvent::Fault { message }) => error!("receiver fault: {message}"),
            Ok(StatusEvent::ShuttingDown) => break,
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "status log fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
}
