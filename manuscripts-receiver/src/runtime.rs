//! Receiver lifecycle: advertise, serve, and shut down gracefully.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use manuscripts_core::{
    AdvertisementHandle, Advertiser, DiscoveryError, ReceiverMode, ServiceRecord,
};
use thiserror::Error;
use tokio::{
    net::TcpListener,
    runtime::{Handle, RuntimeFlavor},
    sync::oneshot,
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    events::StatusEvent,
    identity::IdentityError,
    server::{self, AppState},
    store::StoreError,
};

/// How long forced sessions get to release their resources after abort.
const ABORT_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("cannot bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error("listener has no local address: {0}")]
    LocalAddr(io::Error),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("advertisement failed: {0}")]
    Advertise(#[from] DiscoveryError),
}

#[derive(Debug, Clone)]
pub struct StartOptions {
    pub mode: ReceiverMode,
    /// Address put in the record; an empty or non-IP value lets the
    /// advertiser pick interface addresses itself.
    pub advertised_host: String,
    pub grace_period: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShutdownReport {
    /// Sessions still running when the grace period ran out.
    pub forced_sessions: usize,
    pub temp_files_removed: usize,
}

/// Withdrawal blocks on the mDNS daemon. On a multi-thread runtime the
/// worker hands its other tasks off first; elsewhere it runs inline.
fn run_blocking<T>(work: impl FnOnce() -> T) -> T {
    match Handle::try_current().map(|handle| handle.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(work),
        _ => work(),
    }
}

/// Binds `port`, falling back to an ephemeral port when it is taken.
pub async fn bind_with_fallback(addr: SocketAddr) -> Result<TcpListener, ReceiverError> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) if addr.port() != 0 => {
            warn!(%addr, "preferred port unavailable ({err}); using an ephemeral port");
            let fallback = SocketAddr::new(addr.ip(), 0);
            TcpListener::bind(fallback)
                .await
                .map_err(|source| ReceiverError::Bind {
                    addr: fallback,
                    source,
                })
        }
        Err(source) => Err(ReceiverError::Bind { addr, source }),
    }
}

pub struct RunningReceiver {
    state: AppState,
    advertiser: Arc<dyn Advertiser>,
    advertisement: Option<AdvertisementHandle>,
    record: ServiceRecord,
    local_addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<io::Result<()>>>,
    grace_period: Duration,
}

impl RunningReceiver {
    /// Publishes the record and starts serving. The identity must already be
    /// configured. A failed publication aborts startup.
    pub async fn start(
        listener: TcpListener,
        state: AppState,
        advertiser: Arc<dyn Advertiser>,
        options: StartOptions,
    ) -> Result<Self, ReceiverError> {
        let local_addr = listener.local_addr().map_err(ReceiverError::LocalAddr)?;
        let identity = state.identity().snapshot()?;

        let record = ServiceRecord::new(
            &identity.display_name,
            &options.advertised_host,
            local_addr.port(),
            identity.requires_passphrase(),
            options.mode,
        );
        let advertisement = advertiser.publish(&record)?;

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(server::serve(listener, state.clone(), async move {
            let _ = stop_rx.await;
        }));

        info!(
            address = %local_addr,
            name = %identity.display_name,
            mode = %options.mode,
            auth = identity.requires_passphrase(),
            "receiver started"
        );
        state.events().publish(StatusEvent::Listening {
            address: local_addr,
            display_name: identity.display_name,
        });

        Ok(Self {
            state,
            advertiser,
            advertisement: Some(advertisement),
            record,
            local_addr,
            stop: Some(stop_tx),
            server: Some(server),
            grace_period: options.grace_period,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn record(&self) -> &ServiceRecord {
        &self.record
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Withdraws the advertisement, stops accepting, lets in-flight sessions
    /// finish within the grace period, then forces the rest to fail.
    pub async fn shutdown(mut self) -> ShutdownReport {
        info!("receiver shutting down");
        self.state.events().publish(StatusEvent::ShuttingDown);

        if let Some(handle) = self.advertisement.take() {
            let advertiser = Arc::clone(&self.advertiser);
            let withdrawn =
                tokio::task::spawn_blocking(move || advertiser.withdraw(&handle)).await;
            match withdrawn {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("withdrawal failed: {err}"),
                Err(err) => warn!("withdrawal task failed: {err}"),
            }
        }

        self.state.stop_accepting();
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }

        let mut report = ShutdownReport::default();
        if timeout(self.grace_period, self.state.wait_until_idle())
            .await
            .is_err()
        {
            report.forced_sessions = self.state.active_connections();
            warn!(
                sessions = report.forced_sessions,
                "grace period elapsed; aborting in-flight sessions"
            );
            self.state.abort_sessions();
            if timeout(ABORT_DEADLINE, self.state.wait_until_idle())
                .await
                .is_err()
            {
                warn!("sessions did not release within the abort deadline");
            }
        }

        if let Some(server) = self.server.take() {
            match timeout(ABORT_DEADLINE, server).await {
                Ok(Ok(Ok(()))) => debug!("server stopped"),
                Ok(Ok(Err(err))) => warn!("server stopped with error: {err}"),
                Ok(Err(err)) => warn!("server task failed: {err}"),
                Err(_) => warn!("server did not stop in time"),
            }
        }

        report.temp_files_removed = self.state.store().sweep_temp_files();
        info!(
            forced = report.forced_sessions,
            temp_removed = report.temp_files_removed,
            "receiver stopped"
        );
        report
    }
}

impl Drop for RunningReceiver {
    fn drop(&mut self) {
        if let Some(handle) = self.advertisement.take() {
            warn!("receiver dropped without shutdown; withdrawing advertisement");
            let advertiser = &self.advertiser;
            if let Err(err) = run_blocking(|| advertiser.withdraw(&handle)) {
                warn!("withdrawal failed: {err}");
            }
        }
        if let Some(stop) = self.stop.take() {
            self.state.stop_accepting();
            self.state.abort_sessions();
            let _ = stop.send(());
        }
    }
}
