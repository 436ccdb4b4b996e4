use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use axum::{
    Json, Router,
    extract::{
        ConnectInfo, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use manuscripts_core::{
    ControlMessage, DEFAULT_MAX_SUBMISSION_BYTES, FailureReason, MAX_FRAME_BYTES,
    SubmissionRequest, WireMessage, decode_frame, encode_frame,
};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::watch,
    time::{Instant, timeout, timeout_at},
};
use tracing::{debug, error, info, warn};

use crate::{
    cooldown::{AuthCooldown, DEFAULT_BASE_COOLDOWN, DEFAULT_MAX_COOLDOWN, DEFAULT_WINDOW},
    events::{EventBus, SessionEvent, StatusEvent},
    identity::CredentialStore,
    session::{InvalidTransition, SessionState, SubmissionSession},
    store::{PendingWrite, Store},
};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// A session with no traffic for this long fails with `Timeout`.
    pub idle_timeout: Duration,
    pub max_submission_bytes: u64,
    /// Bytes tolerated past the declared size before the stream is cut off.
    pub size_slack: u64,
    pub cooldown_base: Duration,
    pub cooldown_max: Duration,
    pub cooldown_window: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            max_submission_bytes: DEFAULT_MAX_SUBMISSION_BYTES,
            size_slack: 64 * 1024,
            cooldown_base: DEFAULT_BASE_COOLDOWN,
            cooldown_max: DEFAULT_MAX_COOLDOWN,
            cooldown_window: DEFAULT_WINDOW,
        }
    }
}

#[derive(Debug)]
struct Shared {
    identity: Arc<CredentialStore>,
    store: Arc<Store>,
    bus: EventBus,
    cooldown: AuthCooldown,
    settings: ServerSettings,
    accepting: AtomicBool,
    succeeded: AtomicU64,
    failed: AtomicU64,
    abort: watch::Sender<bool>,
    live_connections: watch::Sender<usize>,
}

#[derive(Debug, Clone)]
pub struct AppState {
    inner: Arc<Shared>,
}

impl AppState {
    #[must_use]
    pub fn new(
        identity: Arc<CredentialStore>,
        store: Arc<Store>,
        bus: EventBus,
        settings: ServerSettings,
    ) -> Self {
        let cooldown = AuthCooldown::new(
            settings.cooldown_base,
            settings.cooldown_max,
            settings.cooldown_window,
        );
        let (abort, _) = watch::channel(false);
        let (live_connections, _) = watch::channel(0);
        Self {
            inner: Arc::new(Shared {
                identity,
                store,
                bus,
                cooldown,
                settings,
                accepting: AtomicBool::new(true),
                succeeded: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                abort,
                live_connections,
            }),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn identity(&self) -> &CredentialStore {
        &self.inner.identity
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    /// New upgrade requests are refused from now on; live sessions continue.
    pub fn stop_accepting(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
    }

    /// Forces every live session to fail with `TransportInterrupted`.
    pub fn abort_sessions(&self) {
        self.inner.abort.send_replace(true);
    }

    /// Sessions that ended stored and sessions that ended failed since start.
    pub fn session_totals(&self) -> SessionTotals {
        SessionTotals {
            succeeded: self.inner.succeeded.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
        }
    }

    pub fn active_connections(&self) -> usize {
        *self.inner.live_connections.borrow()
    }

    pub async fn wait_until_idle(&self) {
        let mut rx = self.inner.live_connections.subscribe();
        let _ = rx.wait_for(|live| *live == 0).await;
    }

    fn enter_connection(&self) -> ConnectionGuard {
        self.inner.live_connections.send_modify(|live| *live += 1);
        ConnectionGuard {
            state: self.clone(),
        }
    }
}

/// Releases the live-connection slot even if the session task panics.
struct ConnectionGuard {
    state: AppState,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.state
            .inner
            .live_connections
            .send_modify(|live| *live = live.saturating_sub(1));
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/submit", get(submit_handler))
        .route("/healthz", get(healthz_handler))
        .route("/status", get(status_handler))
        .with_state(state)
}

pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(
        "submission server listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned())
    );
    axum::serve(
        listener,
        build_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

async fn healthz_handler() -> impl IntoResponse {
    Json(serde_json::json!({"ok": true}))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionTotals {
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Debug, Serialize)]
struct StatusBody {
    display_name: Option<String>,
    protocol_version: u32,
    requires_passphrase: bool,
    accepting: bool,
    totals: SessionTotals,
    active: Vec<SessionEvent>,
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusBody {
        display_name: state.identity().display_name().map(str::to_owned),
        protocol_version: manuscripts_core::PROTOCOL_VERSION,
        requires_passphrase: state.identity().requires_passphrase(),
        accepting: state.is_accepting(),
        totals: state.session_totals(),
        active: state.events().snapshot(),
    })
}

async fn submit_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> Response {
    if !state.is_accepting() {
        return (StatusCode::SERVICE_UNAVAILABLE, "receiver is shutting down").into_response();
    }

    let guard = state.enter_connection();
    ws.max_frame_size(MAX_FRAME_BYTES)
        .max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| async move {
            let _guard = guard;
            run_connection(state, socket, remote).await;
        })
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SessionFailure {
    reason: FailureReason,
    message: String,
}

impl SessionFailure {
    fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    fn persistence(err: impl std::fmt::Display) -> Self {
        Self::new(FailureReason::PersistenceFailure, err.to_string())
    }
}

struct Connection {
    state: AppState,
    tx: SplitSink<WebSocket, Message>,
    rx: SplitStream<WebSocket>,
    abort: watch::Receiver<bool>,
    remote: SocketAddr,
}

async fn run_connection(state: AppState, socket: WebSocket, remote: SocketAddr) {
    let (tx, rx) = socket.split();
    let abort = state.inner.abort.subscribe();
    let mut conn = Connection {
        state: state.clone(),
        tx,
        rx,
        abort,
        remote,
    };

    let request = match conn.read_header().await {
        Ok(request) => request,
        Err(failure) => {
            warn!(remote = %remote, reason = %failure.reason, "submission refused before handshake: {}", failure.message);
            conn.reject(&failure).await;
            return;
        }
    };

    let mut session = SubmissionSession::new(request, remote);
    info!(
        session_id = %session.id(),
        remote = %remote,
        sender = %session.request().sender_name,
        file = %session.request().file_name,
        size = session.request().size_bytes,
        "submission started"
    );
    state.events().publish(StatusEvent::Session(session.event()));

    let mut pending: Option<PendingWrite> = None;
    match conn.drive(&mut session, &mut pending).await {
        Ok(()) => {
            state.inner.succeeded.fetch_add(1, Ordering::Relaxed);
            info!(
                session_id = %session.id(),
                bytes = session.bytes_received(),
                elapsed_ms = session.started_at().elapsed().as_millis() as u64,
                "submission stored"
            );
            let _ = timeout(CLOSE_TIMEOUT, conn.tx.send(Message::Close(None))).await;
        }
        Err(failure) => {
            state.inner.failed.fetch_add(1, Ordering::Relaxed);
            if let Some(write) = pending.as_mut() {
                write.abort().await;
            }
            if failure.reason == FailureReason::PersistenceFailure {
                error!(session_id = %session.id(), "persistence failure: {}", failure.message);
                state.events().publish(StatusEvent::Fault {
                    message: format!("could not store submission: {}", failure.message),
                });
            } else {
                warn!(
                    session_id = %session.id(),
                    remote = %session.remote(),
                    reason = %failure.reason,
                    "submission failed: {}",
                    failure.message
                );
            }
            if let Some(event) = session.fail(failure.reason, failure.message.clone()) {
                state.events().publish(StatusEvent::Session(event));
            }
            conn.reject(&failure).await;
        }
    }
}

impl Connection {
    fn publish(&self, transition: Result<SessionEvent, InvalidTransition>) -> Result<(), SessionFailure> {
        match transition {
            Ok(event) => {
                self.state.events().publish(StatusEvent::Session(event));
                Ok(())
            }
            Err(err) => {
                error!("internal error: {}", err);
                self.state.events().publish(StatusEvent::Fault {
                    message: format!("internal error: {err}"),
                });
                Err(SessionFailure::new(
                    FailureReason::TransportInterrupted,
                    format!("internal error: {err}"),
                ))
            }
        }
    }

    async fn read_header(&mut self) -> Result<SubmissionRequest, SessionFailure> {
        match self.recv().await? {
            WireMessage::Control(ControlMessage::Submit(request)) => {
                request
                    .validate(self.state.inner.settings.max_submission_bytes)
                    .map_err(|err| SessionFailure::new(err.failure_reason(), err.to_string()))?;
                Ok(request)
            }
            _ => Err(SessionFailure::new(
                FailureReason::ProtocolMismatch,
                "first frame must be a submission request",
            )),
        }
    }

    async fn drive(
        &mut self,
        session: &mut SubmissionSession,
        pending: &mut Option<PendingWrite>,
    ) -> Result<(), SessionFailure> {
        let shared = self.state.inner.clone();

        // The receiver decides whether a passphrase is needed; the request's
        // own proof field is never consulted.
        if let Some(challenge) = shared.identity.issue_challenge() {
            let ip = self.remote.ip();
            if let Some(left) = shared.cooldown.remaining(ip) {
                return Err(SessionFailure::new(
                    FailureReason::AuthenticationFailed,
                    format!(
                        "too many failed attempts; retry in {}s",
                        left.as_secs().max(1)
                    ),
                ));
            }

            self.publish(session.advance(SessionState::Authenticating))?;
            self.send_control(ControlMessage::AuthenticationRequired(challenge.clone()))
                .await?;

            let proof = match self.recv().await? {
                WireMessage::Control(ControlMessage::Proof { proof }) => proof,
                _ => {
                    return Err(SessionFailure::new(
                        FailureReason::AuthenticationFailed,
                        "expected a passphrase proof",
                    ));
                }
            };

            if !shared.identity.verify(&challenge.nonce, Some(proof.as_slice())) {
                let cooldown = shared.cooldown.record_failure(ip);
                debug!(remote = %self.remote, cooldown_ms = cooldown.as_millis() as u64, "proof rejected");
                return Err(SessionFailure::new(
                    FailureReason::AuthenticationFailed,
                    "incorrect passphrase",
                ));
            }
        }

        let request = session.request().clone();
        let write = shared
            .store
            .begin_write(&request.file_name, &request.sender_name, request.size_bytes)
            .await
            .map_err(SessionFailure::persistence)?;
        *pending = Some(write);

        self.publish(session.advance(SessionState::Transferring))?;
        self.send_control(ControlMessage::Accepted {
            session_id: session.id().to_owned(),
        })
        .await?;

        let limit = request
            .size_bytes
            .saturating_add(shared.settings.size_slack);
        loop {
            match self.recv().await? {
                WireMessage::Chunk(chunk) => {
                    session.record_bytes(chunk.len() as u64);
                    if session.bytes_received() > limit {
                        return Err(SessionFailure::new(
                            FailureReason::SizeExceeded,
                            format!(
                                "received more than the declared {} bytes",
                                request.size_bytes
                            ),
                        ));
                    }

                    let Some(write) = pending.as_mut() else {
                        return Err(SessionFailure::persistence("write handle missing"));
                    };
                    let take = write.remaining().min(chunk.len() as u64) as usize;
                    if take > 0 {
                        write
                            .write_chunk(&chunk[..take])
                            .await
                            .map_err(SessionFailure::persistence)?;
                    }
                }
                WireMessage::Control(ControlMessage::Complete) => break,
                WireMessage::Control(ControlMessage::Proof { .. }) => {
                    if shared.identity.requires_passphrase() {
                        return Err(SessionFailure::new(
                            FailureReason::AuthenticationFailed,
                            "passphrase proof was already settled for this session",
                        ));
                    }
                    debug!(session_id = %session.id(), "ignoring proof on open receiver");
                }
                WireMessage::Control(_) => {
                    return Err(SessionFailure::new(
                        FailureReason::ProtocolMismatch,
                        "unexpected control message during transfer",
                    ));
                }
            }
        }

        let received = session.bytes_received();
        if received > request.size_bytes {
            return Err(SessionFailure::new(
                FailureReason::SizeExceeded,
                format!("received {received} of {} declared bytes", request.size_bytes),
            ));
        }
        if received < request.size_bytes {
            return Err(SessionFailure::new(
                FailureReason::TransportInterrupted,
                format!(
                    "stream ended after {received} of {} declared bytes",
                    request.size_bytes
                ),
            ));
        }

        self.publish(session.advance(SessionState::Finalizing))?;
        let Some(write) = pending.take() else {
            return Err(SessionFailure::persistence("write handle missing"));
        };
        let stored = shared
            .store
            .commit(write)
            .await
            .map_err(SessionFailure::persistence)?;

        let file_name = stored
            .final_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let size_bytes = stored.size_bytes;
        self.publish(session.succeed(stored))?;

        if let Err(failure) = self
            .send_control(ControlMessage::Stored {
                file_name,
                size_bytes,
            })
            .await
        {
            debug!(session_id = %session.id(), "sender left before receipt: {}", failure.message);
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<WireMessage, SessionFailure> {
        let idle = self.state.inner.settings.idle_timeout;
        // Only a protocol frame counts as progress; pings do not extend it.
        let deadline = Instant::now() + idle;
        loop {
            let next = tokio::select! {
                biased;
                _ = wait_aborted(&mut self.abort) => {
                    return Err(SessionFailure::new(
                        FailureReason::TransportInterrupted,
                        "receiver is shutting down",
                    ));
                }
                next = timeout_at(deadline, self.rx.next()) => next,
            };

            let message = match next {
                Err(_) => {
                    return Err(SessionFailure::new(
                        FailureReason::Timeout,
                        format!("no activity for {}ms", idle.as_millis()),
                    ));
                }
                Ok(None) => {
                    return Err(SessionFailure::new(
                        FailureReason::TransportInterrupted,
                        "peer disconnected",
                    ));
                }
                Ok(Some(Err(err))) => {
                    return Err(SessionFailure::new(
                        FailureReason::TransportInterrupted,
                        format!("receive failed: {err}"),
                    ));
                }
                Ok(Some(Ok(message))) => message,
            };

            match message {
                Message::Binary(data) => {
                    return decode_frame(&data).map_err(|err| {
                        SessionFailure::new(FailureReason::ProtocolMismatch, err.to_string())
                    });
                }
                Message::Close(_) => {
                    return Err(SessionFailure::new(
                        FailureReason::TransportInterrupted,
                        "peer closed the connection",
                    ));
                }
                Message::Text(_) => {
                    return Err(SessionFailure::new(
                        FailureReason::ProtocolMismatch,
                        "text frames are not part of the protocol",
                    ));
                }
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
    }

    async fn send_control(&mut self, control: ControlMessage) -> Result<(), SessionFailure> {
        let frame = encode_frame(&WireMessage::Control(control)).map_err(|err| {
            SessionFailure::new(FailureReason::ProtocolMismatch, err.to_string())
        })?;
        match timeout(
            self.state.inner.settings.idle_timeout,
            self.tx.send(Message::Binary(frame.into())),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(SessionFailure::new(
                FailureReason::TransportInterrupted,
                format!("send failed: {err}"),
            )),
            Err(_) => Err(SessionFailure::new(
                FailureReason::Timeout,
                "peer stopped reading",
            )),
        }
    }

    /// Best effort: the peer may already be gone.
    async fn reject(&mut self, failure: &SessionFailure) {
        let rejected = WireMessage::Control(ControlMessage::Rejected {
            reason: failure.reason,
            message: failure.message.clone(),
        });
        let Ok(frame) = encode_frame(&rejected) else {
            return;
        };
        let _ = timeout(CLOSE_TIMEOUT, async {
            self.tx.send(Message::Binary(frame.into())).await?;
            self.tx.send(Message::Close(None)).await
        })
        .await;
    }
}

async fn wait_aborted(abort: &mut watch::Receiver<bool>) {
    let _ = abort.wait_for(|aborted| *aborted).await;
}
