//! Submission client: one file to one receiver over one WebSocket.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use manuscripts_core::{
    Challenge, ControlMessage, CoreError, FailureReason, MAX_CHUNK_BYTES, ServiceRecord,
    SessionId, SubmissionRequest, WireMessage, answer_challenge, decode_frame, encode_frame,
};
use thiserror::Error;
use tokio::{
    fs::File,
    io::AsyncReadExt,
    net::TcpStream,
    time::timeout,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info};

/// Refuse challenges that would make us allocate more than this for Argon2.
const MAX_CHALLENGE_MEMORY_KIB: u32 = 256 * 1024;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("cannot read {path}: {source}")]
    File {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{0} has no usable file name")]
    NoFileName(PathBuf),
    #[error("receiver unreachable: {0}")]
    Unreachable(String),
    #[error("receiver requires a passphrase")]
    PassphraseRequired,
    #[error("receiver asked for unreasonable key derivation cost")]
    UnreasonableChallenge,
    #[error("receiver rejected the submission ({reason}): {message}")]
    Rejected {
        reason: FailureReason,
        message: String,
    },
    #[error("unexpected reply from receiver: {0}")]
    Protocol(String),
    #[error(transparent)]
    Codec(#[from] CoreError),
    #[error("connection lost: {0}")]
    Transport(String),
    #[error("receiver did not answer within {0:?}")]
    Timeout(Duration),
}

impl SendError {
    /// The receiver's failure class, when the receiver gave one.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            SendError::Rejected { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub session_id: SessionId,
    /// Name the receiver stored the file under; may carry a collision suffix.
    pub stored_name: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct SubmitOptions {
    pub sender_name: String,
    pub passphrase: Option<String>,
    /// Upper bound on every wait for the receiver.
    pub response_timeout: Duration,
}

impl SubmitOptions {
    pub fn new(sender_name: impl Into<String>) -> Self {
        Self {
            sender_name: sender_name.into(),
            passphrase: None,
            response_timeout: Duration::from_secs(30),
        }
    }

    #[must_use]
    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }
}

pub fn submit_url_for_address(address: &str) -> String {
    format!("ws://{address}/submit")
}

pub async fn submit_to_record(
    record: &ServiceRecord,
    path: &Path,
    options: &SubmitOptions,
) -> Result<Receipt, SendError> {
    submit_file(&record.submit_url(), path, options).await
}

pub async fn submit_file(
    url: &str,
    path: &Path,
    options: &SubmitOptions,
) -> Result<Receipt, SendError> {
    let file_error = |source| SendError::File {
        path: path.to_path_buf(),
        source,
    };
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| SendError::NoFileName(path.to_path_buf()))?;
    let mut file = File::open(path).await.map_err(file_error)?;
    let size_bytes = file.metadata().await.map_err(file_error)?.len();

    let request = SubmissionRequest::new(&options.sender_name, &file_name, size_bytes);
    let (ws, _) = timeout(options.response_timeout, connect_async(url))
        .await
        .map_err(|_| SendError::Unreachable(format!("{url}: connect timed out")))?
        .map_err(|err| SendError::Unreachable(format!("{url}: {err}")))?;
    let (write, read) = ws.split();
    let mut link = Link {
        write,
        read,
        wait: options.response_timeout,
    };

    info!(%url, file = %file_name, size = size_bytes, "submitting");
    link.send(WireMessage::Control(ControlMessage::Submit(request)))
        .await?;

    let mut session_id = None;
    loop {
        match link.recv().await? {
            ControlMessage::AuthenticationRequired(challenge) => {
                let passphrase = options
                    .passphrase
                    .clone()
                    .filter(|p| !p.trim().is_empty())
                    .ok_or(SendError::PassphraseRequired)?;
                let proof = prove(passphrase, challenge).await?;
                link.send(WireMessage::Control(ControlMessage::Proof { proof }))
                    .await?;
            }
            ControlMessage::Accepted { session_id: id } => {
                debug!(session_id = %id, "accepted; streaming body");
                session_id = Some(id);
                link.stream_body(&mut file, size_bytes)
                    .await
                    .map_err(|err| match err {
                        SendError::File { source, .. } => file_error(source),
                        other => other,
                    })?;
                link.send(WireMessage::Control(ControlMessage::Complete))
                    .await?;
            }
            ControlMessage::Stored {
                file_name,
                size_bytes,
            } => {
                let session_id = session_id.ok_or_else(|| {
                    SendError::Protocol("stored before the submission was accepted".to_owned())
                })?;
                let _ = link.write.send(Message::Close(None)).await;
                info!(stored = %file_name, size = size_bytes, "submission stored");
                return Ok(Receipt {
                    session_id,
                    stored_name: file_name,
                    size_bytes,
                });
            }
            ControlMessage::Rejected { reason, message } => {
                return Err(SendError::Rejected { reason, message });
            }
            other => {
                return Err(SendError::Protocol(format!("{other:?}")));
            }
        }
    }
}

/// Argon2 is slow; keep it off the async workers.
async fn prove(passphrase: String, challenge: Challenge) -> Result<Vec<u8>, SendError> {
    if challenge.kdf.memory_kib > MAX_CHALLENGE_MEMORY_KIB {
        return Err(SendError::UnreasonableChallenge);
    }
    tokio::task::spawn_blocking(move || answer_challenge(&passphrase, &challenge))
        .await
        .map_err(|err| SendError::Transport(format!("proof task failed: {err}")))?
        .map_err(SendError::from)
}

struct Link {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
    wait: Duration,
}

impl Link {
    async fn send(&mut self, message: WireMessage) -> Result<(), SendError> {
        let frame = encode_frame(&message)?;
        match timeout(self.wait, self.write.send(Message::Binary(frame.into()))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(self.explain_send_failure(err.to_string()).await),
            Err(_) => Err(SendError::Timeout(self.wait)),
        }
    }

    /// A send usually fails because the receiver already rejected us and
    /// closed; surface that rejection instead of the socket error.
    async fn explain_send_failure(&mut self, err: String) -> SendError {
        match timeout(Duration::from_secs(1), self.recv_inner()).await {
            Ok(Ok(ControlMessage::Rejected { reason, message })) => {
                SendError::Rejected { reason, message }
            }
            _ => SendError::Transport(err),
        }
    }

    async fn recv(&mut self) -> Result<ControlMessage, SendError> {
        timeout(self.wait, self.recv_inner())
            .await
            .map_err(|_| SendError::Timeout(self.wait))?
    }

    async fn recv_inner(&mut self) -> Result<ControlMessage, SendError> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Binary(data))) => match decode_frame(&data)? {
                    WireMessage::Control(control) => return Ok(control),
                    WireMessage::Chunk(_) => {
                        return Err(SendError::Protocol("receiver sent body bytes".to_owned()));
                    }
                },
                Some(Ok(Message::Close(_))) | None => {
                    return Err(SendError::Transport("receiver closed the connection".to_owned()));
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(SendError::Transport(err.to_string())),
            }
        }
    }

    async fn stream_body(&mut self, file: &mut File, size_bytes: u64) -> Result<(), SendError> {
        let mut remaining = size_bytes;
        let mut buffer = vec![0_u8; MAX_CHUNK_BYTES];
        while remaining > 0 {
            let want = remaining.min(MAX_CHUNK_BYTES as u64) as usize;
            let read = file
                .read(&mut buffer[..want])
                .await
                .map_err(|source| SendError::File {
                    path: PathBuf::new(),
                    source,
                })?;
            if read == 0 {
                // The file shrank; the receiver reports the shortfall.
                break;
            }
            self.send(WireMessage::Chunk(buffer[..read].to_vec().into()))
                .await?;
            remaining -= read as u64;
        }
        Ok(())
    }
}
