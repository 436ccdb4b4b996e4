use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::stream::{self, BoxStream, StreamExt};
use manuscripts_core::{
    AdvertisementHandle, Advertiser, Browser, DiscoveryError, DiscoveryEvent, FailureReason,
    KdfParams, ReceiverMode, ServiceRecord,
};
use manuscripts_receiver::{
    AppState, CredentialStore, EventBus, NamingScheme, RunningReceiver, ServerSettings,
    StartOptions, Store,
};
use manuscripts_sender::{SendError, SubmitOptions, resolve_by_name, submit_file, submit_to_record};
use tempfile::TempDir;
use tokio::net::TcpListener;

const PASSPHRASE: &str = "correct horse";

/// Loops published records straight back to browsers, standing in for mDNS.
#[derive(Default)]
struct LoopbackDirectory {
    records: Mutex<Vec<ServiceRecord>>,
}

impl Advertiser for LoopbackDirectory {
    fn publish(&self, record: &ServiceRecord) -> Result<AdvertisementHandle, DiscoveryError> {
        self.records.lock().unwrap().push(record.clone());
        Ok(AdvertisementHandle::new(record.instance_id.clone()))
    }

    fn withdraw(&self, handle: &AdvertisementHandle) -> Result<(), DiscoveryError> {
        self.records
            .lock()
            .unwrap()
            .retain(|record| record.instance_id != handle.fullname());
        Ok(())
    }
}

impl Browser for LoopbackDirectory {
    fn browse(&self) -> Result<BoxStream<'static, DiscoveryEvent>, DiscoveryError> {
        let current: Vec<DiscoveryEvent> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .map(DiscoveryEvent::Added)
            .collect();
        Ok(stream::iter(current).chain(stream::pending()).boxed())
    }
}

struct Classroom {
    receiver: RunningReceiver,
    inbox: TempDir,
    directory: Arc<LoopbackDirectory>,
}

async fn start_receiver(name: &str, passphrase: Option<&str>) -> Classroom {
    let inbox = tempfile::tempdir().expect("tempdir");
    let identity = Arc::new(CredentialStore::with_kdf(KdfParams {
        memory_kib: 1024,
        iterations: 1,
        parallelism: 1,
    }));
    identity.configure(name, passphrase).expect("configure");
    let store = Arc::new(Store::open(inbox.path(), NamingScheme::OriginalName).expect("store"));
    let state = AppState::new(identity, store, EventBus::new(), ServerSettings::default());
    let directory = Arc::new(LoopbackDirectory::default());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let receiver = RunningReceiver::start(
        listener,
        state,
        directory.clone(),
        StartOptions {
            mode: ReceiverMode::Receiver,
            advertised_host: "127.0.0.1".to_owned(),
            grace_period: Duration::from_secs(2),
        },
    )
    .await
    .expect("start receiver");
    Classroom {
        receiver,
        inbox,
        directory,
    }
}

fn write_draft(dir: &TempDir, name: &str, body: &[u8]) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, body).expect("write draft");
    path
}

#[tokio::test]
async fn discovered_receiver_stores_the_file() {
    let room = start_receiver("Room 204", None).await;
    let drafts = tempfile::tempdir().expect("tempdir");
    let body: Vec<u8> = (0..150_000_u32).map(|i| (i % 13) as u8).collect();
    let path = write_draft(&drafts, "essay.pdf", &body);

    let record = resolve_by_name(room.directory.as_ref(), "room 204", Duration::from_secs(2))
        .await
        .expect("browse")
        .expect("receiver found");
    let receipt = submit_to_record(&record, &path, &SubmitOptions::new("Ada Lovelace"))
        .await
        .expect("submit");

    assert_eq!(receipt.stored_name, "essay.pdf");
    assert_eq!(receipt.size_bytes, body.len() as u64);
    assert_eq!(receipt.session_id.len(), 16);
    assert_eq!(
        std::fs::read(room.inbox.path().join("essay.pdf")).expect("stored file"),
        body
    );

    room.receiver.shutdown().await;
    assert!(room.directory.records.lock().unwrap().is_empty());
}

#[tokio::test]
async fn second_copy_gets_a_suffixed_name() {
    let room = start_receiver("Room 204", None).await;
    let drafts = tempfile::tempdir().expect("tempdir");
    let path = write_draft(&drafts, "essay.pdf", b"first");
    let url = room.receiver.record().submit_url();
    let options = SubmitOptions::new("Sam");

    let first = submit_file(&url, &path, &options).await.expect("first");
    let second = submit_file(&url, &path, &options).await.expect("second");
    assert_eq!(first.stored_name, "essay.pdf");
    assert_eq!(second.stored_name, "essay (1).pdf");

    room.receiver.shutdown().await;
}

#[tokio::test]
async fn passphrase_challenge_is_answered() {
    let room = start_receiver("Lab", Some(PASSPHRASE)).await;
    let drafts = tempfile::tempdir().expect("tempdir");
    let path = write_draft(&drafts, "report.txt", b"results");
    let url = room.receiver.record().submit_url();

    let receipt = submit_file(
        &url,
        &path,
        &SubmitOptions::new("Sam").with_passphrase(format!("  {PASSPHRASE} ")),
    )
    .await
    .expect("submit with passphrase");
    assert_eq!(receipt.stored_name, "report.txt");

    let err = submit_file(&url, &path, &SubmitOptions::new("Sam"))
        .await
        .unwrap_err();
    assert!(matches!(err, SendError::PassphraseRequired), "{err:?}");

    room.receiver.shutdown().await;
}

#[tokio::test]
async fn wrong_passphrase_is_a_typed_rejection() {
    let room = start_receiver("Lab", Some(PASSPHRASE)).await;
    let drafts = tempfile::tempdir().expect("tempdir");
    let path = write_draft(&drafts, "report.txt", b"results");

    let err = submit_file(
        &room.receiver.record().submit_url(),
        &path,
        &SubmitOptions::new("Sam").with_passphrase("battery staple"),
    )
    .await
    .unwrap_err();
    assert_eq!(err.failure_reason(), Some(FailureReason::AuthenticationFailed));
    assert!(std::fs::read_dir(room.inbox.path()).expect("inbox").next().is_none());

    room.receiver.shutdown().await;
}

#[tokio::test]
async fn closed_port_is_unreachable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let drafts = tempfile::tempdir().expect("tempdir");
    let path = write_draft(&drafts, "essay.pdf", b"x");
    let err = submit_file(&format!("ws://{addr}/submit"), &path, &SubmitOptions::new("Sam"))
        .await
        .unwrap_err();
    assert!(matches!(err, SendError::Unreachable(_)), "{err:?}");
}
