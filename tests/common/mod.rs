#![allow(dead_code)]

pub mod ssh_server;

use portkeeper_lib::database::models::AppSettings;
use portkeeper_lib::events::{EventBus, RuleEvent};
use portkeeper_lib::store::RuleStore;
use portkeeper_lib::{RuleStatus, TunnelService};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn test_settings() -> AppSettings {
    AppSettings {
        connect_timeout_secs: 1,
        ssh_timeout_secs: 5,
        shutdown_grace_secs: 1,
        forward_bind_host: "127.0.0.1".into(),
        ..AppSettings::default()
    }
}

pub struct Harness {
    pub service: TunnelService,
    pub store: Arc<RuleStore>,
    pub events: Receiver<RuleEvent>,
}

pub fn harness_with_store(store: Arc<RuleStore>) -> Harness {
    init_logger();
    let bus = EventBus::default();
    let events = bus.subscribe();
    let service = TunnelService::new(Arc::clone(&store), Arc::new(bus), test_settings());
    Harness {
        service,
        store,
        events,
    }
}

pub fn harness() -> Harness {
    harness_with_store(Arc::new(RuleStore::in_memory()))
}

/// A loopback port nothing is listening on right now.
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

pub async fn echo_server() -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (port, tokio::spawn(serve_echo(listener)))
}

pub async fn echo_server_on(port: u16) -> JoinHandle<()> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    tokio::spawn(serve_echo(listener))
}

async fn serve_echo(listener: TcpListener) {
    loop {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        tokio::spawn(async move {
            let (mut reader, mut writer) = socket.split();
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
            let _ = writer.shutdown().await;
        });
    }
}

/// Accepts TCP connections and never says anything back.
pub async fn silent_server() -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let task = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    (port, task)
}

pub async fn ping(port: u16) -> TcpStream {
    use tokio::io::AsyncReadExt;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    tokio::time::timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&buf, b"ping");
    stream
}

pub async fn is_refused(port: u16) -> bool {
    TcpStream::connect(("127.0.0.1", port)).await.is_err()
}

pub async fn next_status(events: &mut Receiver<RuleEvent>, id: &str) -> (RuleStatus, Option<String>) {
    tokio::time::timeout(WAIT, async {
        loop {
            if let RuleEvent::StatusChanged {
                id: changed,
                status,
                error,
            } = events.recv().await.unwrap()
            {
                if changed == id {
                    return (status, error);
                }
            }
        }
    })
    .await
    .expect("no status event")
}

pub async fn next_connection_failure(events: &mut Receiver<RuleEvent>, id: &str) -> String {
    tokio::time::timeout(WAIT, async {
        loop {
            if let RuleEvent::ConnectionFailed { id: failed, error } = events.recv().await.unwrap() {
                if failed == id {
                    return error;
                }
            }
        }
    })
    .await
    .expect("no connection failure event")
}

/// Every status event queued so far for `id`.
pub fn drain_statuses(events: &mut Receiver<RuleEvent>, id: &str) -> Vec<RuleStatus> {
    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let RuleEvent::StatusChanged {
            id: changed,
            status,
            ..
        } = event
        {
            if changed == id {
                statuses.push(status);
            }
        }
    }
    statuses
}

pub async fn wait_until<F: Fn() -> bool>(check: F) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

pub async fn status_of(store: &RuleStore, id: &str) -> Option<RuleStatus> {
    store.find(id).await.map(|rule| rule.status)
}
