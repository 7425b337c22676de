//! In-process SSH server that grants (or refuses) remote listen requests and
//! lets a test push forwarded connections through them.

use russh::server::{self, Auth, Msg, Session};
use russh::{ChannelStream, Disconnect};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const USER: &str = "tunnel";
pub const PASSWORD: &str = "hunter2";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Listen {
    Grant,
    Refuse,
}

#[derive(Default)]
struct Recorded {
    listeners: Mutex<Vec<RemoteListener>>,
    cancelled: AtomicUsize,
    closed: AtomicUsize,
}

/// A granted `tcpip-forward` request and the session that made it.
#[derive(Clone)]
pub struct RemoteListener {
    handle: server::Handle,
    pub address: String,
    pub port: u32,
}

impl RemoteListener {
    /// Pretends a client from `originator` connected to the remote listener.
    pub async fn connect(&self, originator: &str, originator_port: u32) -> ChannelStream<Msg> {
        self.handle
            .channel_open_forwarded_tcpip(
                self.address.clone(),
                self.port,
                originator.to_string(),
                originator_port,
            )
            .await
            .unwrap()
            .into_stream()
    }

    /// Ends the session from the server side with a proper disconnect message.
    pub async fn disconnect(&self) {
        self.handle
            .disconnect(Disconnect::ByApplication, "going away".into(), "en".into())
            .await
            .unwrap();
    }
}

pub struct SshServer {
    pub port: u16,
    recorded: Arc<Recorded>,
    task: JoinHandle<()>,
}

impl SshServer {
    pub async fn start(listen: Listen) -> Self {
        let key = russh::keys::load_secret_key(
            concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/server_keys/ssh"),
            None,
        )
        .unwrap();
        let config = Arc::new(server::Config {
            keys: vec![key],
            auth_rejection_time_initial: Some(std::time::Duration::from_secs(0)),
            ..Default::default()
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let recorded = Arc::new(Recorded::default());

        let task = {
            let recorded = Arc::clone(&recorded);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let handler = FixtureHandler {
                        listen,
                        recorded: Arc::clone(&recorded),
                    };
                    let config = Arc::clone(&config);
                    let recorded = Arc::clone(&recorded);
                    tokio::spawn(async move {
                        if let Ok(session) = server::run_stream(config, stream, handler).await {
                            let _ = session.await;
                        }
                        recorded.closed.fetch_add(1, Ordering::SeqCst);
                    });
                }
            })
        };

        Self {
            port,
            recorded,
            task,
        }
    }

    /// The first remote listener a client was granted.
    pub async fn wait_for_listener(&self) -> RemoteListener {
        super::wait_until(|| !self.recorded.listeners.lock().unwrap().is_empty()).await;
        self.recorded.listeners.lock().unwrap()[0].clone()
    }

    pub fn cancelled_listeners(&self) -> usize {
        self.recorded.cancelled.load(Ordering::SeqCst)
    }

    pub fn closed_sessions(&self) -> usize {
        self.recorded.closed.load(Ordering::SeqCst)
    }
}

impl Drop for SshServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct FixtureHandler {
    listen: Listen,
    recorded: Arc<Recorded>,
}

impl server::Handler for FixtureHandler {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if user == USER && password == PASSWORD {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.listen == Listen::Refuse {
            return Ok(false);
        }
        self.recorded
            .listeners
            .lock()
            .unwrap()
            .push(RemoteListener {
                handle: session.handle(),
                address: address.to_string(),
                port: *port,
            });
        Ok(true)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        _address: &str,
        _port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.recorded.cancelled.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}
