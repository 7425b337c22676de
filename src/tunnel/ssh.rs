use crate::database::models::AppSettings;
use crate::tunnel::model::{SshConnectConfig, TunnelAuth};
use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use russh::client::{self, DisconnectReason, Handle, Msg};
use russh::keys::{load_secret_key, PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, Disconnect};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

/// Upper bound for the best-effort teardown in [`SshSession::close`].
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// What the SSH event loop reports back to the session task.
pub enum SessionEvent {
    /// The server accepted a connection on the remote listener.
    Forwarded {
        channel: Channel<Msg>,
        originator: String,
    },
    /// `None` when the server disconnected cleanly.
    Disconnected(Option<String>),
}

pub struct ClientHandler {
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!("Accepting server key {:?}", server_public_key.algorithm());
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "Forwarded connection on {}:{} from {}:{}",
            connected_address, connected_port, originator_address, originator_port
        );
        let event = SessionEvent::Forwarded {
            channel,
            originator: format!("{originator_address}:{originator_port}"),
        };
        if self.events.send(event).is_err() {
            debug!("Session task is gone, dropping forwarded channel");
        }
        Ok(())
    }

    async fn disconnected(
        &mut self,
        reason: DisconnectReason<Self::Error>,
    ) -> Result<(), Self::Error> {
        let error = match reason {
            DisconnectReason::ReceivedDisconnect(msg) => {
                info!("Server closed the session: {:?}", msg);
                None
            }
            DisconnectReason::Error(e) => Some(e.to_string()),
        };
        let _ = self.events.send(SessionEvent::Disconnected(error));
        Ok(())
    }
}

/// An authenticated session with an active remote listen request.
pub struct SshSession {
    handle: Handle<ClientHandler>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    bind_host: String,
    bound_port: u32,
}

impl SshSession {
    /// Connects, authenticates and asks the server to listen on
    /// `remote_bind_host:remote_port`, each step bounded by the SSH timeout.
    pub async fn establish(config: &SshConnectConfig, settings: &AppSettings) -> Result<Self> {
        let limit = settings.ssh_timeout();
        let (handle, events) = timeout(limit, connect(config, settings))
            .await
            .map_err(|_| anyhow!("Timed out connecting to {} after {:?}", config.target(), limit))??;

        let mut session = Self {
            handle,
            events,
            bind_host: config.remote_bind_host.clone(),
            bound_port: u32::from(config.remote_port),
        };

        let listen = timeout(
            limit,
            session
                .handle
                .tcpip_forward(config.remote_bind_host.clone(), u32::from(config.remote_port)),
        )
        .await;

        let bound_port = match listen {
            Ok(Ok(port)) => port,
            Ok(Err(e)) => {
                session.close().await;
                return Err(anyhow!(
                    "Remote listen on {}:{} was rejected: {}",
                    config.remote_bind_host,
                    config.remote_port,
                    e
                ));
            }
            Err(_) => {
                session.close().await;
                return Err(anyhow!(
                    "Timed out requesting remote listen on {}:{}",
                    config.remote_bind_host,
                    config.remote_port
                ));
            }
        };
        // Port 0 asks the server to pick one.
        if bound_port != 0 {
            session.bound_port = bound_port;
        }

        info!(
            "Remote listener {}:{} on {} relays to 127.0.0.1:{}",
            session.bind_host,
            session.bound_port,
            config.target(),
            config.local_port
        );
        Ok(session)
    }

    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Best-effort teardown: withdraw the remote listener, then disconnect.
    pub async fn close(&mut self) {
        if let Err(e) = self
            .handle
            .cancel_tcpip_forward(self.bind_host.clone(), self.bound_port)
            .await
        {
            debug!("Failed to cancel remote listener: {}", e);
        }
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "tunnel stopped", "en")
            .await
        {
            debug!("Failed to disconnect SSH session: {}", e);
        }
    }
}

async fn connect(
    config: &SshConnectConfig,
    settings: &AppSettings,
) -> Result<(Handle<ClientHandler>, mpsc::UnboundedReceiver<SessionEvent>)> {
    let ssh_config = Arc::new(client::Config {
        keepalive_interval: Some(settings.keep_alive()),
        keepalive_max: settings.keep_alive_max as usize,
        ..Default::default()
    });

    let target = config.target();
    debug!("Connecting to {}", target);
    let ssh_addr = tokio::net::lookup_host(&target)
        .await
        .with_context(|| format!("Failed to resolve {target}"))?
        .next()
        .ok_or_else(|| anyhow!("{target} resolved but no address was found"))?;

    let (tx, rx) = mpsc::unbounded_channel();
    let handler = ClientHandler { events: tx };

    let mut session = client::connect(ssh_config, ssh_addr, handler)
        .await
        .with_context(|| format!("Failed to connect to {target}"))?;

    let auth_res = match &config.auth {
        TunnelAuth::Password(password) => session
            .authenticate_password(&config.ssh_user, password)
            .await
            .context("Password authentication failed")?,
        TunnelAuth::Key(key_path) => {
            let key_pair = load_secret_key(key_path, None)
                .with_context(|| format!("Failed to load private key {}", key_path.display()))?;
            session
                .authenticate_publickey(
                    &config.ssh_user,
                    PrivateKeyWithHashAlg::new(
                        Arc::new(key_pair),
                        session.best_supported_rsa_hash().await?.flatten(),
                    ),
                )
                .await
                .context("Public key authentication failed")?
        }
    };

    if !auth_res.success() {
        warn!("Authentication rejected for {}@{}", config.ssh_user, target);
        return Err(anyhow!(
            "Authentication failed for {}@{}",
            config.ssh_user,
            target
        ));
    }

    debug!("Authenticated {}@{}", config.ssh_user, target);
    Ok((session, rx))
}
