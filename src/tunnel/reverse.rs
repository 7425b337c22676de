//! Reverse SSH tunnels: one authenticated session per rule holding a remote
//! listen request; every forwarded channel is bridged to a local service.

use crate::database::models::{ReverseSpec, RuleSpec, RuleStatus};
use crate::error::{TunnelError, TunnelResult};
use crate::tunnel::bridge::bridge;
use crate::tunnel::model::SshConnectConfig;
use crate::tunnel::registry::{ConnectionSet, EngineKind, LiveEngine};
use crate::tunnel::ssh::{SessionEvent, SshSession, CLOSE_TIMEOUT};
use crate::tunnel::{dial, EngineContext};
use log::{debug, info};
use russh::client::Msg;
use russh::Channel;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Registers a session for the rule and returns its id without waiting for
/// the handshake; the outcome arrives as status events.
///
/// A blank `id` falls back to the one derived from the addressing fields.
pub async fn start(
    ctx: &EngineContext,
    spec: ReverseSpec,
    id: Option<String>,
) -> TunnelResult<String> {
    let rule_spec = RuleSpec::ReverseSsh(spec.clone());
    rule_spec.validate().map_err(TunnelError::Config)?;

    let id = id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| spec.derive_id());
    let guard = ctx.registry.lock(&id).await;
    ctx.store.ensure(&id, rule_spec).await?;
    if guard.is_live() {
        debug!("Reverse tunnel {} already has a session", id);
        return Ok(id);
    }

    let config = match SshConnectConfig::try_from(&spec) {
        Ok(config) => config,
        Err(e) => {
            ctx.publish_status(&id, RuleStatus::Error, Some(e.to_string()))
                .await;
            return Err(e);
        }
    };

    info!(
        "Opening SSH session {}@{} for {}",
        config.ssh_user,
        config.target(),
        id
    );
    let instance = Uuid::new_v4();
    let cancel = CancellationToken::new();
    let connections = ConnectionSet::new(cancel.child_token());
    let task = tokio::spawn(run_session(
        ctx.clone(),
        id.clone(),
        config,
        instance,
        cancel.clone(),
        Arc::clone(&connections),
    ));

    guard.insert(LiveEngine::new(
        instance,
        EngineKind::Session,
        cancel,
        task,
        connections,
    ));
    Ok(id)
}

async fn run_session(
    ctx: EngineContext,
    id: String,
    config: SshConnectConfig,
    instance: Uuid,
    cancel: CancellationToken,
    connections: Arc<ConnectionSet>,
) {
    let established = tokio::select! {
        _ = cancel.cancelled() => {
            debug!("Handshake for {} interrupted", id);
            return;
        }
        established = SshSession::establish(&config, &ctx.settings) => established,
    };

    let mut session = match established {
        Ok(session) => session,
        Err(e) => {
            let message = format!("{e:#}");
            ctx.retire(&id, instance, &cancel, RuleStatus::Error, Some(message))
                .await;
            return;
        }
    };

    // `running` goes out under the gate so a concurrent stop publishes after it.
    {
        let guard = tokio::select! {
            guard = ctx.registry.lock(&id) => guard,
            _ = cancel.cancelled() => {
                close(&mut session).await;
                return;
            }
        };
        if !guard.holds(instance) {
            drop(guard);
            close(&mut session).await;
            return;
        }
        ctx.publish_status(&id, RuleStatus::Running, None).await;
    }

    let (status, error) = loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => {
                close(&mut session).await;
                return;
            }
            event = session.next_event() => event,
        };

        match event {
            Some(SessionEvent::Forwarded {
                channel,
                originator,
            }) => {
                let ctx = ctx.clone();
                let id = id.clone();
                let local_port = config.local_port;
                connections.spawn(move |cancel| {
                    relay(ctx, id, local_port, channel, originator, cancel)
                });
            }
            Some(SessionEvent::Disconnected(None)) => break (RuleStatus::Stopped, None),
            Some(SessionEvent::Disconnected(Some(e))) => {
                break (
                    RuleStatus::Error,
                    Some(format!("SSH session to {} lost: {}", config.target(), e)),
                )
            }
            None => {
                break (
                    RuleStatus::Error,
                    Some(format!("SSH session to {} closed unexpectedly", config.target())),
                )
            }
        }
    };

    ctx.retire(&id, instance, &cancel, status, error).await;
}

async fn close(session: &mut SshSession) {
    if tokio::time::timeout(CLOSE_TIMEOUT, session.close())
        .await
        .is_err()
    {
        debug!("SSH disconnect did not finish within {:?}", CLOSE_TIMEOUT);
    }
}

async fn relay(
    ctx: EngineContext,
    id: String,
    local_port: u16,
    channel: Channel<Msg>,
    originator: String,
    cancel: CancellationToken,
) {
    let target = format!("127.0.0.1:{local_port}");
    let local = tokio::select! {
        _ = cancel.cancelled() => return,
        dialed = dial(&ctx, &target) => dialed,
    };
    let local = match local {
        Ok(stream) => stream,
        Err(e) => {
            let _ = channel.close().await;
            ctx.connection_failed(&id, &e);
            return;
        }
    };

    debug!("Bridging {} -> {} for {}", originator, target, id);
    let outcome = bridge(channel.into_stream(), local, cancel).await;
    debug!("Tunneled connection from {} on {} closed: {:?}", originator, id, outcome.end);
}
