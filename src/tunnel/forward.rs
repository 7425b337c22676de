//! Local TCP forwards: one listening socket per rule, one bridged task per
//! accepted connection.

use crate::database::models::{ForwardSpec, RuleSpec, RuleStatus};
use crate::error::{TunnelError, TunnelResult};
use crate::tunnel::bridge::{bridge, BridgeEnd};
use crate::tunnel::registry::{ConnectionSet, EngineKind, LiveEngine};
use crate::tunnel::{dial, EngineContext};
use log::{debug, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Starts the forward described by `spec` and returns its id. Starting a rule
/// that already has a live listener does nothing.
pub async fn start(ctx: &EngineContext, spec: ForwardSpec) -> TunnelResult<String> {
    let rule_spec = RuleSpec::Forward(spec.clone());
    rule_spec.validate().map_err(TunnelError::Config)?;

    let id = spec.derive_id();
    // The record is written under the gate so a concurrent delete cannot
    // leave a listener behind without one.
    let guard = ctx.registry.lock(&id).await;
    ctx.store.ensure(&id, rule_spec).await?;
    if guard.is_live() {
        debug!("Forward {} is already listening", id);
        return Ok(id);
    }

    let bind_addr = format!("{}:{}", ctx.settings.forward_bind_host, spec.local_port);
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            let message = format!("Failed to listen on {bind_addr}: {e}");
            ctx.publish_status(&id, RuleStatus::Error, Some(message.clone()))
                .await;
            return Err(TunnelError::Resource(message));
        }
    };
    info!(
        "Forward {} listening on {} -> {}:{}",
        id, bind_addr, spec.remote_host, spec.remote_port
    );

    let instance = Uuid::new_v4();
    let cancel = CancellationToken::new();
    let connections = ConnectionSet::new(cancel.child_token());
    let task = tokio::spawn(serve(
        ctx.clone(),
        id.clone(),
        spec,
        listener,
        instance,
        cancel.clone(),
        Arc::clone(&connections),
    ));

    guard.insert(LiveEngine::new(
        instance,
        EngineKind::Listener,
        cancel,
        task,
        connections,
    ));
    ctx.publish_status(&id, RuleStatus::Running, None).await;
    Ok(id)
}

async fn serve(
    ctx: EngineContext,
    id: String,
    spec: ForwardSpec,
    listener: TcpListener,
    instance: Uuid,
    cancel: CancellationToken,
    connections: Arc<ConnectionSet>,
) {
    let target = format!("{}:{}", spec.remote_host, spec.remote_port);

    let failure = loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Listener for {} cancelled", id);
                return;
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((socket, peer)) => {
                let ctx = ctx.clone();
                let id = id.clone();
                let target = target.clone();
                connections.spawn(move |cancel| relay(ctx, id, target, socket, peer, cancel));
            }
            Err(e) if is_transient(&e) => {
                warn!("Accept on {} failed, retrying: {}", id, e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
            Err(e) => break format!("Listener on port {} failed: {}", spec.local_port, e),
        }
    };

    drop(listener);
    ctx.retire(&id, instance, &cancel, RuleStatus::Error, Some(failure))
        .await;
}

async fn relay(
    ctx: EngineContext,
    id: String,
    target: String,
    inbound: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    let outbound = tokio::select! {
        _ = cancel.cancelled() => return,
        dialed = dial(&ctx, &target) => dialed,
    };
    let outbound = match outbound {
        Ok(stream) => stream,
        Err(e) => {
            // Dropping `inbound` closes the accepted socket.
            ctx.connection_failed(&id, &e);
            return;
        }
    };

    debug!("Bridging {} -> {} for {}", peer, target, id);
    let outcome = bridge(inbound, outbound, cancel).await;
    if let BridgeEnd::Error(e) = &outcome.end {
        debug!("Connection {} on {} ended with error: {}", peer, id, e);
    }
}

/// Errors that concern a single pending connection or a momentary resource
/// shortage rather than the listening socket itself.
fn is_transient(e: &io::Error) -> bool {
    if matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) {
        return true;
    }
    // EMFILE, ENFILE, ENOMEM
    cfg!(unix) && matches!(e.raw_os_error(), Some(24) | Some(23) | Some(12))
}
