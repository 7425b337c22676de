mod common;

use common::ssh_server::{Listen, SshServer, PASSWORD, USER};
use common::*;
use portkeeper_lib::database::models::AuthType;
use portkeeper_lib::{ReverseSpec, RuleStatus, TunnelError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn spec(ssh_port: u16, auth_type: AuthType) -> ReverseSpec {
    ReverseSpec {
        ssh_host: "127.0.0.1".into(),
        ssh_port,
        ssh_user: USER.into(),
        auth_type,
        password: Some(PASSWORD.into()),
        private_key_path: None,
        remote_bind_host: "127.0.0.1".into(),
        remote_port: 9000,
        local_port: 3000,
    }
}

#[tokio::test]
async fn missing_password_persists_an_error_record() {
    let mut h = harness();
    let mut spec = spec(22, AuthType::Password);
    spec.password = None;

    let result = h.service.start_reverse_tunnel(spec, None).await;
    assert!(matches!(result, Err(TunnelError::Config(_))));

    let id = "127.0.0.1:9000<-3000";
    let (status, error) = next_status(&mut h.events, id).await;
    assert_eq!(status, RuleStatus::Error);
    assert!(error.unwrap().contains("password"));

    let rule = h.store.find(id).await.unwrap();
    assert_eq!(rule.status, RuleStatus::Error);
    assert!(h.service.registry().live_ids().is_empty());
}

#[tokio::test]
async fn unreadable_key_file_is_a_config_error() {
    let h = harness();
    let mut spec = spec(22, AuthType::Key);
    spec.private_key_path = Some("/definitely/not/here/id_ed25519".into());

    let result = h
        .service
        .start_reverse_tunnel(spec, Some("office".into()))
        .await;
    assert!(matches!(result, Err(TunnelError::Config(_))));
    assert_eq!(status_of(&h.store, "office").await, Some(RuleStatus::Error));
    assert!(h.service.registry().live_ids().is_empty());
}

#[tokio::test]
async fn refused_ssh_host_ends_in_error() {
    let mut h = harness();
    let ssh_port = free_port().await;

    let id = h
        .service
        .start_reverse_tunnel(spec(ssh_port, AuthType::Password), None)
        .await
        .unwrap();

    let (status, error) = next_status(&mut h.events, &id).await;
    assert_eq!(status, RuleStatus::Error);
    assert!(!error.unwrap().is_empty());
    assert!(!h.service.registry().is_live(&id));
    assert_eq!(status_of(&h.store, &id).await, Some(RuleStatus::Error));
}

#[tokio::test]
async fn stop_interrupts_a_pending_handshake() {
    let mut h = harness();
    let (ssh_port, _silent) = silent_server().await;

    let id = h
        .service
        .start_reverse_tunnel(spec(ssh_port, AuthType::Password), Some("stuck".into()))
        .await
        .unwrap();
    assert_eq!(id, "stuck");
    assert!(h.service.registry().is_live(&id));

    // A second start while the handshake hangs is a no-op.
    h.service
        .start_reverse_tunnel(spec(ssh_port, AuthType::Password), Some("stuck".into()))
        .await
        .unwrap();
    assert_eq!(h.service.registry().live_ids(), vec![id.clone()]);

    h.service.stop(&id).await.unwrap();
    assert_eq!(next_status(&mut h.events, &id).await, (RuleStatus::Stopped, None));
    assert!(!h.service.registry().is_live(&id));
    assert_eq!(status_of(&h.store, &id).await, Some(RuleStatus::Stopped));
}

#[tokio::test]
async fn granted_remote_listen_runs_and_relays_to_the_local_port() {
    let mut h = harness();
    let server = SshServer::start(Listen::Grant).await;
    let (local_port, _echo) = echo_server().await;
    let mut spec = spec(server.port, AuthType::Password);
    spec.local_port = local_port;

    let id = h.service.start_reverse_tunnel(spec, None).await.unwrap();
    assert_eq!(id, format!("127.0.0.1:9000<-{local_port}"));
    assert_eq!(next_status(&mut h.events, &id).await, (RuleStatus::Running, None));
    assert_eq!(status_of(&h.store, &id).await, Some(RuleStatus::Running));

    let listener = server.wait_for_listener().await;
    assert_eq!((listener.address.as_str(), listener.port), ("127.0.0.1", 9000));

    let mut channel = listener.connect("198.51.100.7", 40000).await;
    channel.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    tokio::time::timeout(WAIT, channel.read_exact(&mut buf))
        .await
        .expect("no reply through the tunnel")
        .unwrap();
    assert_eq!(&buf, b"ping");
    assert_eq!(h.service.registry().connection_count(&id), 1);

    h.service.stop(&id).await.unwrap();
}

#[tokio::test]
async fn forwarded_channel_without_local_service_fails_alone() {
    let mut h = harness();
    let server = SshServer::start(Listen::Grant).await;
    let local_port = free_port().await;
    let mut spec = spec(server.port, AuthType::Password);
    spec.local_port = local_port;

    let id = h.service.start_reverse_tunnel(spec, None).await.unwrap();
    assert_eq!(next_status(&mut h.events, &id).await.0, RuleStatus::Running);

    let listener = server.wait_for_listener().await;
    let mut channel = listener.connect("198.51.100.7", 40001).await;
    let error = next_connection_failure(&mut h.events, &id).await;
    assert!(error.contains(&local_port.to_string()));

    // The channel is closed and the session keeps running.
    let mut buf = Vec::new();
    let _ = tokio::time::timeout(WAIT, channel.read_to_end(&mut buf)).await;
    assert!(buf.is_empty());
    assert!(h.service.registry().is_live(&id));
    assert_eq!(status_of(&h.store, &id).await, Some(RuleStatus::Running));

    h.service.stop(&id).await.unwrap();
}

#[tokio::test]
async fn refused_remote_listen_ends_in_error() {
    let mut h = harness();
    let server = SshServer::start(Listen::Refuse).await;

    let id = h
        .service
        .start_reverse_tunnel(spec(server.port, AuthType::Password), Some("refused".into()))
        .await
        .unwrap();

    let (status, error) = next_status(&mut h.events, &id).await;
    assert_eq!(status, RuleStatus::Error);
    assert!(error.unwrap().contains("rejected"));
    wait_until(|| !h.service.registry().is_live(&id)).await;
    assert!(h.service.registry().live_ids().is_empty());
    assert_eq!(status_of(&h.store, &id).await, Some(RuleStatus::Error));
}

#[tokio::test]
async fn clean_server_disconnect_ends_as_stopped() {
    let mut h = harness();
    let server = SshServer::start(Listen::Grant).await;

    let id = h
        .service
        .start_reverse_tunnel(spec(server.port, AuthType::Password), None)
        .await
        .unwrap();
    assert_eq!(next_status(&mut h.events, &id).await.0, RuleStatus::Running);

    server.wait_for_listener().await.disconnect().await;

    assert_eq!(next_status(&mut h.events, &id).await, (RuleStatus::Stopped, None));
    wait_until(|| !h.service.registry().is_live(&id)).await;
    assert_eq!(status_of(&h.store, &id).await, Some(RuleStatus::Stopped));
}

#[tokio::test]
async fn stop_withdraws_the_listener_and_closes_the_session() {
    let mut h = harness();
    let server = SshServer::start(Listen::Grant).await;

    let id = h
        .service
        .start_reverse_tunnel(spec(server.port, AuthType::Password), None)
        .await
        .unwrap();
    assert_eq!(next_status(&mut h.events, &id).await.0, RuleStatus::Running);
    server.wait_for_listener().await;

    h.service.stop(&id).await.unwrap();
    assert_eq!(next_status(&mut h.events, &id).await, (RuleStatus::Stopped, None));
    assert!(!h.service.registry().is_live(&id));
    assert_eq!(status_of(&h.store, &id).await, Some(RuleStatus::Stopped));

    wait_until(|| server.cancelled_listeners() == 1).await;
    wait_until(|| server.closed_sessions() == 1).await;
}
