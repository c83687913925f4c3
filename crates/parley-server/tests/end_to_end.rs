//! Full stack over a real socket: server, store, client engine and session.

use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;

use parley_client::{
    ChatSession, ClientConfig, MemorySecretStore, ParleyClient, SessionEvent, StopReason,
};
use parley_server::admin::handle_admin_event;
use parley_server::registry::ConnectionId;
use parley_server::{serve_on, AppState, ServerConfig};
use parley_shared::constants::SENT_ENCRYPTED_NOTICE;
use parley_shared::protocol::{ClientEvent, ServerEvent};
use parley_shared::types::{PresenceStatus, UserId};
use parley_store::Database;

async fn start_server() -> (ClientConfig, AppState) {
    let config = ServerConfig {
        admin_token: Some("tok".into()),
        rate_limit_burst: 1_000.0,
        ..ServerConfig::default()
    };
    let state = AppState::new(config, Database::open_in_memory().unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve_on(state.clone(), listener));

    let client_config = ClientConfig {
        reconnect_delay: Duration::from_millis(50),
        max_reconnect_attempts: 2,
        ..ClientConfig::new(format!("http://{addr}"))
    };
    (client_config, state)
}

async fn client(config: &ClientConfig, name: &str) -> ParleyClient {
    let client = ParleyClient::new(
        config.clone(),
        UserId::from(name),
        Box::new(MemorySecretStore::new()),
    )
    .unwrap();
    client.register().await.unwrap();
    client
}

async fn wait_for<F>(session: &mut ChatSession, mut matches: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = session.next_event().await.expect("session ended");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

/// Connected and registered: the presence snapshot has arrived.
async fn online(client: &ParleyClient) -> ChatSession {
    let mut session = client.connect();
    wait_for(&mut session, |e| {
        matches!(e, SessionEvent::Server(ServerEvent::OnlineUsersList { .. }))
    })
    .await;
    session
}

fn new_message(event: SessionEvent) -> parley_shared::types::Message {
    match event {
        SessionEvent::Server(ServerEvent::NewMessage { message, .. }) => message,
        other => panic!("expected new_message, got {other:?}"),
    }
}

#[tokio::test]
async fn test_direct_message_read_state_and_presence() {
    let (config, _state) = start_server().await;
    let alice = client(&config, "alice").await;
    let bob = client(&config, "bob").await;

    let mut bob_session = online(&bob).await;
    let alice_session = online(&alice).await;
    wait_for(&mut bob_session, |e| {
        matches!(e, SessionEvent::Server(ServerEvent::UserStatusUpdate { user_id, status })
            if user_id.as_str() == "alice" && *status == PresenceStatus::Online)
    })
    .await;
    assert!(bob_session.presence().await.is_online(alice.user()));

    let sent = alice.send_direct(bob.user(), "hi").await.unwrap();
    assert!(!sent.encryption_unavailable);
    assert_ne!(sent.message.content, "hi");
    assert_eq!(alice.open_message(&sent.message).await, SENT_ENCRYPTED_NOTICE);

    let event = wait_for(&mut bob_session, |e| {
        matches!(e, SessionEvent::Server(ServerEvent::NewMessage { .. }))
    })
    .await;
    let received = new_message(event);
    assert_eq!(received.id, sent.message.id);
    assert_eq!(bob.open_message(&received).await, "hi");

    // Exactly one delivery.
    let extra = tokio::time::timeout(Duration::from_millis(200), async {
        loop {
            if let Some(SessionEvent::Server(ServerEvent::NewMessage { .. })) =
                bob_session.next_event().await
            {
                return;
            }
        }
    })
    .await;
    assert!(extra.is_err());

    assert_eq!(bob.unread_count().await.unwrap(), 1);
    assert_eq!(bob.mark_read(alice.user()).await.unwrap(), 1);
    assert_eq!(bob.mark_read(alice.user()).await.unwrap(), 0);
    assert_eq!(bob.unread_count().await.unwrap(), 0);

    let history = bob
        .conversation(alice.user(), Default::default())
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].text, "hi");
    assert!(history[0].message.read);

    alice_session.close().await;
    wait_for(&mut bob_session, |e| {
        matches!(e, SessionEvent::Server(ServerEvent::UserStatusUpdate { user_id, status })
            if user_id.as_str() == "alice" && *status == PresenceStatus::Offline)
    })
    .await;
    assert!(!bob_session.presence().await.is_online(alice.user()));
}

#[tokio::test]
async fn test_unregistered_peer_gets_flagged_plaintext() {
    let (config, _state) = start_server().await;
    let alice = client(&config, "alice").await;

    let sent = alice
        .send_direct(&UserId::from("nobody"), "in the clear")
        .await
        .unwrap();
    assert!(sent.encryption_unavailable);
    assert_eq!(sent.message.content, "in the clear");
}

#[tokio::test]
async fn test_group_messages_over_the_socket() {
    let (config, _state) = start_server().await;
    let alice = client(&config, "alice").await;
    let bob = client(&config, "bob").await;
    let carol = client(&config, "carol").await;

    let mut alice_session = online(&alice).await;
    let mut bob_session = online(&bob).await;

    let group = alice
        .create_group("trio", &[bob.user().clone(), carol.user().clone()])
        .await
        .unwrap();
    assert!(group.online);

    wait_for(&mut bob_session, |e| {
        matches!(e, SessionEvent::Server(ServerEvent::GroupAdded { group_id, .. }) if *group_id == group.id)
    })
    .await;

    assert!(bob.sync_group_key(&group.id).await.unwrap());
    let content = bob
        .engine()
        .encrypt_group_message(&group.id, "hello group")
        .await
        .unwrap();
    bob_session
        .send_message(&group.id.to_string(), content, true)
        .unwrap();

    let event = wait_for(&mut alice_session, |e| {
        matches!(e, SessionEvent::Server(ServerEvent::NewMessage { message, .. }) if message.is_group)
    })
    .await;
    let message = new_message(event);
    assert_eq!(alice.open_message(&message).await, "hello group");

    // Carol was offline; she pulls the history and her key.
    let history = carol
        .group_messages(&group.id, Default::default())
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].text, "hello group");
}

#[tokio::test]
async fn test_ban_disconnects_and_blocks_reconnect() {
    let (config, state) = start_server().await;
    let mallory = client(&config, "mallory").await;
    let mut session = online(&mallory).await;

    let admin = ConnectionId::new();
    let (admin_tx, mut admin_rx) = mpsc::unbounded_channel();
    state.admins.attach(admin, admin_tx, None).await;
    handle_admin_event(&state, admin, ClientEvent::AdminAuth { token: "tok".into() }).await;
    handle_admin_event(
        &state,
        admin,
        ClientEvent::BanUser {
            user_id: mallory.user().clone(),
            reason: "spam".into(),
        },
    )
    .await;

    let stopped = wait_for(&mut session, |e| matches!(e, SessionEvent::Stopped(_))).await;
    assert_eq!(
        stopped,
        SessionEvent::Stopped(StopReason::Banned {
            reason: "spam".into()
        })
    );
    assert!(admin_rx.try_recv().is_ok());

    let mut retry = mallory.connect();
    let stopped = wait_for(&mut retry, |e| matches!(e, SessionEvent::Stopped(_))).await;
    assert_eq!(
        stopped,
        SessionEvent::Stopped(StopReason::Rejected { status: 403 })
    );
}

#[tokio::test]
async fn test_reinstall_with_fresh_vault_still_receives() {
    let (config, _state) = start_server().await;
    let alice = client(&config, "alice").await;

    let bob_old = client(&config, "bob").await;
    assert_eq!(bob_old.rotate_keys().await.unwrap(), 2);

    // Same account, empty vault: its first key is version 1, below the
    // version 2 the directory already holds.
    let bob = client(&config, "bob").await;
    assert_eq!(bob.engine().key_version().await, 3);
    let published = bob.rest().public_key(bob.user()).await.unwrap().unwrap();
    assert_eq!(published.public_key, bob.engine().public_key().await.to_base64());

    let sent = alice.send_direct(bob.user(), "hi").await.unwrap();
    assert!(!sent.encryption_unavailable);
    assert_eq!(bob.open_message(&sent.message).await, "hi");
}

#[tokio::test]
async fn test_connection_cap_refusal_is_retried() {
    let config = ServerConfig {
        max_connections_per_user: 1,
        rate_limit_burst: 1_000.0,
        ..ServerConfig::default()
    };
    let state = AppState::new(config, Database::open_in_memory().unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve_on(state, listener));

    let config = ClientConfig {
        reconnect_delay: Duration::from_millis(50),
        max_reconnect_attempts: 100,
        ..ClientConfig::new(format!("http://{addr}"))
    };
    let dana = client(&config, "dana").await;

    let first = online(&dana).await;
    let mut second = dana.connect();
    let refused = wait_for(&mut second, |e| {
        matches!(e, SessionEvent::Disconnected { .. } | SessionEvent::Stopped(_))
    })
    .await;
    assert_eq!(refused, SessionEvent::Disconnected { attempt: 1 });

    // Once the first device leaves, the retry gets in.
    first.close().await;
    wait_for(&mut second, |e| {
        assert!(!matches!(e, SessionEvent::Stopped(_)), "session stopped: {e:?}");
        matches!(e, SessionEvent::Connected)
    })
    .await;
}
