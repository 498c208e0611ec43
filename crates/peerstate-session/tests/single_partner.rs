mod support;

use std::sync::Arc;
use std::time::Duration;

use peerstate_session::{
    driver, HostSession, Identity, IdentityStore, JoinSession, MemoryNetwork, MemoryStore,
    Session, SessionChange, SessionConfig, DEFAULT_IDENTITY_LENGTH,
};
use serde_json::json;
use support::{player, recorder, MockConnection, MockTransport, Player};

fn host(network: &MemoryNetwork, store: &Arc<MemoryStore>) -> HostSession<Player> {
    HostSession::new(
        Arc::new(network.clone()),
        store.clone(),
        player("host", 0),
        SessionConfig::default(),
    )
    .unwrap()
}

fn joiner(network: &MemoryNetwork, target: Identity) -> JoinSession<Player> {
    JoinSession::new(
        Arc::new(network.clone()),
        target,
        player("guest", 0),
        SessionConfig::default(),
    )
    .unwrap()
}

#[test]
fn host_starts_disconnected_with_initial_state() {
    let network = MemoryNetwork::new();
    let store = Arc::new(MemoryStore::new());
    let mut host = host(&network, &store);

    assert!(host.remote_state().is_none());
    assert_eq!(host.local_state(), &player("host", 0));
    assert!(!host.is_connected());
    assert!(host.own_identity().is_none());

    host.poll();
    let id = host.own_identity().expect("identity after open");
    assert_eq!(id.len(), DEFAULT_IDENTITY_LENGTH);
    assert!(!host.is_connected());
}

#[test]
fn set_local_state_applies_without_partner() {
    let network = MemoryNetwork::new();
    let mut host = host(&network, &Arc::new(MemoryStore::new()));

    host.set_local_state(player("bar", 1));
    assert_eq!(host.local_state(), &player("bar", 1));
    assert!(!host.is_connected());
    assert!(host.error().is_none());
}

#[test]
fn host_identity_survives_reload() {
    let network = MemoryNetwork::new();
    let store = Arc::new(MemoryStore::new());

    let first = {
        let mut session = host(&network, &store);
        session.poll();
        session.own_identity().cloned().unwrap()
    };

    let mut second = host(&network, &store);
    second.poll();
    assert_eq!(second.own_identity(), Some(&first));
}

#[test]
fn host_and_joiner_exchange_state() {
    let network = MemoryNetwork::new();
    let mut host = host(&network, &Arc::new(MemoryStore::new()));
    host.poll();
    let mut guest = joiner(&network, host.own_identity().cloned().unwrap());

    driver::settle(&mut [&mut host, &mut guest]);
    assert!(host.is_connected());
    assert!(guest.is_connected());
    assert_eq!(guest.remote_state(), Some(&player("host", 0)));
    assert_eq!(host.remote_state(), Some(&player("guest", 0)));

    host.set_local_state(player("host", 5));
    guest.set_local_state(player("guest", 9));
    driver::settle(&mut [&mut host, &mut guest]);

    assert_eq!(guest.remote_state(), Some(&player("host", 5)));
    assert_eq!(host.remote_state(), Some(&player("guest", 9)));
}

#[test]
fn host_closes_second_partner() {
    let network = MemoryNetwork::new();
    let mut host = host(&network, &Arc::new(MemoryStore::new()));
    host.poll();
    let target = host.own_identity().cloned().unwrap();

    let mut first = joiner(&network, target.clone());
    driver::settle(&mut [&mut host, &mut first]);
    let mut second = joiner(&network, target);
    driver::settle(&mut [&mut host, &mut first, &mut second]);

    assert!(first.is_connected());
    assert!(!second.is_connected());
    assert_eq!(host.controller().connection_count(), 1);

    second.set_local_state(player("intruder", 100));
    driver::settle(&mut [&mut host, &mut first, &mut second]);
    assert_eq!(host.remote_state(), Some(&player("guest", 0)));
}

#[test]
fn partner_leaving_frees_the_slot() {
    let network = MemoryNetwork::new();
    let mut host = host(&network, &Arc::new(MemoryStore::new()));
    host.poll();
    let target = host.own_identity().cloned().unwrap();

    let mut first = joiner(&network, target.clone());
    driver::settle(&mut [&mut host, &mut first]);
    first.destroy();
    driver::settle(&mut [&mut host, &mut first]);
    assert!(!host.is_connected());

    let mut second = joiner(&network, target);
    second.set_local_state(player("second", 2));
    driver::settle(&mut [&mut host, &mut second]);
    assert!(host.is_connected());
    assert_eq!(host.remote_state(), Some(&player("second", 2)));
}

#[test]
fn short_target_is_refused_locally() {
    let network = MemoryNetwork::new();
    let guest = joiner(&network, Identity::from("abc"));

    assert_eq!(network.endpoint_count(), 0);
    assert!(guest.error().unwrap().contains("too short"));
    assert!(!guest.is_connected());
}

#[test]
fn short_target_keeps_earlier_error() {
    let network = MemoryNetwork::new();
    let mut guest = joiner(&network, Identity::from("missinghost"));
    guest.poll();
    assert_eq!(guest.error(), Some("Could not connect to peer missinghost"));

    guest.set_target(Identity::from("ab"));
    assert!(guest.error().is_some());
    assert_eq!(network.endpoint_count(), 0);
}

#[test]
fn min_identity_length_is_configurable() {
    let transport = MockTransport::new();
    let guest: JoinSession<Player> = JoinSession::new(
        Arc::new(transport.clone()),
        Identity::from("abc"),
        player("guest", 0),
        SessionConfig::default().with_min_identity_length(3),
    )
    .unwrap();

    assert_eq!(transport.endpoints_created(), 1);
    assert!(guest.error().is_none());
}

#[test]
fn malformed_partner_data_sets_error() {
    let transport = MockTransport::new();
    let store = Arc::new(MemoryStore::new());
    let mut host: HostSession<Player> = HostSession::new(
        Arc::new(transport.clone()),
        store,
        player("host", 0),
        SessionConfig::default(),
    )
    .unwrap();

    transport.open("hostidentity");
    let conn = MockConnection::new("partner");
    transport.accept(conn);
    transport.data("partner", json!({"name": "no score"}));
    host.poll();

    assert!(host.remote_state().is_none());
    assert_eq!(host.error(), Some("Received data of incorrect type"));

    transport.data("partner", json!({"name": "ok", "score": 3}));
    host.poll();
    assert_eq!(host.remote_state(), Some(&player("ok", 3)));
    assert!(host.is_connected());
    assert!(host.error().is_none());
}

#[test]
fn taken_identity_is_replaced_and_persisted() {
    let network = MemoryNetwork::new();
    let mut occupant = host(&network, &Arc::new(MemoryStore::new()));
    occupant.poll();
    let taken = occupant.own_identity().cloned().unwrap();

    let store = Arc::new(MemoryStore::new());
    store.set("identity.host", taken.as_str()).unwrap();
    let mut clash = host(&network, &store);
    clash.poll();

    let effective = clash.own_identity().cloned().unwrap();
    assert_ne!(effective, taken);
    assert_eq!(
        store.get("identity.host").unwrap().as_deref(),
        Some(effective.as_str())
    );
}

#[test]
fn rotation_drops_partner() {
    let network = MemoryNetwork::new();
    let mut host = host(&network, &Arc::new(MemoryStore::new()));
    host.poll();
    let old = host.own_identity().cloned().unwrap();
    let mut guest = joiner(&network, old.clone());
    driver::settle(&mut [&mut host, &mut guest]);
    assert!(host.is_connected());

    let (changes, listener) = recorder();
    host.subscribe(listener);
    let fresh = host.regenerate_identity().unwrap();
    driver::settle(&mut [&mut host, &mut guest]);

    assert_ne!(fresh, old);
    assert_eq!(host.own_identity(), Some(&fresh));
    assert!(!host.is_connected());
    assert!(!guest.is_connected());
    assert!(changes
        .lock()
        .unwrap()
        .contains(&SessionChange::Identity(fresh)));
}

#[tokio::test]
async fn driver_runs_until_endpoint_closes() {
    let network = MemoryNetwork::new();
    let store = Arc::new(MemoryStore::new());
    let mut host = host(&network, &store);
    let id = Identity::from(store.get("identity.host").unwrap().unwrap());

    network.close_endpoint(&id);
    let handled = driver::run(&mut host).await;

    assert_eq!(handled, 2);
    assert_eq!(host.own_identity(), Some(&id));
    assert!(!host.is_connected());
}

#[tokio::test]
async fn driver_waits_while_endpoint_is_live() {
    let network = MemoryNetwork::new();
    let mut host = host(&network, &Arc::new(MemoryStore::new()));

    let outcome = tokio::time::timeout(Duration::from_millis(50), driver::run(&mut host)).await;
    assert!(outcome.is_err());
    assert!(host.own_identity().is_some());
}

#[test]
fn transport_faults_reach_the_error_channel() {
    let network = MemoryNetwork::new();
    let mut host = host(&network, &Arc::new(MemoryStore::new()));
    host.poll();
    let id = host.own_identity().cloned().unwrap();
    let mut guest = joiner(&network, id.clone());
    driver::settle(&mut [&mut host, &mut guest]);
    assert!(host.is_connected());

    network.fail(&id, "broker hiccup");
    host.poll();
    assert_eq!(host.error(), Some("broker hiccup"));

    network.disconnect(&id);
    host.poll();
    assert!(!host.is_connected());
}
