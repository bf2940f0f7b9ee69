//! Endpoint-to-endpoint tests over an in-memory transport.

use std::sync::Arc;
use std::time::Duration;

use grainrpc::ByReferenceHint;

use crate::endpoint::EndpointEvent;
use crate::endpoint::RemotingEndpoint;
use crate::error::CallError;
use crate::error::ConnectError;
use crate::heartbeat::Heartbeat;
use crate::heartbeat::HeartbeatMonitor;
use crate::ids::ConnectionId;
use crate::ids::ObjectId;
use crate::mock_transport::DuplexChannelTransport;
use crate::settings::EndpointSettings;
use crate::settings::HeartbeatSettings;
use crate::testing::Counter;
use crate::testing::CountingGrain;
use crate::testing::Tracer;
use crate::testing::TracerGrain;
use crate::testing::OverlapStats;
use crate::testing::Sleeper;
use crate::testing::SleepingGrain;

fn settings(name: &str, secret: Option<&str>) -> EndpointSettings {
    EndpointSettings {
        secret: secret.map(str::to_string),
        call_timeout: Duration::from_secs(5),
        ..EndpointSettings::named(name)
    }
}

struct Pair {
    server: RemotingEndpoint,
    client: RemotingEndpoint,
    /// The connection as the server knows it.
    accepted: ConnectionId,
    /// The connection as the client knows it.
    connected: ConnectionId,
}

async fn try_connect(
    server: Option<&str>,
    client: Option<&str>,
) -> (RemotingEndpoint, RemotingEndpoint, Result<ConnectionId, ConnectError>, Result<ConnectionId, ConnectError>) {
    let server = RemotingEndpoint::new(settings("server", server));
    let client = RemotingEndpoint::new(settings("client", client));
    let (a, b) = DuplexChannelTransport::pair();

    let (accepted, connected) = tokio::join!(
        server.accept_transport(Box::new(a)),
        client.connect_transport(Box::new(b)),
    );
    (server, client, accepted, connected)
}

async fn connect() -> Pair {
    let (server, client, accepted, connected) = try_connect(None, None).await;
    Pair {
        server,
        client,
        accepted: accepted.unwrap(),
        connected: connected.unwrap(),
    }
}

fn tracers(pair: &Pair, count: u64) -> (Arc<OverlapStats>, Vec<Arc<dyn Tracer>>, Vec<Arc<dyn Tracer>>) {
    let stats = Arc::new(OverlapStats::default());
    let mut subjects = Vec::new();
    let mut proxies = Vec::new();
    for n in 1..=count {
        let subject: Arc<dyn Tracer> = Arc::new(TracerGrain::new(stats.clone()));
        pair.server.create_servant(ObjectId(n), &subject).unwrap();
        subjects.push(subject);
        proxies.push(pair.client.get_or_create_proxy::<dyn Tracer>(ObjectId(n), pair.connected));
    }
    (stats, subjects, proxies)
}

#[tokio::test]
async fn test_call_round_trip() {
    let pair = connect().await;
    let subject: Arc<dyn Counter> = Arc::new(CountingGrain::starting_at(10));
    pair.server.create_servant(ObjectId(1), &subject).unwrap();

    let counter = pair.client.get_or_create_proxy::<dyn Counter>(ObjectId(1), pair.connected);
    assert_eq!(counter.increment().await.unwrap(), 11);
    assert_eq!(counter.increment().await.unwrap(), 12);
    assert_eq!(subject.get().await.unwrap(), 12);
}

#[tokio::test]
async fn test_calls_flow_both_ways_on_one_connection() {
    let pair = connect().await;
    let subject: Arc<dyn Counter> = Arc::new(CountingGrain::default());
    pair.client.create_servant(ObjectId(1), &subject).unwrap();

    let counter = pair.server.get_or_create_proxy::<dyn Counter>(ObjectId(1), pair.accepted);
    assert_eq!(counter.increment().await.unwrap(), 1);
}

#[tokio::test]
async fn test_unknown_object_is_no_such_servant() {
    let pair = connect().await;

    let counter = pair.client.get_or_create_proxy::<dyn Counter>(ObjectId(99), pair.connected);
    let result = tokio::time::timeout(Duration::from_secs(1), counter.increment()).await.unwrap();
    assert!(matches!(result, Err(CallError::NoSuchServant(ObjectId(99)))));
}

#[tokio::test]
async fn test_collected_subject_is_no_such_servant() {
    let pair = connect().await;
    let subject: Arc<dyn Counter> = Arc::new(CountingGrain::default());
    let id = pair.server.export(&subject).unwrap();
    drop(subject);

    let counter = pair.client.get_or_create_proxy::<dyn Counter>(id, pair.connected);
    assert!(matches!(counter.increment().await, Err(CallError::NoSuchServant(found)) if found == id));
    assert_eq!(pair.server.registry().servant_count(), 0);
}

#[tokio::test]
async fn test_collected_subjects_release_their_queues() {
    let pair = connect().await;
    let stats = Arc::new(OverlapStats::default());

    let first: Arc<dyn Tracer> = Arc::new(TracerGrain::new(stats.clone()));
    let first_id = pair.server.export(&first).unwrap();
    let first_proxy = pair.client.get_or_create_proxy::<dyn Tracer>(first_id, pair.connected);
    first_proxy.per_object(1).await.unwrap();
    assert_eq!(pair.server.queue_count(), 1);

    drop(first);
    let second: Arc<dyn Tracer> = Arc::new(TracerGrain::new(stats.clone()));
    let second_id = pair.server.export(&second).unwrap();
    assert_ne!(second_id, first_id);
    assert_eq!(pair.server.registry().servant_count(), 1);
    assert_eq!(pair.server.queue_count(), 0);

    assert!(matches!(first_proxy.per_object(1).await, Err(CallError::NoSuchServant(found)) if found == first_id));
    assert_eq!(pair.server.queue_count(), 0);
}

#[tokio::test]
async fn test_wrong_interface_is_no_such_method() {
    let pair = connect().await;
    let subject: Arc<dyn Counter> = Arc::new(CountingGrain::default());
    pair.server.create_servant(ObjectId(1), &subject).unwrap();

    let sleeper = pair.client.get_or_create_proxy::<dyn Sleeper>(ObjectId(1), pair.connected);
    assert!(matches!(sleeper.sleep(1).await, Err(CallError::NoSuchMethod { .. })));
}

#[tokio::test]
async fn test_remote_error_and_panic_become_exceptions() {
    let pair = connect().await;
    let (_stats, _subjects, proxies) = tracers(&pair, 1);

    match proxies[0].fail("out of cheese".into()).await {
        Err(CallError::Remote(exception)) => {
            assert_eq!(exception.type_name, "TracerFailure");
            assert_eq!(exception.message, "out of cheese");
        }
        other => panic!("expected a remote exception, got {:?}", other),
    }

    match proxies[0].panic().await {
        Err(CallError::Remote(exception)) => {
            assert_eq!(exception.type_name, "Panic");
            assert!(exception.message.contains("on purpose"));
        }
        other => panic!("expected a remote exception, got {:?}", other),
    }

    // The connection survives both.
    proxies[0].concurrent(1).await.unwrap();
}

#[tokio::test]
async fn test_per_object_serializes_methods_of_one_grain() {
    let pair = connect().await;
    let (stats, _subjects, proxies) = tracers(&pair, 1);
    let grain = &proxies[0];

    let (a, b, c) = tokio::join!(grain.per_object(60), grain.touch(60), grain.per_object(60));
    a.unwrap();
    b.unwrap();
    c.unwrap();

    assert_eq!(stats.calls(), 3);
    assert_eq!(stats.peak(), 1);
}

#[tokio::test]
async fn test_per_object_lets_different_grains_overlap() {
    let pair = connect().await;
    let (stats, _subjects, proxies) = tracers(&pair, 2);

    let (a, b) = tokio::join!(proxies[0].per_object(200), proxies[1].per_object(200));
    a.unwrap();
    b.unwrap();

    assert_eq!(stats.peak(), 2);
}

#[tokio::test]
async fn test_per_type_serializes_across_grains() {
    let pair = connect().await;
    let (stats, _subjects, proxies) = tracers(&pair, 2);

    let (a, b) = tokio::join!(proxies[0].per_type(60), proxies[1].per_type(60));
    a.unwrap();
    b.unwrap();

    assert_eq!(stats.peak(), 1);
}

#[tokio::test]
async fn test_per_method_serializes_one_method_across_grains() {
    let pair = connect().await;
    let (stats, _subjects, proxies) = tracers(&pair, 2);

    let (a, b) = tokio::join!(proxies[0].per_method(60), proxies[1].per_method(60));
    a.unwrap();
    b.unwrap();

    assert_eq!(stats.peak(), 1);
}

#[tokio::test]
async fn test_concurrent_calls_overlap() {
    let pair = connect().await;
    let (stats, _subjects, proxies) = tracers(&pair, 1);
    let grain = &proxies[0];

    let (a, b, c) = tokio::join!(grain.concurrent(200), grain.concurrent(200), grain.concurrent(200));
    a.unwrap();
    b.unwrap();
    c.unwrap();

    assert_eq!(stats.peak(), 3);
}

#[tokio::test]
async fn test_authentication() {
    let (_, _, accepted, connected) = try_connect(Some("s3cret"), None).await;
    assert!(matches!(accepted, Err(ConnectError::AuthenticationRequired)));
    assert!(matches!(connected, Err(ConnectError::AuthenticationRequired)));

    let (_, _, accepted, connected) = try_connect(Some("s3cret"), Some("guess")).await;
    assert!(matches!(accepted, Err(ConnectError::AuthenticationFailed)));
    assert!(matches!(connected, Err(ConnectError::AuthenticationFailed)));

    let (_, client, accepted, connected) = try_connect(Some("s3cret"), Some("s3cret")).await;
    accepted.unwrap();
    assert_eq!(client.connections(), vec![connected.unwrap()]);
}

#[tokio::test]
async fn test_reference_returning_home_resolves_to_subject() {
    let pair = connect().await;
    let subject: Arc<dyn Counter> = Arc::new(CountingGrain::default());

    let outbound = pair.server.write_reference(&subject).unwrap();
    assert_eq!(outbound.hint, ByReferenceHint::CreateProxy);

    let proxy = pair.client.read_reference::<dyn Counter>(outbound, pair.connected).unwrap();
    assert_eq!(proxy.increment().await.unwrap(), 1);

    let inbound = pair.client.write_reference(&proxy).unwrap();
    assert_eq!(inbound.hint, ByReferenceHint::RetrieveSubject);

    let resolved = pair.server.read_reference::<dyn Counter>(inbound, pair.accepted).unwrap();
    assert!(Arc::ptr_eq(&resolved, &subject));
}

#[tokio::test]
async fn test_disconnect_fails_calls_in_flight() {
    let pair = connect().await;
    let subject: Arc<dyn Sleeper> = Arc::new(SleepingGrain);
    pair.server.create_servant(ObjectId(1), &subject).unwrap();
    let sleeper = pair.client.get_or_create_proxy::<dyn Sleeper>(ObjectId(1), pair.connected);
    let mut events = pair.server.subscribe();

    let call = tokio::spawn({
        let sleeper = sleeper.clone();
        async move { sleeper.sleep(10_000).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(pair.client.disconnect(pair.connected).await);

    let result = tokio::time::timeout(Duration::from_secs(1), call).await.unwrap().unwrap();
    assert!(matches!(result, Err(CallError::ConnectionLost(_))));
    assert!(matches!(sleeper.sleep(1).await, Err(CallError::ConnectionLost(_))));

    // The other side sees the goodbye.
    let disconnected = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if let Ok(EndpointEvent::Disconnected { connection, .. }) = events.recv().await {
                return connection;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(disconnected, pair.accepted);
}

#[tokio::test]
async fn test_dispose_unblocks_callers() {
    let pair = connect().await;
    let subject: Arc<dyn Sleeper> = Arc::new(SleepingGrain);
    pair.server.create_servant(ObjectId(1), &subject).unwrap();
    let sleeper = pair.client.get_or_create_proxy::<dyn Sleeper>(ObjectId(1), pair.connected);

    let call = tokio::spawn(async move { sleeper.sleep(10_000).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    pair.client.dispose().await;

    let result = tokio::time::timeout(Duration::from_secs(1), call).await.unwrap().unwrap();
    assert!(result.unwrap_err().is_connection_error());
    assert!(pair.client.is_disposed());
}

#[tokio::test]
async fn test_endpoint_answers_heartbeats() {
    let pair = connect().await;

    let beat = pair.client.heartbeat(pair.connected).beat().unwrap();
    tokio::time::timeout(Duration::from_secs(1), beat).await.unwrap().unwrap();

    let settings = HeartbeatSettings {
        interval: Duration::from_millis(20),
        skipped_heartbeat_threshold: 5,
        ..HeartbeatSettings::default()
    };
    let monitor = HeartbeatMonitor::new(Arc::new(pair.client.heartbeat(pair.connected)), settings);
    monitor.start();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(monitor.num_heartbeats() >= 2);
    assert!(!monitor.failure_detected());
    monitor.dispose();
}

#[tokio::test]
async fn test_tcp_bind_and_connect() {
    let server = RemotingEndpoint::new(settings("server", Some("tcp-secret")));
    let client = RemotingEndpoint::new(settings("client", Some("tcp-secret")));
    let subject: Arc<dyn Counter> = Arc::new(CountingGrain::default());
    server.create_servant(ObjectId::BOOTSTRAP, &subject).unwrap();

    let local = server.bind("127.0.0.1:0").await.unwrap();
    let connection = client.connect(&local.to_string()).await.unwrap();

    let counter = client.bootstrap::<dyn Counter>(connection);
    assert_eq!(counter.increment().await.unwrap(), 1);

    client.dispose().await;
    server.dispose().await;
}

#[tokio::test]
async fn test_refused_connection_is_no_such_endpoint() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = RemotingEndpoint::new(settings("client", None));
    let result = client.connect(&addr.to_string()).await;
    assert!(matches!(result, Err(ConnectError::NoSuchEndpoint(_))));
}
