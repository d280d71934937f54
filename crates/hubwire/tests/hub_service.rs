mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use hubwire::config::AuthFailurePolicy;
use hubwire::{
    ConnectionEvent, EventHandler, EventMessage, HubConfig, HubError, HubResult, HubService,
    SessionState, TokenProvider, WsConnector,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use support::mock_hub::{HandshakeMode, MockHubServer, STEP_TIMEOUT};

#[derive(Clone, Default)]
struct Recorder {
    seen: Arc<Mutex<Vec<String>>>,
    delay: Duration,
}

impl Recorder {
    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

impl EventHandler for Recorder {
    async fn handle(&self, event: EventMessage) -> HubResult<()> {
        self.seen.lock().unwrap().push(event.kind);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(())
    }
}

type TestService = HubService<WsConnector, TokenProvider, Recorder>;

async fn start_server_or_skip(test_name: &str) -> Option<MockHubServer> {
    support::init_tracing();
    match MockHubServer::start_with(HandshakeMode::Accept).await {
        Ok(server) => Some(server),
        Err(err) => {
            eprintln!("Skipping {test_name}: unable to start mock server: {err}");
            None
        }
    }
}

async fn mount_token(auth: &MockServer, token: &str) {
    Mock::given(method("GET"))
        .and(path("/auth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "Token": token })))
        .mount(auth)
        .await;
}

fn service_config(hub: &MockHubServer, auth: &MockServer) -> HubConfig {
    let mut config = HubConfig::new(hub.ws_url());
    config.auth_url = Some(format!("{}/auth/token", auth.uri()));
    config.username = "svc-events".into();
    config.password = "secret".into();
    config.timeouts.connect_timeout_secs = 2;
    config.timeouts.invoke_timeout_secs = 2;
    config.reconnect.retry_delay_ms = 100;
    config.reconnect.poll_interval_ms = 100;
    config
}

fn build_service(config: &HubConfig, recorder: Recorder) -> TestService {
    HubService::with_parts(
        config.clone(),
        WsConnector::new(config),
        TokenProvider::new(config).unwrap(),
        recorder,
    )
    .unwrap()
}

async fn wait_for_state(service: &TestService, wanted: SessionState) {
    let mut states = service.supervisor().subscribe_state();
    tokio::time::timeout(STEP_TIMEOUT, states.wait_for(|s| *s == wanted))
        .await
        .unwrap_or_else(|_| panic!("state {wanted:?} not reached"))
        .unwrap();
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(STEP_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

#[tokio::test]
async fn connects_handshakes_and_processes_events() {
    let Some(mut hub) = start_server_or_skip("connects_handshakes_and_processes_events").await else {
        return;
    };
    let auth = MockServer::start().await;
    mount_token(&auth, "tok-1").await;

    let config = service_config(&hub, &auth);
    let recorder = Recorder::default();
    let service = build_service(&config, recorder.clone());

    service.start(&CancellationToken::new());

    let mut connection = hub.accept_connection().await;
    assert_eq!(connection.authorization(), Some("Bearer tok-1"));
    connection.complete_group_handshake("events").await;
    wait_for_state(&service, SessionState::Connected).await;

    for i in 0..5 {
        connection.push_event(&format!("kind-{i}"), json!({ "seq": i })).await;
    }
    wait_until(|| recorder.seen().len() == 5).await;
    assert_eq!(
        recorder.seen(),
        vec!["kind-0", "kind-1", "kind-2", "kind-3", "kind-4"]
    );

    service.stop(Duration::from_secs(2)).await;
    assert_eq!(service.state(), SessionState::Closed);
    assert!(connection.wait_closed(STEP_TIMEOUT).await);

    service.stop(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn dropped_session_reconnects_without_group_handshake() {
    let Some(mut hub) = start_server_or_skip("dropped_session_reconnects_without_group_handshake").await
    else {
        return;
    };
    let auth = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/auth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "Token": "tok" })))
        .expect(2)
        .mount(&auth)
        .await;

    let config = service_config(&hub, &auth);
    let recorder = Recorder::default();
    let service = build_service(&config, recorder.clone());
    let mut events = service.event_receiver();

    service.start(&CancellationToken::new());
    let mut first = hub.accept_connection().await;
    first.complete_group_handshake("events").await;
    wait_for_state(&service, SessionState::Connected).await;

    first.force_close().await;

    let mut second = hub.accept_connection().await;
    tokio::time::timeout(STEP_TIMEOUT, async {
        loop {
            if events.recv().await.unwrap() == ConnectionEvent::Reconnected {
                break;
            }
        }
    })
    .await
    .expect("no Reconnected event");

    assert_eq!(second.index(), 1);
    assert!(
        second.try_recv_message(Duration::from_millis(300)).await.is_none(),
        "reconnected session must not repeat the group handshake"
    );

    second.push_event("after-reconnect", json!(null)).await;
    wait_until(|| recorder.seen() == vec!["after-reconnect"]).await;

    service.stop(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn token_failures_are_retried_by_default() {
    let Some(mut hub) = start_server_or_skip("token_failures_are_retried_by_default").await else {
        return;
    };
    let auth = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/auth/token"))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(2)
        .mount(&auth)
        .await;
    mount_token(&auth, "tok-after-retry").await;

    let config = service_config(&hub, &auth);
    let service = build_service(&config, Recorder::default());
    service.start(&CancellationToken::new());

    let mut connection = hub.accept_connection().await;
    assert_eq!(connection.authorization(), Some("Bearer tok-after-retry"));
    connection.complete_group_handshake("events").await;
    wait_for_state(&service, SessionState::Connected).await;

    let requests = auth.received_requests().await.unwrap();
    assert_eq!(requests.len(), 3);

    service.stop(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn token_failure_closes_under_fatal_policy() {
    let Some(mut hub) = start_server_or_skip("token_failure_closes_under_fatal_policy").await else {
        return;
    };
    let auth = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/auth/token"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&auth)
        .await;

    let mut config = service_config(&hub, &auth);
    config.reconnect.auth_failure = AuthFailurePolicy::Fatal;
    let service = build_service(&config, Recorder::default());
    service.start(&CancellationToken::new());

    wait_for_state(&service, SessionState::Closed).await;
    assert!(hub.try_accept_connection(Duration::from_millis(300)).await.is_none());
    assert_eq!(auth.received_requests().await.unwrap().len(), 1);

    service.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn stop_drains_queued_events() {
    let Some(mut hub) = start_server_or_skip("stop_drains_queued_events").await else {
        return;
    };
    let auth = MockServer::start().await;
    mount_token(&auth, "tok").await;

    let config = service_config(&hub, &auth);
    let recorder = Recorder::slow(Duration::from_millis(50));
    let service = build_service(&config, recorder.clone());
    service.start(&CancellationToken::new());

    let mut connection = hub.accept_connection().await;
    connection.complete_group_handshake("events").await;
    wait_for_state(&service, SessionState::Connected).await;

    for i in 0..5 {
        connection.push_event(&format!("e{i}"), json!({})).await;
    }
    wait_until(|| !recorder.seen().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    service.stop(Duration::from_secs(5)).await;
    assert_eq!(recorder.seen(), vec!["e0", "e1", "e2", "e3", "e4"]);
}

#[tokio::test]
async fn external_cancellation_stops_retrying() {
    let auth = MockServer::start().await;
    mount_token(&auth, "tok").await;

    let mut config = HubConfig::new("ws://127.0.0.1:9/hub");
    config.auth_url = Some(format!("{}/auth/token", auth.uri()));
    config.reconnect.retry_delay_ms = 100;
    let service = build_service(&config, Recorder::default());

    let base = CancellationToken::new();
    service.start(&base);
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(service.supervisor().is_running());

    base.cancel();
    wait_until(|| !service.supervisor().is_running()).await;
    assert_ne!(service.state(), SessionState::Closed);

    service.stop(Duration::from_secs(1)).await;
    assert_eq!(service.state(), SessionState::Closed);
}

#[test]
fn empty_url_is_a_configuration_error() {
    let result = HubService::new(HubConfig::new(""));
    assert!(matches!(result, Err(HubError::ConfigError { .. })));
}
