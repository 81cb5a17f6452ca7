#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use lzpush::auth::{AuthHttp, HttpIoError, HttpReply, PushServer};
use lzpush::stream::proto::InboundEvent;
use lzpush::stream::transport::{Transport, TransportConnection, TransportError};
use lzpush::{Dispatcher, PushConfig, PushError, SessionManager};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

pub const WAIT: Duration = Duration::from_secs(5);

pub type Reply = Result<HttpReply, HttpIoError>;
pub type TestManager = SessionManager<MockTransport, MockAuthHttp>;

/// Configuration with short retry delays and a one minute expiry margin.
pub fn test_config() -> PushConfig {
    PushConfig::new("access", "secret", "app")
        .with_device_id("device-1")
        .with_api_endpoint("http://auth.test")
        .with_auth_retry(3, Duration::ZERO)
        .with_conn_retry(3, Duration::from_millis(1))
        .with_expiry_margin(Duration::from_secs(60))
}

/// Successful token exchange expiring `lifetime` from now.
pub fn token_reply(lifetime: Duration, servers: &[(&str, u16)]) -> Reply {
    let expires = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .saturating_add(lifetime)
        .as_secs();
    let servers: Vec<Value> = servers
        .iter()
        .map(|(host, port)| serde_json::json!({"host": host, "port": port}))
        .collect();
    Ok(HttpReply {
        status: 200,
        body: serde_json::json!({
            "auth": {
                "access_token": "tok",
                "expires": expires,
                "push_servers": servers,
            }
        })
        .to_string(),
    })
}

pub fn status_reply(status: u16, body: &str) -> Reply {
    Ok(HttpReply {
        status,
        body: body.to_string(),
    })
}

/// Scripted token endpoint. Replies are served in order, then `fallback`
/// is repeated.
#[derive(Clone)]
pub struct MockAuthHttp {
    inner: Arc<AuthInner>,
}

struct AuthInner {
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    forms: Mutex<Vec<Vec<(String, String)>>>,
}

impl MockAuthHttp {
    pub fn always(reply: Reply) -> Self {
        Self::scripted(Vec::new(), reply)
    }

    pub fn scripted(replies: Vec<Reply>, fallback: Reply) -> Self {
        Self {
            inner: Arc::new(AuthInner {
                script: Mutex::new(replies.into()),
                fallback,
                forms: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn calls(&self) -> usize {
        self.inner.forms.lock().expect("forms").len()
    }

    pub fn forms(&self) -> Vec<Vec<(String, String)>> {
        self.inner.forms.lock().expect("forms").clone()
    }
}

#[async_trait]
impl AuthHttp for MockAuthHttp {
    async fn post_form(&self, _url: &str, form: &[(&str, &str)]) -> Result<HttpReply, HttpIoError> {
        self.inner.forms.lock().expect("forms").push(
            form.iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
        );
        let scripted = self.inner.script.lock().expect("script").pop_front();
        scripted.unwrap_or_else(|| self.inner.fallback.clone())
    }
}

/// One connection opened through [`MockTransport`], seen from the server.
pub struct MockLink {
    pub server: PushServer,
    pub namespace: String,
    events: mpsc::UnboundedSender<InboundEvent>,
    emitted: Mutex<Vec<(String, Value)>>,
    closed: AtomicBool,
}

impl MockLink {
    pub fn push(&self, event: InboundEvent) {
        self.events.send(event).expect("connection receiver alive");
    }

    pub fn emitted(&self) -> Vec<(String, Value)> {
        self.emitted.lock().expect("emitted").clone()
    }

    /// Match ids of every `auth_match` emitted on this connection.
    pub fn subscriptions(&self) -> Vec<String> {
        self.emitted()
            .into_iter()
            .filter(|(name, _)| name == "auth_match")
            .filter_map(|(_, payload)| payload["match"].as_str().map(str::to_string))
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct MockConnection {
    link: Arc<MockLink>,
    events: mpsc::UnboundedReceiver<InboundEvent>,
}

#[async_trait]
impl TransportConnection for MockConnection {
    async fn emit(&mut self, event: &str, payload: Value) -> Result<(), TransportError> {
        if self.link.is_closed() {
            return Err(TransportError::Closed);
        }
        self.link
            .emitted
            .lock()
            .expect("emitted")
            .push((event.to_string(), payload));
        Ok(())
    }

    async fn next_event(&mut self) -> Option<InboundEvent> {
        self.events.recv().await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.link.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory transport. Connections succeed unless failures are queued.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    fail_next: AtomicUsize,
    fail_all: AtomicBool,
    attempts: AtomicUsize,
    links: Mutex<Vec<Arc<MockLink>>>,
    opened: watch::Sender<usize>,
}

impl MockTransport {
    pub fn new() -> Self {
        let (opened, _) = watch::channel(0);
        Self {
            inner: Arc::new(TransportInner {
                fail_next: AtomicUsize::new(0),
                fail_all: AtomicBool::new(false),
                attempts: AtomicUsize::new(0),
                links: Mutex::new(Vec::new()),
                opened,
            }),
        }
    }

    /// Fails the next `count` connect attempts.
    pub fn fail_next(self, count: usize) -> Self {
        self.inner.fail_next.store(count, Ordering::SeqCst);
        self
    }

    pub fn fail_always(self) -> Self {
        self.inner.fail_all.store(true, Ordering::SeqCst);
        self
    }

    pub fn attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.inner.links.lock().expect("links").len()
    }

    pub fn link(&self, index: usize) -> Arc<MockLink> {
        Arc::clone(&self.inner.links.lock().expect("links")[index])
    }

    /// Waits until `count` connections were opened.
    pub async fn wait_for_links(&self, count: usize, limit: Duration) -> Arc<MockLink> {
        let mut opened = self.inner.opened.subscribe();
        timeout(limit, opened.wait_for(|opened| *opened >= count))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for connection #{count}"))
            .expect("transport alive");
        self.link(count - 1)
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Connection = MockConnection;

    async fn connect(
        &mut self,
        server: &PushServer,
        namespace: &str,
    ) -> Result<MockConnection, TransportError> {
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);
        let scripted_failure = self
            .inner
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if scripted_failure || self.inner.fail_all.load(Ordering::SeqCst) {
            return Err(TransportError::Connect {
                server: server.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        let (events_tx, events) = mpsc::unbounded_channel();
        let link = Arc::new(MockLink {
            server: server.clone(),
            namespace: namespace.to_string(),
            events: events_tx,
            emitted: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        let opened = {
            let mut links = self.inner.links.lock().expect("links");
            links.push(Arc::clone(&link));
            links.len()
        };
        self.inner.opened.send_replace(opened);
        Ok(MockConnection { link, events })
    }
}

/// Collects everything delivered to the handler slots.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
    updates: Arc<Mutex<Vec<Value>>>,
    past_balls: Arc<Mutex<Vec<Value>>>,
}

impl Recorder {
    pub fn dispatcher(&self) -> Dispatcher {
        let events = Arc::clone(&self.events);
        let updates = Arc::clone(&self.updates);
        let past_balls = Arc::clone(&self.past_balls);
        Dispatcher::new()
            .on_update(move |card| updates.lock().expect("updates").push(card))
            .on_past_ball_update(move |ball| past_balls.lock().expect("past balls").push(ball))
            .on_event(move |name, _args| events.lock().expect("events").push(name.to_string()))
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().expect("events").clone()
    }

    pub fn updates(&self) -> Vec<Value> {
        self.updates.lock().expect("updates").clone()
    }

    pub fn past_balls(&self) -> Vec<Value> {
        self.past_balls.lock().expect("past balls").clone()
    }
}

pub fn spawn_manager(
    mut manager: TestManager,
    matches: &[&str],
) -> JoinHandle<(TestManager, Result<(), PushError>)> {
    let matches = matches.iter().map(|id| id.to_string()).collect();
    tokio::spawn(async move {
        let result = manager.connect(Some(matches)).await;
        (manager, result)
    })
}

/// Polls `condition` until it holds.
pub async fn eventually<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}
