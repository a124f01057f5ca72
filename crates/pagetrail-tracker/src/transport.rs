//! Fire-and-forget payload delivery
//!
//! Delivery never retries, never queues past the in-flight hand-off and never
//! reports failure to the caller. The collector side is expected to cope with
//! missing, duplicate or reordered payloads.

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Url};
use serde_json::json;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::config::{ResolvedConfig, TransportPreference};
use crate::payload::{Endpoint, TelemetryPayload};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Something that can put a request on the wire.
pub trait Transport: Send + Sync {
    /// Hand off one request. Must not block on the network.
    fn send(&self, url: &str, body: String);

    /// Stop accepting requests and wait for the ones in flight.
    fn close(&self) {}

    fn name(&self) -> &'static str;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Outbound {
    url: String,
    body: String,
}

/// Beacon-style delivery.
///
/// Requests are handed to a dedicated sender thread that keeps running after
/// the tracker is torn down. Dropping the transport detaches that thread and
/// returns at once; only an explicit [`Transport::close`] waits for it.
pub struct BeaconTransport {
    sender: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BeaconTransport {
    /// Start the sender thread. Fails when the platform won't give us one.
    pub fn spawn() -> std::io::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        let worker = thread::Builder::new()
            .name("pagetrail-beacon".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        tracing::debug!(error = %e, "beacon runtime unavailable");
                        return;
                    }
                };
                runtime.block_on(Self::sender_loop(rx));
            })?;

        Ok(Self {
            sender: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Sends every request concurrently as it arrives, then waits for the
    /// stragglers once the channel closes.
    async fn sender_loop(mut rx: mpsc::UnboundedReceiver<Outbound>) {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();

        let mut in_flight = JoinSet::new();
        while let Some(outbound) = rx.recv().await {
            let client = client.clone();
            in_flight.spawn(async move {
                let result = client
                    .post(&outbound.url)
                    .header(CONTENT_TYPE, "text/plain;charset=UTF-8")
                    .body(outbound.body)
                    .send()
                    .await;
                if let Err(e) = result {
                    tracing::debug!(url = %outbound.url, error = %e, "beacon delivery failed");
                }
            });
            // reap whatever already finished
            while in_flight.try_join_next().is_some() {}
        }

        while in_flight.join_next().await.is_some() {}
    }
}

impl Transport for BeaconTransport {
    fn send(&self, url: &str, body: String) {
        match lock(&self.sender).as_ref() {
            Some(sender) => {
                let _ = sender.send(Outbound {
                    url: url.to_string(),
                    body,
                });
            }
            None => tracing::debug!(url, "beacon closed, dropping payload"),
        }
    }

    fn close(&self) {
        // dropping the sender ends the loop once the backlog is sent
        lock(&self.sender).take();
        if let Some(worker) = lock(&self.worker).take() {
            let _ = worker.join();
        }
    }

    fn name(&self) -> &'static str {
        "beacon"
    }
}

impl Drop for BeaconTransport {
    fn drop(&mut self) {
        // the worker drains its backlog on its own
        lock(&self.sender).take();
        lock(&self.worker).take();
    }
}

/// One unawaited keep-alive request per payload on the caller's runtime.
pub struct KeepAliveTransport {
    client: Client,
    runtime: Option<Handle>,
}

impl KeepAliveTransport {
    /// Uses the tokio runtime current at construction, if any.
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .build()
            .unwrap_or_default();

        Self {
            client,
            runtime: Handle::try_current().ok(),
        }
    }
}

impl Default for KeepAliveTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for KeepAliveTransport {
    fn send(&self, url: &str, body: String) {
        let Some(runtime) = &self.runtime else {
            tracing::debug!(url, "no async runtime, dropping payload");
            return;
        };

        let request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        let url = url.to_string();
        runtime.spawn(async move {
            if let Err(e) = request.send().await {
                tracing::debug!(url = %url, error = %e, "keep-alive delivery failed");
            }
        });
    }

    fn name(&self) -> &'static str {
        "keepalive"
    }
}

/// Debug mode: print instead of sending.
#[derive(Debug, Default)]
pub struct DebugTransport;

impl Transport for DebugTransport {
    fn send(&self, url: &str, body: String) {
        let body = serde_json::from_str::<serde_json::Value>(&body).unwrap_or(json!(body));
        eprintln!("📊 pagetrail payload (DEBUG MODE - not sent):");
        eprintln!(
            "{}",
            serde_json::to_string_pretty(&json!({ "url": url, "body": body })).unwrap_or_default()
        );
    }

    fn name(&self) -> &'static str {
        "debug"
    }
}

/// A request captured by [`RecordingTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRequest {
    pub url: String,
    pub body: String,
}

impl SentRequest {
    pub fn body_json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).unwrap_or(serde_json::Value::Null)
    }
}

/// Keeps every request in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    sent: Arc<Mutex<Vec<SentRequest>>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<SentRequest> {
        lock(&self.sent).clone()
    }

    pub fn take(&self) -> Vec<SentRequest> {
        std::mem::take(&mut *lock(&self.sent))
    }

    pub fn len(&self) -> usize {
        lock(&self.sent).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Transport for RecordingTransport {
    fn send(&self, url: &str, body: String) {
        lock(&self.sent).push(SentRequest {
            url: url.to_string(),
            body,
        });
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// Pick the transport once, at startup.
pub fn select_transport(config: &ResolvedConfig) -> Arc<dyn Transport> {
    if config.debug {
        return Arc::new(DebugTransport);
    }

    match config.transport {
        TransportPreference::KeepAlive => Arc::new(KeepAliveTransport::new()),
        TransportPreference::Auto | TransportPreference::Beacon => match BeaconTransport::spawn() {
            Ok(beacon) => Arc::new(beacon),
            Err(e) => {
                tracing::debug!(error = %e, "beacon unavailable, using keep-alive requests");
                Arc::new(KeepAliveTransport::new())
            }
        },
    }
}

/// Sends payloads to the collector for one site.
pub struct DeliveryChannel {
    api_url: String,
    site_key: String,
    transport: Arc<dyn Transport>,
}

impl DeliveryChannel {
    pub fn new(config: &ResolvedConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            api_url: config.api_url.clone(),
            site_key: config.site_key.clone(),
            transport,
        }
    }

    /// Channel with the best transport this platform offers.
    pub fn detect(config: &ResolvedConfig) -> Self {
        Self::new(config, select_transport(config))
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// `<api_url><endpoint>?site_key=<key>`
    pub fn endpoint_url(&self, endpoint: Endpoint) -> String {
        let raw = format!("{}{}", self.api_url, endpoint.path());
        match Url::parse(&raw) {
            Ok(mut url) => {
                url.query_pairs_mut().append_pair("site_key", &self.site_key);
                url.into()
            }
            Err(_) => format!("{}?site_key={}", raw, self.site_key),
        }
    }

    pub fn deliver(&self, payload: &TelemetryPayload) {
        let Some(body) = payload.body() else {
            return;
        };
        self.transport.send(&self.endpoint_url(payload.endpoint()), body);
    }

    pub fn close(&self) {
        self.transport.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::time::Instant;

    fn config() -> ResolvedConfig {
        ResolvedConfig {
            site_key: "abc".to_string(),
            api_url: "https://stats.example.com".to_string(),
            include_query: false,
            debug: false,
            transport: TransportPreference::Auto,
            dedupe_leave: false,
        }
    }

    fn payload(name: &str, duration: u64) -> TelemetryPayload {
        TelemetryPayload {
            site_key: "abc".to_string(),
            name: name.to_string(),
            path: "/".to_string(),
            title: String::new(),
            properties: String::new(),
            referrer: String::new(),
            screen_width: 800,
            duration,
            utm_source: String::new(),
            utm_medium: String::new(),
            utm_campaign: String::new(),
        }
    }

    /// Accept one HTTP request, answer 204 and return its request line and body.
    fn one_shot_server() -> (String, std::sync::mpsc::Receiver<(String, String)>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = format!("http://{}", listener.local_addr().unwrap());
        let (tx, rx) = std::sync::mpsc::channel();

        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());

            let mut request_line = String::new();
            reader.read_line(&mut request_line).unwrap();

            let mut content_length = 0;
            loop {
                let mut header = String::new();
                reader.read_line(&mut header).unwrap();
                let header = header.trim_end();
                if header.is_empty() {
                    break;
                }
                if let Some((name, value)) = header.split_once(':') {
                    if name.eq_ignore_ascii_case("content-length") {
                        content_length = value.trim().parse().unwrap();
                    }
                }
            }

            let mut body = vec![0; content_length];
            reader.read_exact(&mut body).unwrap();

            let mut stream = stream;
            stream
                .write_all(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .unwrap();
            tx.send((
                request_line.trim_end().to_string(),
                String::from_utf8(body).unwrap(),
            ))
            .unwrap();
        });

        (address, rx)
    }

    #[test]
    fn test_endpoint_urls() {
        let channel = DeliveryChannel::new(&config(), Arc::new(RecordingTransport::new()));
        assert_eq!(
            channel.endpoint_url(Endpoint::Collect),
            "https://stats.example.com/api/collect?site_key=abc"
        );
        assert_eq!(
            channel.endpoint_url(Endpoint::Event),
            "https://stats.example.com/api/event?site_key=abc"
        );
    }

    #[test]
    fn test_site_key_is_encoded() {
        let mut config = config();
        config.site_key = "a b&c".to_string();
        let channel = DeliveryChannel::new(&config, Arc::new(RecordingTransport::new()));
        assert_eq!(
            channel.endpoint_url(Endpoint::Collect),
            "https://stats.example.com/api/collect?site_key=a+b%26c"
        );
    }

    #[test]
    fn test_api_url_with_path_prefix() {
        let mut config = config();
        config.api_url = "https://cdn.example.com/js".to_string();
        let channel = DeliveryChannel::new(&config, Arc::new(RecordingTransport::new()));
        assert_eq!(
            channel.endpoint_url(Endpoint::Collect),
            "https://cdn.example.com/js/api/collect?site_key=abc"
        );
    }

    #[test]
    fn test_deliver_routes_by_kind() {
        let recorder = RecordingTransport::new();
        let channel = DeliveryChannel::new(&config(), Arc::new(recorder.clone()));

        channel.deliver(&payload("", 0));
        channel.deliver(&payload("signup", 0));
        channel.deliver(&payload("", 12));

        let sent = recorder.requests();
        assert_eq!(sent.len(), 3);
        assert!(sent[0].url.contains("/api/collect"));
        assert!(sent[1].url.contains("/api/event"));
        assert!(sent[2].url.contains("/api/collect"));
        assert_eq!(sent[2].body_json()["duration"], 12);
    }

    #[test]
    fn test_debug_config_selects_debug_transport() {
        let mut config = config();
        config.debug = true;
        assert_eq!(select_transport(&config).name(), "debug");
    }

    #[test]
    fn test_auto_prefers_beacon() {
        let transport = select_transport(&config());
        assert_eq!(transport.name(), "beacon");
        transport.close();
    }

    #[test]
    fn test_keepalive_preference() {
        let mut config = config();
        config.transport = TransportPreference::KeepAlive;
        assert_eq!(select_transport(&config).name(), "keepalive");
    }

    #[test]
    fn test_keepalive_without_runtime_drops_quietly() {
        let transport = KeepAliveTransport::new();
        transport.send("http://127.0.0.1:9/api/collect", "{}".to_string());
    }

    #[test]
    fn test_beacon_delivers_after_close() {
        let (address, rx) = one_shot_server();
        let beacon = BeaconTransport::spawn().unwrap();

        beacon.send(&format!("{}/api/collect?site_key=abc", address), r#"{"path":"/"}"#.to_string());
        beacon.close();

        let (request_line, body) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(request_line, "POST /api/collect?site_key=abc HTTP/1.1");
        assert_eq!(body, r#"{"path":"/"}"#);
    }

    #[test]
    fn test_beacon_swallows_failures() {
        let beacon = BeaconTransport::spawn().unwrap();
        // nothing listens on the discard port
        beacon.send("http://127.0.0.1:9/api/collect", "{}".to_string());
        beacon.close();
        beacon.send("http://127.0.0.1:9/api/collect", "{}".to_string());
    }

    #[test]
    fn test_beacon_drop_does_not_wait_for_collector() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = format!("http://{}", listener.local_addr().unwrap());
        // accepts the connection and never answers
        thread::spawn(move || {
            let _stream = listener.accept();
            thread::sleep(Duration::from_secs(5));
        });

        let beacon = BeaconTransport::spawn().unwrap();
        beacon.send(&format!("{}/api/collect?site_key=abc", address), "{}".to_string());
        thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        drop(beacon);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_keepalive_delivers_on_current_runtime() {
        let (address, rx) = one_shot_server();
        let transport = KeepAliveTransport::new();
        transport.send(&format!("{}/api/event?site_key=abc", address), "{}".to_string());

        let received = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(5)))
            .await
            .unwrap();
        let (request_line, _) = received.unwrap();
        assert_eq!(request_line, "POST /api/event?site_key=abc HTTP/1.1");
    }
}
