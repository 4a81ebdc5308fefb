//! Connection worker
//!
//! One worker owns one proxy-routed connection end-to-end: jittered connect,
//! TLS + WebSocket handshake, keepalive sub-task, receive loop, and the
//! unified retry/backoff transition. A worker never propagates errors to its
//! caller; every failure ends in health bookkeeping and a `WorkerExit`
//! consumed by the pool's supervision loop.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{client_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, instrument, warn};

use crate::config::{EndpointConfig, WorkerConfig};
use crate::error::{FarmError, Result};
use crate::identity::derive_device_id;
use crate::models::{AckReply, AuthResult, Inbound, Ping, ProxyEndpoint};
use crate::pool::health::HealthTracker;
use crate::session::headers::{random_user_agent, ORIGIN};
use crate::session::transport::ProxyTransport;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Why a worker terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Server sent a fatal protocol message; never retried
    Fatal,
    /// Consecutive-retry budget consumed
    Exhausted,
}

/// Completion value consumed by the pool's supervision loop
#[derive(Debug)]
pub struct WorkerExit {
    pub proxy: Arc<ProxyEndpoint>,
    pub reason: ExitReason,
}

/// How one live connection ended
enum SessionEnd {
    Fatal(String),
    Transient(FarmError),
}

enum Dispatch {
    Continue,
    Fatal(String),
}

/// Owns one proxy-routed connection to the upstream endpoint
pub struct SessionWorker {
    proxy: Arc<ProxyEndpoint>,
    user_id: String,
    device_id: String,
    config: WorkerConfig,
    endpoint: EndpointConfig,
    health: Arc<HealthTracker>,
}

impl SessionWorker {
    pub fn new(
        proxy: Arc<ProxyEndpoint>,
        user_id: String,
        config: WorkerConfig,
        endpoint: EndpointConfig,
        health: Arc<HealthTracker>,
    ) -> Self {
        let device_id = derive_device_id(&proxy);
        Self {
            proxy,
            user_id,
            device_id,
            config,
            endpoint,
            health,
        }
    }

    /// Run the connect/handshake/keepalive cycle until the proxy is given up on.
    ///
    /// Transient faults (connect errors, read timeouts, decode errors, failed
    /// keepalives) all take the same retry transition against one budget; a
    /// server `ERROR` terminates immediately.
    #[instrument(skip(self), fields(proxy = %self.proxy, device_id = %self.device_id))]
    pub async fn run(self) -> WorkerExit {
        info!("starting session worker");
        let mut attempts: u32 = 0;

        loop {
            self.jitter_delay().await;

            let user_agent = random_user_agent();
            let fault = match self.open(user_agent).await {
                Ok(ws) => {
                    info!("connected");
                    attempts = 0;
                    self.health.record_success(&self.proxy);

                    match self.drive(ws, user_agent).await {
                        SessionEnd::Fatal(message) => {
                            error!(%message, "server rejected session, giving up on proxy");
                            self.health.record_failure(&self.proxy);
                            return WorkerExit {
                                proxy: self.proxy.clone(),
                                reason: ExitReason::Fatal,
                            };
                        }
                        SessionEnd::Transient(e) => e,
                    }
                }
                Err(e) => e,
            };

            attempts += 1;
            self.health.record_failure(&self.proxy);
            warn!(
                attempt = attempts,
                max = self.config.max_retries,
                error = %fault,
                "connection attempt failed"
            );

            if attempts >= self.config.max_retries {
                error!("retry budget exhausted, removing proxy from duty");
                return WorkerExit {
                    proxy: self.proxy.clone(),
                    reason: ExitReason::Exhausted,
                };
            }
            sleep(self.config.retry_delay).await;
        }
    }

    /// Random delay before each connect attempt, desynchronizing reconnect
    /// storms across the pool.
    async fn jitter_delay(&self) {
        let (min, max) = (self.config.jitter_min, self.config.jitter_max);
        let delay = if max > min {
            let span = (max - min).as_millis() as u64;
            min + Duration::from_millis(rand::thread_rng().gen_range(0..=span))
        } else {
            min
        };
        sleep(delay).await;
    }

    /// Dial through the proxy and complete the TLS + WebSocket handshake
    async fn open(&self, user_agent: &'static str) -> Result<WsStream> {
        let tcp =
            ProxyTransport::connect(&self.proxy, self.endpoint.host(), self.endpoint.port())
                .await?;

        // Upstream certificate validation is intentionally disabled.
        let connector = if self.endpoint.is_secure() {
            let tls = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()?;
            Some(Connector::NativeTls(tls))
        } else {
            None
        };

        let mut request = self.endpoint.url.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert(http::header::ORIGIN, http::HeaderValue::from_static(ORIGIN));
        request.headers_mut().insert(
            http::header::USER_AGENT,
            http::HeaderValue::from_static(user_agent),
        );

        let (ws, _response) = client_async_tls_with_config(request, tcp, None, connector).await?;
        Ok(ws)
    }

    /// Drive one live connection: keepalive sub-task plus the receive loop.
    ///
    /// The keepalive task is aborted and awaited on every exit path; its own
    /// completion (a failed send) is the tear-down signal for ping failure.
    async fn drive(&self, ws: WsStream, user_agent: &'static str) -> SessionEnd {
        let (sink, mut stream) = ws.split();
        let sink = Arc::new(Mutex::new(sink));

        let mut keepalive = tokio::spawn(keepalive_loop(
            sink.clone(),
            self.config.ping_interval,
            self.proxy.clone(),
        ));
        let mut keepalive_done = false;

        let end = loop {
            tokio::select! {
                _ = &mut keepalive => {
                    keepalive_done = true;
                    break SessionEnd::Transient(FarmError::KeepaliveFailed);
                }
                frame = timeout(self.config.read_timeout, stream.next()) => match frame {
                    Err(_) => break SessionEnd::Transient(FarmError::ReadTimeout),
                    Ok(None) => break SessionEnd::Transient(FarmError::ConnectionClosed),
                    Ok(Some(Err(e))) => break SessionEnd::Transient(e.into()),
                    Ok(Some(Ok(Message::Text(text)))) => {
                        match self.dispatch(&sink, &text, user_agent).await {
                            Ok(Dispatch::Continue) => {}
                            Ok(Dispatch::Fatal(message)) => break SessionEnd::Fatal(message),
                            Err(e) => break SessionEnd::Transient(e),
                        }
                    }
                    Ok(Some(Ok(Message::Close(_)))) => {
                        break SessionEnd::Transient(FarmError::ConnectionClosed)
                    }
                    // Control and binary frames carry no envelopes.
                    Ok(Some(Ok(_))) => {}
                }
            }
        };

        if !keepalive_done {
            keepalive.abort();
            let _ = keepalive.await;
        }
        end
    }

    /// Decode one inbound envelope and react to it
    async fn dispatch(
        &self,
        sink: &Arc<Mutex<WsSink>>,
        text: &str,
        user_agent: &'static str,
    ) -> Result<Dispatch> {
        match Inbound::decode(text)? {
            Inbound::Auth { id } => {
                info!(envelope_id = %id, "authenticating");
                let result = AuthResult::new(
                    self.device_id.clone(),
                    self.user_id.clone(),
                    user_agent.to_string(),
                );
                send_text(sink, AckReply::auth(id, result).to_json()?).await?;
                Ok(Dispatch::Continue)
            }
            Inbound::Pong { id } => {
                debug!(envelope_id = %id, "acknowledging pong");
                send_text(sink, AckReply::pong(id).to_json()?).await?;
                Ok(Dispatch::Continue)
            }
            Inbound::Error { message } => Ok(Dispatch::Fatal(message)),
            Inbound::Unrecognized { action } => {
                debug!(?action, "ignoring unrecognized action");
                Ok(Dispatch::Continue)
            }
        }
    }
}

async fn send_text(sink: &Arc<Mutex<WsSink>>, json: String) -> Result<()> {
    sink.lock().await.send(Message::Text(json)).await?;
    Ok(())
}

/// Keepalive sub-task: one PING per interval, starting immediately on
/// connect. A failed send ends the task, which the worker's receive loop
/// observes as the signal to tear the connection down.
async fn keepalive_loop(sink: Arc<Mutex<WsSink>>, period: Duration, proxy: Arc<ProxyEndpoint>) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let json = match Ping::new().to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(proxy = %proxy, error = %e, "failed to encode ping");
                break;
            }
        };
        if let Err(e) = sink.lock().await.send(Message::Text(json)).await {
            warn!(proxy = %proxy, error = %e, "ping failed");
            break;
        }
        debug!(proxy = %proxy, "sent ping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::Value;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn test_config() -> WorkerConfig {
        WorkerConfig {
            max_retries: 1,
            retry_delay: Duration::from_millis(10),
            ping_interval: Duration::from_millis(50),
            read_timeout: Duration::from_secs(5),
            jitter_min: Duration::from_millis(1),
            jitter_max: Duration::from_millis(2),
        }
    }

    /// Minimal HTTP CONNECT forward proxy relaying every tunnel to `target`.
    /// Returns its address, a counter of accepted tunnels, and the task.
    async fn spawn_connect_proxy(
        target: SocketAddr,
    ) -> (SocketAddr, Arc<AtomicUsize>, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = connections.clone();

        let handle = tokio::spawn(async move {
            while let Ok((mut client, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 2048];
                    let n = client.read(&mut buf).await.unwrap_or(0);
                    if n == 0 {
                        return;
                    }
                    let req = String::from_utf8_lossy(&buf[..n]);
                    assert!(req.starts_with("CONNECT "));

                    let mut server = TcpStream::connect(target).await.unwrap();
                    client
                        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                        .await
                        .unwrap();
                    let _ = tokio::io::copy_bidirectional(&mut client, &mut server).await;
                });
            }
        });
        (addr, connections, handle)
    }

    fn worker_for(
        proxy: &Arc<ProxyEndpoint>,
        ws_addr: SocketAddr,
        config: WorkerConfig,
        health: &Arc<HealthTracker>,
    ) -> SessionWorker {
        let endpoint =
            EndpointConfig::new(&format!("ws://{}:{}/", ws_addr.ip(), ws_addr.port())).unwrap();
        SessionWorker::new(
            proxy.clone(),
            "user-42".to_string(),
            config,
            endpoint,
            health.clone(),
        )
    }

    #[tokio::test]
    async fn test_auth_challenge_gets_identity_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(r#"{"id":"1","action":"AUTH"}"#.to_string()))
                .await
                .unwrap();

            // Keepalive PINGs may arrive first; wait for the AUTH reply.
            loop {
                let msg = timeout(Duration::from_secs(5), ws.next())
                    .await
                    .unwrap()
                    .unwrap()
                    .unwrap();
                if let Message::Text(text) = msg {
                    let value: Value = serde_json::from_str(&text).unwrap();
                    if value.get("origin_action").is_some() {
                        break value;
                    }
                    assert_eq!(value["action"], "PING");
                }
            }
        });

        let (proxy_addr, _connections, proxy_task) = spawn_connect_proxy(ws_addr).await;
        let proxy = Arc::new(
            ProxyEndpoint::parse(&format!("http://{}:{}", proxy_addr.ip(), proxy_addr.port()))
                .unwrap(),
        );
        let health = Arc::new(HealthTracker::new());
        let worker = worker_for(&proxy, ws_addr, test_config(), &health);

        let exit = timeout(Duration::from_secs(10), worker.run()).await.unwrap();
        // Server hangs up after the reply; the single-retry budget exhausts.
        assert_eq!(exit.reason, ExitReason::Exhausted);
        assert_eq!(exit.proxy.as_ref(), proxy.as_ref());

        let reply = server.await.unwrap();
        assert_eq!(reply["id"], "1");
        assert_eq!(reply["origin_action"], "AUTH");
        let result = &reply["result"];
        assert_eq!(result["browser_id"], derive_device_id(&proxy));
        assert_eq!(result["user_id"], "user-42");
        assert_eq!(result["device_type"], "extension");
        assert_eq!(result["version"], "4.26.2");
        assert!(crate::session::headers::USER_AGENTS
            .contains(&result["user_agent"].as_str().unwrap()));

        let record = health.get(&proxy);
        assert_eq!(record.success, 1);
        assert_eq!(record.fail, 1);

        proxy_task.abort();
    }

    #[tokio::test]
    async fn test_pong_envelope_is_acknowledged() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(r#"{"id":"Y","action":"PONG"}"#.to_string()))
                .await
                .unwrap();

            loop {
                let msg = timeout(Duration::from_secs(5), ws.next())
                    .await
                    .unwrap()
                    .unwrap()
                    .unwrap();
                if let Message::Text(text) = msg {
                    let value: Value = serde_json::from_str(&text).unwrap();
                    if value.get("origin_action").is_some() {
                        break value;
                    }
                }
            }
        });

        let (proxy_addr, _connections, proxy_task) = spawn_connect_proxy(ws_addr).await;
        let proxy = Arc::new(
            ProxyEndpoint::parse(&format!("http://{}:{}", proxy_addr.ip(), proxy_addr.port()))
                .unwrap(),
        );
        let health = Arc::new(HealthTracker::new());
        let worker = worker_for(&proxy, ws_addr, test_config(), &health);

        let exit = timeout(Duration::from_secs(10), worker.run()).await.unwrap();
        assert_eq!(exit.reason, ExitReason::Exhausted);

        let ack = server.await.unwrap();
        assert_eq!(ack, serde_json::json!({"id": "Y", "origin_action": "PONG"}));

        proxy_task.abort();
    }

    #[tokio::test]
    async fn test_server_error_terminates_without_retry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(
                r#"{"id":"7","action":"ERROR","message":"banned"}"#.to_string(),
            ))
            .await
            .unwrap();
            // Hold the connection open until the worker hangs up.
            while let Some(Ok(_)) = ws.next().await {}
        });

        let (proxy_addr, connections, proxy_task) = spawn_connect_proxy(ws_addr).await;
        let proxy = Arc::new(
            ProxyEndpoint::parse(&format!("http://{}:{}", proxy_addr.ip(), proxy_addr.port()))
                .unwrap(),
        );
        let health = Arc::new(HealthTracker::new());
        // A generous retry budget proves the fatal path never reconnects.
        let config = WorkerConfig {
            max_retries: 5,
            ..test_config()
        };
        let worker = worker_for(&proxy, ws_addr, config, &health);

        let exit = timeout(Duration::from_secs(10), worker.run()).await.unwrap();
        assert_eq!(exit.reason, ExitReason::Fatal);

        let record = health.get(&proxy);
        assert_eq!(record.success, 1);
        assert_eq!(record.fail, 1);
        assert_eq!(connections.load(Ordering::SeqCst), 1);

        server.abort();
        proxy_task.abort();
    }

    #[tokio::test]
    async fn test_transient_faults_exhaust_the_retry_budget() {
        // A port nothing listens on: every connect is refused.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = listener.local_addr().unwrap();
        drop(listener);

        let proxy = Arc::new(
            ProxyEndpoint::parse(&format!("http://{}:{}", dead_addr.ip(), dead_addr.port()))
                .unwrap(),
        );
        let health = Arc::new(HealthTracker::new());
        let config = WorkerConfig {
            max_retries: 5,
            ..test_config()
        };
        let worker = worker_for(&proxy, dead_addr, config, &health);

        let exit = timeout(Duration::from_secs(10), worker.run()).await.unwrap();
        assert_eq!(exit.reason, ExitReason::Exhausted);

        let record = health.get(&proxy);
        assert_eq!(record.success, 0);
        assert_eq!(record.fail, 5);
    }

    #[tokio::test]
    async fn test_keepalive_pings_flow_until_teardown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            let mut ids = Vec::new();
            while ids.len() < 3 {
                let msg = timeout(Duration::from_secs(5), ws.next())
                    .await
                    .unwrap()
                    .unwrap()
                    .unwrap();
                if let Message::Text(text) = msg {
                    let value: Value = serde_json::from_str(&text).unwrap();
                    assert_eq!(value["action"], "PING");
                    assert_eq!(value["version"], "1.0.0");
                    assert_eq!(value["data"], serde_json::json!({}));
                    ids.push(value["id"].as_str().unwrap().to_string());
                }
            }
            ids
        });

        let (proxy_addr, _connections, proxy_task) = spawn_connect_proxy(ws_addr).await;
        let proxy = Arc::new(
            ProxyEndpoint::parse(&format!("http://{}:{}", proxy_addr.ip(), proxy_addr.port()))
                .unwrap(),
        );
        let health = Arc::new(HealthTracker::new());
        let worker = worker_for(&proxy, ws_addr, test_config(), &health);
        let worker_task = tokio::spawn(worker.run());

        let ids = server.await.unwrap();
        assert_eq!(ids.len(), 3);
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), 3, "every ping carries a fresh id");

        let exit = timeout(Duration::from_secs(10), worker_task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.reason, ExitReason::Exhausted);

        proxy_task.abort();
    }

    #[tokio::test]
    async fn test_read_timeout_tears_the_session_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_addr = listener.local_addr().unwrap();

        // A server that accepts the handshake and then goes silent.
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let (proxy_addr, _connections, proxy_task) = spawn_connect_proxy(ws_addr).await;
        let proxy = Arc::new(
            ProxyEndpoint::parse(&format!("http://{}:{}", proxy_addr.ip(), proxy_addr.port()))
                .unwrap(),
        );
        let health = Arc::new(HealthTracker::new());
        let config = WorkerConfig {
            read_timeout: Duration::from_millis(100),
            ..test_config()
        };
        let worker = worker_for(&proxy, ws_addr, config, &health);

        let exit = timeout(Duration::from_secs(10), worker.run()).await.unwrap();
        assert_eq!(exit.reason, ExitReason::Exhausted);

        let record = health.get(&proxy);
        assert_eq!(record.success, 1);
        assert_eq!(record.fail, 1);

        server.abort();
        proxy_task.abort();
    }
}
