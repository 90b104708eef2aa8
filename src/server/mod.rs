//! WebSocket shell server
//!
//! Listens for WebSocket upgrades on two routes:
//! `/ws/{namespace}/{pod}/{container}/webshell` bridges the connection to a
//! remote shell through a terminal session, and
//! `/ws/{namespace}/{pod}/{container}/logs` streams container log output
//! through a write-only log session. Both validate the origin and the
//! target pod before touching the remote side.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, Uri};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{error, info, warn};

use crate::exec::{
    start_process, validate_target, LogOptions, LogStreamer, PodInspector, PodTarget, RemoteExec,
};
use crate::terminal::{LogSink, PtyHandler, WsLogSession, WsSession, MAX_MESSAGE_SIZE};

/// Upgrade-time policy for incoming connections.
#[derive(Debug, Clone)]
pub struct UpgradeConfig {
    /// How long a client may take to complete the WebSocket handshake
    pub handshake_timeout: Duration,
    /// Per-message cap, matching the terminal protocol's frame limit
    pub max_message_size: usize,
    /// Origins allowed to connect; empty allows any origin
    pub allowed_origins: Vec<String>,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(2),
            max_message_size: MAX_MESSAGE_SIZE,
            allowed_origins: Vec::new(),
        }
    }
}

/// Configuration for the shell server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Command launched in the target container for each session
    pub command: Vec<String>,
    /// Connection upgrade policy
    pub upgrade: UpgradeConfig,
}

impl ServerConfig {
    /// Create a new server configuration with the default shell command
    pub fn new(bind: String, port: u16) -> Self {
        Self {
            bind,
            port,
            command: vec!["/bin/sh".to_string()],
            upgrade: UpgradeConfig::default(),
        }
    }

    /// Set the command launched for each session
    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    /// Restrict connections to the given origins
    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.upgrade.allowed_origins = origins;
        self
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// The two WebSocket endpoints a client can request.
#[derive(Debug, Clone, PartialEq, Eq)]
enum WsRoute {
    Shell(PodTarget),
    Logs(PodTarget, LogOptions),
}

/// WebSocket server bridging shell and log sessions into remote containers
pub struct BridgeServer {
    config: ServerConfig,
    executor: Arc<dyn RemoteExec>,
    inspector: Arc<dyn PodInspector>,
    logs: Arc<dyn LogStreamer>,
    shutdown_tx: broadcast::Sender<()>,
}

impl BridgeServer {
    /// Create a new server over the given execution, inspection and
    /// log-streaming backends
    pub fn new(
        config: ServerConfig,
        executor: Arc<dyn RemoteExec>,
        inspector: Arc<dyn PodInspector>,
        logs: Arc<dyn LogStreamer>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            executor,
            inspector,
            logs,
            shutdown_tx,
        }
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Run the server
    ///
    /// Listens for incoming connections and handles them concurrently. A
    /// failed session never takes down the listener; the loop exits on a
    /// shutdown signal.
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!(
            "shell server listening on ws://{}/ws/{{namespace}}/{{pod}}/{{container}}/webshell",
            addr
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let executor = Arc::clone(&self.executor);
                            let inspector = Arc::clone(&self.inspector);
                            let logs = Arc::clone(&self.logs);
                            let command = self.config.command.clone();
                            let upgrade = self.config.upgrade.clone();

                            tokio::spawn(async move {
                                let peer = peer_addr.to_string();
                                if let Err(e) = handle_connection(
                                    stream, peer.clone(), executor, inspector, logs, command, upgrade,
                                )
                                .await
                                {
                                    error!("Connection error from {}: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Handle a single connection: upgrade, resolve the route from the request
/// path, then serve a shell or log session to completion.
async fn handle_connection<S>(
    stream: S,
    peer: String,
    executor: Arc<dyn RemoteExec>,
    inspector: Arc<dyn PodInspector>,
    logs: Arc<dyn LogStreamer>,
    command: Vec<String>,
    upgrade: UpgradeConfig,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    info!("New connection from {}", peer);

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(upgrade.max_message_size);
    ws_config.max_frame_size = Some(upgrade.max_message_size);

    let mut route: Option<WsRoute> = None;
    let allowed_origins = upgrade.allowed_origins.clone();
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let origin = request
            .headers()
            .get("origin")
            .and_then(|v| v.to_str().ok());
        if !origin_allowed(&allowed_origins, origin) {
            let mut rejection = ErrorResponse::new(Some("origin not allowed".to_string()));
            *rejection.status_mut() = StatusCode::FORBIDDEN;
            return Err(rejection);
        }
        match parse_ws_route(request.uri()) {
            Some(parsed) => {
                route = Some(parsed);
                Ok(response)
            }
            None => {
                let mut rejection = ErrorResponse::new(Some("no such route".to_string()));
                *rejection.status_mut() = StatusCode::NOT_FOUND;
                Err(rejection)
            }
        }
    };

    let ws = timeout(
        upgrade.handshake_timeout,
        accept_hdr_async_with_config(stream, callback, Some(ws_config)),
    )
    .await??;
    let route = match route {
        Some(route) => route,
        // The callback rejects before the handshake completes; reaching
        // here without a route means the upgrade never happened.
        None => anyhow::bail!("upgrade completed without a resolved route"),
    };

    match route {
        WsRoute::Shell(target) => {
            info!(
                "session from {} -> {}/{} container {}",
                peer, target.namespace, target.pod, target.container
            );
            let session: Arc<dyn PtyHandler> = Arc::new(WsSession::new(ws, true));

            let status = match inspector.pod_status(&target.namespace, &target.pod).await {
                Ok(status) => status,
                Err(e) => {
                    let message = format!("Validate pod error! err: {}", e);
                    warn!("{}", message);
                    let _ = session.write_stdout(message.as_bytes()).await;
                    session.done().await;
                    return Err(e);
                }
            };

            // Session-level failures were already reported to the peer; keep
            // them out of the listener's error path.
            if let Err(e) = start_process(executor, session, command, target, status).await {
                warn!("session from {} ended with error: {}", peer, e);
            }
        }
        WsRoute::Logs(target, options) => {
            info!(
                "log session from {} -> {}/{} container {}, tail: {}, follow: {}",
                peer, target.namespace, target.pod, target.container,
                options.tail_lines, options.follow
            );
            let sink: Arc<dyn LogSink> = Arc::new(WsLogSession::new(ws));
            serve_logs(sink, inspector, logs, target, options).await?;
        }
    }

    info!("Connection from {} closed", peer);
    Ok(())
}

/// Validate the target, then stream its logs into the sink. The sink is
/// closed on every path; failures are reported to the peer with one write
/// first.
async fn serve_logs(
    sink: Arc<dyn LogSink>,
    inspector: Arc<dyn PodInspector>,
    logs: Arc<dyn LogStreamer>,
    target: PodTarget,
    options: LogOptions,
) -> anyhow::Result<()> {
    let status = match inspector.pod_status(&target.namespace, &target.pod).await {
        Ok(status) => status,
        Err(e) => {
            let message = format!("Validate pod error! err: {}", e);
            warn!("{}", message);
            let _ = sink.write(message.as_bytes()).await;
            sink.close().await;
            return Err(e);
        }
    };
    if let Err(e) = validate_target(&status, &target.container) {
        let message = format!("Validate pod error! err: {}", e);
        warn!("{}", message);
        let _ = sink.write(message.as_bytes()).await;
        sink.close().await;
        return Ok(());
    }

    if let Err(e) = logs.stream_logs(&target, options, Arc::clone(&sink)).await {
        let message = format!("log err: {}", e);
        warn!("{}", message);
        let _ = sink.write(message.as_bytes()).await;
    }
    sink.close().await;
    Ok(())
}

/// Parse `/ws/{namespace}/{pod}/{container}/webshell` or
/// `/ws/{namespace}/{pod}/{container}/logs` (with optional `tail` and
/// `follow` query parameters) into a route.
fn parse_ws_route(uri: &Uri) -> Option<WsRoute> {
    let mut parts = uri.path().split('/');
    if parts.next() != Some("") || parts.next() != Some("ws") {
        return None;
    }
    let namespace = parts.next()?;
    let pod = parts.next()?;
    let container = parts.next()?;
    let endpoint = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    if namespace.is_empty() || pod.is_empty() || container.is_empty() {
        return None;
    }
    let target = PodTarget::new(namespace, pod, container);
    match endpoint {
        "webshell" => Some(WsRoute::Shell(target)),
        "logs" => Some(WsRoute::Logs(target, parse_log_query(uri.query()))),
        _ => None,
    }
}

/// Unparseable or missing values fall back to the defaults, they never
/// reject the request.
fn parse_log_query(query: Option<&str>) -> LogOptions {
    let mut options = LogOptions::default();
    for pair in query.unwrap_or("").split('&') {
        match pair.split_once('=') {
            Some(("tail", value)) => {
                options.tail_lines = value.parse().unwrap_or(0);
            }
            Some(("follow", value)) => {
                options.follow = matches!(value, "true" | "1");
            }
            _ => {}
        }
    }
    options
}

/// An empty allowlist admits every origin, including absent ones.
fn origin_allowed(allowed: &[String], origin: Option<&str>) -> bool {
    if allowed.is_empty() {
        return true;
    }
    match origin {
        Some(origin) => allowed.iter().any(|a| a == origin),
        None => false,
    }
}
