//! Transport connector: opens one authenticated WebSocket per tunnel.
//!
//! The connector is built once per session from [`ControlPlaneConfig`]: it
//! resolves the TLS mode (plain, verified, client certificate, custom root
//! CA, or skip-verify) and the credential metadata attached to every
//! upgrade request.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::USER_AGENT;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ControlPlaneConfig;
use crate::error::TunnelError;

/// A connected tunnel stream.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const API_KEY_META: &str = "api-key";
const CLUSTER_ID_META: &str = "cluster-id";
const ORGANIZATION_ID_META: &str = "organization-id";
const ENVIRONMENT_ID_META: &str = "environment-id";
const MIGRATE_META: &str = "migrate";
const RUNNER_ID_META: &str = "runner-id";

/// The independent streams of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelKind {
    Command,
    Events,
    Logs,
    Notifications,
}

impl TunnelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Events => "events",
            Self::Logs => "logs",
            Self::Notifications => "notifications",
        }
    }

    fn path(self) -> &'static str {
        match self {
            Self::Command => "agent/v1/execute",
            Self::Events => "agent/v1/events",
            Self::Logs => "agent/v1/logs",
            Self::Notifications => "agent/v1/notifications",
        }
    }

    /// Relay tunnels are runner-scoped and carry the runner identity.
    fn carries_runner_id(self) -> bool {
        matches!(self, Self::Logs | Self::Notifications)
    }
}

/// Credentials and identity sent as connection metadata.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub api_key: String,
    pub runner_id: Option<String>,
    pub cluster_id: String,
    pub organization_id: String,
    pub environment_id: String,
    pub migrate: String,
}

impl Credentials {
    pub fn from_config(config: &ControlPlaneConfig) -> Self {
        Self {
            api_key: config.api_key.clone(),
            runner_id: Some(config.runner_id.clone()).filter(|id| !id.is_empty()),
            cluster_id: config.cluster_id.clone(),
            organization_id: config.organization_id.clone(),
            environment_id: config.environment_id.clone(),
            migrate: config.migrate.clone(),
        }
    }
}

pub struct ControlPlaneConnector {
    base_url: String,
    tls: Option<native_tls::TlsConnector>,
    credentials: Credentials,
    connect_timeout: Duration,
    user_agent: String,
}

impl ControlPlaneConnector {
    pub fn from_config(config: &ControlPlaneConfig) -> Result<Self, TunnelError> {
        let tls = if config.insecure {
            None
        } else {
            Some(build_tls(config)?)
        };
        let user_agent = format!("testkube-agent/{}", env!("CARGO_PKG_VERSION"));

        info!(
            server = %config.url,
            insecure = config.insecure,
            skip_verify = config.skip_verify,
            cert_file = %config.cert_file,
            ca_file = %config.ca_file,
            user_agent = %user_agent,
            "initiating connection with agent api"
        );

        Ok(Self {
            base_url: normalize_base_url(&config.url, config.insecure),
            tls,
            credentials: Credentials::from_config(config),
            connect_timeout: config.connect_timeout(),
            user_agent,
        })
    }

    pub fn api_key(&self) -> &str {
        &self.credentials.api_key
    }

    pub fn url_for(&self, kind: TunnelKind) -> String {
        format!("{}/{}", self.base_url, kind.path())
    }

    /// Upgrade request for `kind`, with all non-empty metadata attached.
    pub fn request_for(&self, kind: TunnelKind) -> Result<Request, TunnelError> {
        let url = self.url_for(kind);
        let mut request = url.as_str().into_client_request()?;
        let creds = &self.credentials;

        let mut metadata = vec![
            (API_KEY_META, creds.api_key.as_str()),
            (CLUSTER_ID_META, creds.cluster_id.as_str()),
            (ORGANIZATION_ID_META, creds.organization_id.as_str()),
            (ENVIRONMENT_ID_META, creds.environment_id.as_str()),
            (MIGRATE_META, creds.migrate.as_str()),
        ];
        if kind.carries_runner_id() {
            if let Some(runner_id) = creds.runner_id.as_deref() {
                metadata.push((RUNNER_ID_META, runner_id));
            }
        }

        let headers = request.headers_mut();
        for (name, value) in metadata.into_iter().filter(|(_, v)| !v.is_empty()) {
            let value = HeaderValue::from_str(value).map_err(|e| TunnelError::InvalidHeader {
                name,
                reason: e.to_string(),
            })?;
            headers.insert(HeaderName::from_static(name), value);
        }
        let user_agent =
            HeaderValue::from_str(&self.user_agent).map_err(|e| TunnelError::InvalidHeader {
                name: "user-agent",
                reason: e.to_string(),
            })?;
        headers.insert(USER_AGENT, user_agent);

        Ok(request)
    }

    /// Open the stream for `kind`, bounded by the connect timeout.
    pub async fn open(
        &self,
        kind: TunnelKind,
        cancel: &CancellationToken,
    ) -> Result<WsStream, TunnelError> {
        let request = self.request_for(kind)?;
        let url = self.url_for(kind);
        let connector = self.tls.clone().map(Connector::NativeTls);
        let connect =
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector);

        tokio::select! {
            () = cancel.cancelled() => Err(TunnelError::Cancelled),
            res = tokio::time::timeout(self.connect_timeout, connect) => match res {
                Ok(Ok((stream, _response))) => {
                    info!(tunnel = kind.as_str(), "initiating streaming connection with control plane");
                    Ok(stream)
                }
                Ok(Err(e)) => Err(TunnelError::Connect { url, reason: e.to_string() }),
                Err(_) => Err(TunnelError::Connect {
                    url,
                    reason: format!("timed out after {:?}", self.connect_timeout),
                }),
            },
        }
    }
}

/// Map `http(s)` to `ws(s)`, force plain `ws` when insecure, drop trailing `/`.
fn normalize_base_url(url: &str, insecure: bool) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    let (scheme, rest) = trimmed.split_once("://").unwrap_or(("wss", trimmed));
    let scheme = match (scheme, insecure) {
        (_, true) => "ws",
        ("https" | "wss", false) => "wss",
        ("http" | "ws", false) => "ws",
        (other, false) => other,
    };
    format!("{scheme}://{rest}")
}

fn build_tls(config: &ControlPlaneConfig) -> Result<native_tls::TlsConnector, TunnelError> {
    let mut builder = native_tls::TlsConnector::builder();
    builder.min_protocol_version(Some(native_tls::Protocol::Tlsv12));

    if config.skip_verify {
        builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true);
    } else {
        if !config.cert_file.is_empty() && !config.key_file.is_empty() {
            let cert = read_pem(&config.cert_file, "client certificate")?;
            let key = read_pem(&config.key_file, "client key")?;
            let identity = native_tls::Identity::from_pkcs8(&cert, &key)
                .map_err(|e| TunnelError::Tls(format!("error parsing client certificate: {e}")))?;
            builder.identity(identity);
        }
        if !config.ca_file.is_empty() {
            let pem = read_pem(&config.ca_file, "root CA")?;
            let ca = native_tls::Certificate::from_pem(&pem).map_err(|e| {
                TunnelError::Tls(format!("failed to parse root certificate from {}: {e}", config.ca_file))
            })?;
            builder.add_root_certificate(ca);
        }
    }

    builder.build().map_err(|e| TunnelError::Tls(e.to_string()))
}

fn read_pem(path: &str, what: &str) -> Result<Vec<u8>, TunnelError> {
    std::fs::read(path).map_err(|e| TunnelError::Tls(format!("error loading {what} {path}: {e}")))
}
