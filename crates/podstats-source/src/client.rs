//! Minimal HTTP client for the Kubernetes API server.
//!
//! Opens one HTTP/1 connection per request, over plain TCP or rustls,
//! and authenticates with a bearer token. Long-lived watch responses keep
//! their connection until the body is dropped.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{ACCEPT, AUTHORIZATION, HOST, USER_AGENT};
use http::{Method, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::SourceError;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How to reach and authenticate against the API server.
#[derive(Clone, Default)]
pub struct ApiClientConfig {
    /// Base URL, e.g. `https://10.96.0.1:443` or `http://127.0.0.1:8001`.
    pub api_server: String,
    pub token: Option<String>,
    /// PEM bundle trusted for `https` servers. Falls back to the webpki roots.
    pub ca_pem: Option<Vec<u8>>,
}

impl std::fmt::Debug for ApiClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClientConfig")
            .field("api_server", &self.api_server)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("ca_pem", &self.ca_pem.as_ref().map(|pem| pem.len()))
            .finish()
    }
}

impl ApiClientConfig {
    pub fn new(api_server: impl Into<String>) -> Self {
        Self {
            api_server: api_server.into(),
            ..Default::default()
        }
    }

    /// Read a bearer token from `path`, trimming surrounding whitespace.
    pub fn with_token_file(mut self, path: &Path) -> Result<Self, SourceError> {
        let token = std::fs::read_to_string(path)
            .map_err(|e| SourceError::Credentials(format!("read token {}: {e}", path.display())))?;
        self.token = Some(token.trim().to_string());
        Ok(self)
    }

    pub fn with_ca_file(mut self, path: &Path) -> Result<Self, SourceError> {
        let pem = std::fs::read(path)
            .map_err(|e| SourceError::Credentials(format!("read CA bundle {}: {e}", path.display())))?;
        self.ca_pem = Some(pem);
        Ok(self)
    }

    /// Service-account configuration when running inside a pod.
    ///
    /// Returns `Ok(None)` when `KUBERNETES_SERVICE_HOST` is not set.
    pub fn in_cluster() -> Result<Option<Self>, SourceError> {
        let Ok(host) = std::env::var("KUBERNETES_SERVICE_HOST") else {
            return Ok(None);
        };
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
        let host = if host.contains(':') { format!("[{host}]") } else { host };
        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        let config = Self::new(format!("https://{host}:{port}"))
            .with_token_file(&dir.join("token"))?
            .with_ca_file(&dir.join("ca.crt"))?;
        Ok(Some(config))
    }
}

struct Endpoint {
    host: String,
    port: u16,
    authority: String,
    base_path: String,
}

/// Cheaply cloneable API server client.
#[derive(Clone)]
pub struct ApiClient {
    endpoint: Arc<Endpoint>,
    token: Option<Arc<str>>,
    tls: Option<TlsConnector>,
    request_timeout: Duration,
}

impl ApiClient {
    pub fn new(config: ApiClientConfig) -> Result<Self, SourceError> {
        let uri: Uri = config
            .api_server
            .parse()
            .map_err(|_| SourceError::InvalidUrl(config.api_server.clone()))?;
        let secure = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            _ => return Err(SourceError::InvalidUrl(config.api_server.clone())),
        };
        let authority = uri
            .authority()
            .ok_or_else(|| SourceError::InvalidUrl(config.api_server.clone()))?;
        let host = authority.host().trim_start_matches('[').trim_end_matches(']').to_string();
        let port = authority.port_u16().unwrap_or(if secure { 443 } else { 80 });
        let base_path = uri.path().trim_end_matches('/').to_string();

        let tls = if secure {
            Some(tls_connector(config.ca_pem.as_deref())?)
        } else {
            None
        };

        debug!(%host, port, secure, "api client configured");

        Ok(Self {
            endpoint: Arc::new(Endpoint {
                host,
                port,
                authority: authority.to_string(),
                base_path,
            }),
            token: config.token.map(Arc::from),
            tls,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Bound on connecting plus receiving response headers, and separately
    /// on reading a whole JSON body.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Issue a GET and return the response once headers arrive.
    ///
    /// Non-2xx responses are turned into errors; `410 Gone` becomes
    /// [`SourceError::Expired`].
    pub async fn get(&self, path_and_query: &str) -> Result<Response<Incoming>, SourceError> {
        tokio::time::timeout(self.request_timeout, self.request(path_and_query))
            .await
            .map_err(|_| SourceError::Timeout {
                what: format!("GET {path_and_query}"),
                after: self.request_timeout,
            })?
    }

    async fn request(&self, path_and_query: &str) -> Result<Response<Incoming>, SourceError> {
        let endpoint = &self.endpoint;
        let uri = format!("{}{}", endpoint.base_path, path_and_query);

        let mut builder = Request::builder()
            .method(Method::GET)
            .uri(&uri)
            .header(HOST, &endpoint.authority)
            .header(USER_AGENT, concat!("podstats/", env!("CARGO_PKG_VERSION")))
            .header(ACCEPT, "application/json");
        if let Some(token) = &self.token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let req = builder
            .body(Empty::<Bytes>::new())
            .map_err(|e| SourceError::Http(e.to_string()))?;

        let addr = format!("{}:{}", endpoint.host, endpoint.port);
        let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| SourceError::Connect {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;

        let resp = match &self.tls {
            Some(connector) => {
                let name = ServerName::try_from(endpoint.host.clone())
                    .map_err(|e| SourceError::Tls(format!("server name {}: {e}", endpoint.host)))?;
                let stream = connector
                    .connect(name, tcp)
                    .await
                    .map_err(|e| SourceError::Tls(e.to_string()))?;
                send(stream, req).await?
            }
            None => send(tcp, req).await?,
        };

        if resp.status().is_success() {
            return Ok(resp);
        }
        Err(status_error(&uri, resp).await)
    }

    /// GET and decode a JSON body.
    pub async fn get_json<T: DeserializeOwned>(&self, path_and_query: &str) -> Result<T, SourceError> {
        let resp = self.get(path_and_query).await?;
        let body = tokio::time::timeout(self.request_timeout, resp.into_body().collect())
            .await
            .map_err(|_| SourceError::Timeout {
                what: format!("reading {path_and_query}"),
                after: self.request_timeout,
            })?
            .map_err(|e| SourceError::Http(e.to_string()))?
            .to_bytes();
        serde_json::from_slice(&body).map_err(|e| SourceError::Decode(format!("{path_and_query}: {e}")))
    }
}

async fn send<S>(io: S, req: Request<Empty<Bytes>>) -> Result<Response<Incoming>, SourceError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .map_err(|e| SourceError::Http(format!("handshake: {e}")))?;

    // Drive the connection in the background until the body is consumed.
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "api connection ended with error");
        }
    });

    sender
        .send_request(req)
        .await
        .map_err(|e| SourceError::Http(e.to_string()))
}

/// Error body returned by the API server for failed requests.
#[derive(serde::Deserialize)]
struct StatusBody {
    #[serde(default)]
    message: String,
}

async fn status_error(path: &str, resp: Response<Incoming>) -> SourceError {
    let status = resp.status();
    let message = match resp.into_body().collect().await {
        Ok(body) => {
            let bytes = body.to_bytes();
            serde_json::from_slice::<StatusBody>(&bytes)
                .map(|s| s.message)
                .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).trim().to_string())
        }
        Err(e) => e.to_string(),
    };
    if status == StatusCode::GONE {
        return SourceError::Expired(message);
    }
    SourceError::Status {
        path: path.to_string(),
        status: status.as_u16(),
        message,
    }
}

fn tls_connector(ca_pem: Option<&[u8]>) -> Result<TlsConnector, SourceError> {
    let mut roots = rustls::RootCertStore::empty();
    match ca_pem {
        Some(mut pem) => {
            for cert in rustls_pemfile::certs(&mut pem) {
                let cert = cert.map_err(|e| SourceError::Tls(format!("parse CA bundle: {e}")))?;
                roots
                    .add(cert)
                    .map_err(|e| SourceError::Tls(format!("add CA certificate: {e}")))?;
            }
            if roots.is_empty() {
                return Err(SourceError::Tls("CA bundle holds no certificates".to_string()));
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| SourceError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and return the raw request text.
    async fn one_shot_server(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });
        (format!("http://{addr}"), handle)
    }

    /// Accept one connection, optionally write `prefix`, then go quiet while
    /// holding the socket open.
    async fn stalled_server(prefix: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await.unwrap();
            socket.write_all(prefix.as_bytes()).await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(socket);
        });
        format!("http://{addr}")
    }

    #[test]
    fn rejects_unsupported_scheme() {
        let err = ApiClient::new(ApiClientConfig::new("ftp://example.com")).err().unwrap();
        assert!(matches!(err, SourceError::InvalidUrl(_)));
    }

    #[test]
    fn rejects_relative_url() {
        let err = ApiClient::new(ApiClientConfig::new("/api")).err().unwrap();
        assert!(matches!(err, SourceError::InvalidUrl(_)));
    }

    #[test]
    fn https_with_default_roots_builds() {
        assert!(ApiClient::new(ApiClientConfig::new("https://10.96.0.1")).is_ok());
    }

    #[test]
    fn https_with_empty_ca_bundle_fails() {
        let config = ApiClientConfig {
            api_server: "https://10.96.0.1".to_string(),
            ca_pem: Some(b"not a certificate".to_vec()),
            ..Default::default()
        };
        assert!(matches!(ApiClient::new(config).err().unwrap(), SourceError::Tls(_)));
    }

    #[test]
    fn debug_redacts_token() {
        let config = ApiClientConfig {
            api_server: "http://localhost".to_string(),
            token: Some("secret-token".to_string()),
            ca_pem: None,
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("secret-token"));
        assert!(rendered.contains("<redacted>"));
    }

    #[tokio::test]
    async fn get_json_sends_bearer_token() {
        let (url, server) = one_shot_server(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 11\r\nconnection: close\r\n\r\n{\"a\": true}",
        )
        .await;
        let client = ApiClient::new(ApiClientConfig {
            api_server: url,
            token: Some("abc".to_string()),
            ca_pem: None,
        })
        .unwrap();

        let value: serde_json::Value = client.get_json("/api/v1/namespaces/default/pods").await.unwrap();
        assert_eq!(value["a"], true);

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /api/v1/namespaces/default/pods HTTP/1.1"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer abc"));
    }

    #[tokio::test]
    async fn gone_maps_to_expired() {
        let (url, _server) = one_shot_server(
            "HTTP/1.1 410 Gone\r\ncontent-type: application/json\r\ncontent-length: 30\r\nconnection: close\r\n\r\n{\"message\":\"too old resource\"}",
        )
        .await;
        let client = ApiClient::new(ApiClientConfig::new(url)).unwrap();

        let err = client.get("/api/v1/pods").await.unwrap_err();
        assert!(err.is_expired(), "got {err}");
    }

    #[tokio::test]
    async fn forbidden_maps_to_status() {
        let (url, _server) = one_shot_server(
            "HTTP/1.1 403 Forbidden\r\ncontent-length: 6\r\nconnection: close\r\n\r\nnope!\n",
        )
        .await;
        let client = ApiClient::new(ApiClientConfig::new(url)).unwrap();

        match client.get("/api/v1/pods").await.unwrap_err() {
            SourceError::Status { status, message, .. } => {
                assert_eq!(status, 403);
                assert_eq!(message, "nope!");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn connection_refused_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = ApiClient::new(ApiClientConfig::new(format!("http://{addr}"))).unwrap();
        let err = client.get("/api").await.unwrap_err();
        assert!(matches!(err, SourceError::Connect { .. }));
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let url = stalled_server("").await;
        let client = ApiClient::new(ApiClientConfig::new(url))
            .unwrap()
            .with_request_timeout(Duration::from_millis(200));

        let result = tokio::time::timeout(Duration::from_secs(5), client.get("/api/v1/pods")).await;
        match result.expect("request was not bounded") {
            Err(SourceError::Timeout { after, .. }) => assert_eq!(after, Duration::from_millis(200)),
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("silent server produced a response"),
        }
    }

    #[tokio::test]
    async fn stalled_body_times_out() {
        let url = stalled_server("HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 100\r\n\r\n{\"items\": [").await;
        let client = ApiClient::new(ApiClientConfig::new(url))
            .unwrap()
            .with_request_timeout(Duration::from_millis(200));

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            client.get_json::<serde_json::Value>("/api/v1/pods"),
        )
        .await;
        assert!(matches!(
            result.expect("body read was not bounded"),
            Err(SourceError::Timeout { .. })
        ));
    }
}
