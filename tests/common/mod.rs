#![allow(dead_code)]

use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    HeaderMap, Method, Request, Response, StatusCode, Uri, body::Incoming, header,
    service::service_fn,
};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use rustls::{
    RootCertStore, ServerConfig,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
    server::WebPkiClientVerifier,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    sync::oneshot,
};
use tokio_rustls::TlsAcceptor;

#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

type Responder = dyn Fn(&CapturedRequest, usize) -> Response<Full<Bytes>> + Send + Sync;

struct UpstreamState {
    captured: Mutex<Vec<CapturedRequest>>,
    respond: Box<Responder>,
}

/// Fixture upstream that records every request it answers.
pub struct TestUpstream {
    pub addr: SocketAddr,
    state: Arc<UpstreamState>,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl TestUpstream {
    pub fn hits(&self) -> usize {
        self.state.captured.lock().unwrap().len()
    }

    pub fn captured(&self) -> Vec<CapturedRequest> {
        self.state.captured.lock().unwrap().clone()
    }

    pub fn http_url(&self, base_path: &str) -> String {
        format!("http://{}{base_path}", self.addr)
    }

    /// `https://localhost:<port><base_path>`, matching the test server certificate.
    pub fn https_url(&self, base_path: &str) -> String {
        format!("https://localhost:{}{base_path}", self.addr.port())
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

/// Plain HTTP upstream. `respond` gets the request and its 1-based hit number.
pub async fn spawn_upstream<F>(respond: F) -> TestUpstream
where
    F: Fn(&CapturedRequest, usize) -> Response<Full<Bytes>> + Send + Sync + 'static,
{
    spawn(None, respond).await
}

/// HTTPS upstream terminating TLS with `tls`.
pub async fn spawn_tls_upstream<F>(tls: Arc<ServerConfig>, respond: F) -> TestUpstream
where
    F: Fn(&CapturedRequest, usize) -> Response<Full<Bytes>> + Send + Sync + 'static,
{
    spawn(Some(TlsAcceptor::from(tls)), respond).await
}

async fn spawn<F>(acceptor: Option<TlsAcceptor>, respond: F) -> TestUpstream
where
    F: Fn(&CapturedRequest, usize) -> Response<Full<Bytes>> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(UpstreamState {
        captured: Mutex::new(Vec::new()),
        respond: Box::new(respond),
    });

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let loop_state = Arc::clone(&state);
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let state = Arc::clone(&loop_state);
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        match acceptor {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(tls_stream) => serve_io(tls_stream, state).await,
                                // Handshake refused, e.g. no client certificate.
                                Err(_) => {}
                            },
                            None => serve_io(stream, state).await,
                        }
                    });
                }
            }
        }
    });

    TestUpstream {
        addr,
        state,
        shutdown_tx,
        join,
    }
}

async fn serve_io<T>(stream: T, state: Arc<UpstreamState>)
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move {
            let (parts, body) = req.into_parts();
            let body = body.collect().await?.to_bytes();
            let captured = CapturedRequest {
                method: parts.method,
                uri: parts.uri,
                headers: parts.headers,
                body,
            };
            let hit = {
                let mut log = state.captured.lock().unwrap();
                log.push(captured.clone());
                log.len()
            };
            Ok::<_, hyper::Error>((state.respond)(&captured, hit))
        }
    });

    let builder = ConnectionBuilder::new(TokioExecutor::new());
    let _ = builder.serve_connection(TokioIo::new(stream), service).await;
}

pub fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, "text/plain".parse().unwrap());
    response
}

/// Answers with a JSON object of the request headers (first value per name).
pub fn echo_headers(request: &CapturedRequest, _hit: usize) -> Response<Full<Bytes>> {
    let mut object = serde_json::Map::new();
    for (name, value) in &request.headers {
        object
            .entry(name.as_str().to_owned())
            .or_insert_with(|| String::from_utf8_lossy(value.as_bytes()).into_owned().into());
    }
    let mut response = Response::new(Full::new(Bytes::from(
        serde_json::to_vec(&object).unwrap(),
    )));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
    response
}

/// Answers with the path and query the upstream saw.
pub fn echo_path(request: &CapturedRequest, _hit: usize) -> Response<Full<Bytes>> {
    let path = request
        .uri
        .path_and_query()
        .map(|path_and_query| path_and_query.as_str().to_owned())
        .unwrap_or_default();
    text(StatusCode::OK, path)
}

/// A different body on every hit, standing in for a clock-driven upstream.
pub fn changes_every_hit(_request: &CapturedRequest, hit: usize) -> Response<Full<Bytes>> {
    text(StatusCode::OK, format!("response #{hit}"))
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn text(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap()
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

/// Sends one request to the proxy listening on `addr` over a fresh connection.
pub async fn send(
    addr: SocketAddr,
    method: Method,
    path: &str,
    headers: &[(&str, &str)],
    body: &'static [u8],
) -> TestResponse {
    let mut connector = HttpConnector::new();
    connector.enforce_http(false);
    let client: Client<HttpConnector, Full<Bytes>> =
        Client::builder(TokioExecutor::new()).build(connector);

    let mut request = Request::builder()
        .method(method)
        .uri(format!("http://{addr}{path}"));
    for (name, value) in headers {
        request = request.header(*name, *value);
    }
    let request = request.body(Full::new(Bytes::from_static(body))).unwrap();

    let response = client.request(request).await.unwrap();
    let (parts, body) = response.into_parts();
    TestResponse {
        status: parts.status,
        headers: parts.headers,
        body: body.collect().await.unwrap().to_bytes(),
    }
}

pub async fn get(addr: SocketAddr, path: &str, headers: &[(&str, &str)]) -> TestResponse {
    send(addr, Method::GET, path, headers, b"").await
}

/// Fixture files in `dir`, sorted by name.
pub fn fixture_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("json"))
        .collect();
    files.sort();
    files
}

pub fn read_fixture(path: &Path) -> serde_json::Value {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Throwaway certificate authority for TLS tests.
pub struct TestPki {
    ca_cert: CertificateDer<'static>,
    pub ca_cert_pem: String,
    issuer: Issuer<'static, KeyPair>,
}

pub struct Identity {
    pub cert_pem: String,
    pub key_pem: String,
    cert: CertificateDer<'static>,
    key_der: Vec<u8>,
}

impl Identity {
    pub fn cert_chain(&self) -> Vec<CertificateDer<'static>> {
        vec![self.cert.clone()]
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivatePkcs8KeyDer::from(self.key_der.clone()).into()
    }
}

impl TestPki {
    pub fn new() -> Self {
        let mut params = CertificateParams::new(Vec::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, "tapedeck test CA");
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
        ];
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();

        Self {
            ca_cert: cert.der().clone(),
            ca_cert_pem: cert.pem(),
            issuer: Issuer::new(params, key),
        }
    }

    pub fn server_identity(&self) -> Identity {
        let mut params =
            CertificateParams::new(vec!["localhost".to_owned(), "127.0.0.1".to_owned()]).unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, "localhost");
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.is_ca = IsCa::NoCa;
        self.issue(params)
    }

    pub fn client_identity(&self, common_name: &str) -> Identity {
        let mut params = CertificateParams::new(Vec::new()).unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        params.is_ca = IsCa::NoCa;
        self.issue(params)
    }

    fn issue(&self, params: CertificateParams) -> Identity {
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.issuer).unwrap();
        Identity {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            cert: cert.der().clone(),
            key_der: key.serialize_der(),
        }
    }

    pub fn roots(&self) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        roots.add(self.ca_cert.clone()).unwrap();
        roots
    }

    /// Server config presenting `server`; when `require_client_cert` is set, only clients with a
    /// certificate issued by this CA may connect.
    pub fn server_config(&self, server: &Identity, require_client_cert: bool) -> Arc<ServerConfig> {
        install_crypto_provider();
        let builder = ServerConfig::builder();
        let builder = if require_client_cert {
            let verifier = WebPkiClientVerifier::builder(Arc::new(self.roots()))
                .build()
                .unwrap();
            builder.with_client_cert_verifier(verifier)
        } else {
            builder.with_no_client_auth()
        };
        Arc::new(
            builder
                .with_single_cert(server.cert_chain(), server.private_key())
                .unwrap(),
        )
    }
}
