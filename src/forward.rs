use std::{fs, sync::Arc, time::Duration};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    HeaderMap, Method, Request, Uri,
    header::{self, HeaderName, HeaderValue},
    http::uri::{Authority, Scheme},
};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{Client, Error as LegacyClientError, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
};

use crate::{
    config::{Config, ConfigurationError},
    interaction::{Headers, ResponseRecord},
};

type ForwardClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Base URL every inbound request is re-targeted onto.
#[derive(Debug, Clone)]
pub struct Upstream {
    scheme: Scheme,
    authority: Authority,
    base_path: String,
}

impl Upstream {
    pub fn parse(url: &str) -> Result<Self, ConfigurationError> {
        if url.contains('#') {
            return Err(ConfigurationError::new(format!(
                "upstream url `{url}` must not carry a fragment"
            )));
        }
        let uri: Uri = url
            .parse()
            .map_err(|err| ConfigurationError::new(format!("invalid upstream url `{url}`: {err}")))?;
        let scheme = match uri.scheme_str() {
            Some("http") => Scheme::HTTP,
            Some("https") => Scheme::HTTPS,
            _ => {
                return Err(ConfigurationError::new(format!(
                    "upstream url `{url}` must use http or https"
                )));
            }
        };
        let Some(authority) = uri.authority().cloned() else {
            return Err(ConfigurationError::new(format!(
                "upstream url `{url}` has no host"
            )));
        };
        if uri.query().is_some() {
            return Err(ConfigurationError::new(format!(
                "upstream url `{url}` must not carry a query string"
            )));
        }

        Ok(Self {
            scheme,
            authority,
            base_path: uri.path().trim_end_matches('/').to_owned(),
        })
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    pub fn is_https(&self) -> bool {
        self.scheme == Scheme::HTTPS
    }

    /// Appends the inbound path to the base path; the inbound query passes through unchanged.
    pub fn resolve(&self, inbound: &Uri) -> Result<Uri, ForwardError> {
        let path = inbound.path();
        let mut target = String::with_capacity(self.base_path.len() + path.len() + 1);
        target.push_str(&self.base_path);
        if !path.starts_with('/') {
            target.push('/');
        }
        target.push_str(path);
        if let Some(query) = inbound.query() {
            target.push('?');
            target.push_str(query);
        }

        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(target)
            .build()
            .map_err(ForwardError::BuildRequest)
    }
}

impl std::fmt::Display for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.authority, self.base_path)
    }
}

/// Transport options for one proxy instance's upstream client.
#[derive(Clone, Default)]
pub struct AgentOptions {
    /// PEM client certificate chain presented for mutual TLS.
    pub client_cert_pem: Option<Vec<u8>>,
    /// PEM private key matching `client_cert_pem`.
    pub client_key_pem: Option<Vec<u8>>,
    /// Extra PEM trust anchors on top of the platform roots.
    pub ca_cert_pem: Option<Vec<u8>>,
    pub insecure_skip_verify: bool,
    pub connect_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
}

impl std::fmt::Debug for AgentOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentOptions")
            .field("client_cert", &self.client_cert_pem.is_some())
            .field("client_key", &self.client_key_pem.is_some())
            .field("ca_cert", &self.ca_cert_pem.is_some())
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl AgentOptions {
    /// Reads `[upstream]` timeouts and the `[upstream.tls]` PEM files.
    pub fn from_config(config: &Config) -> Result<Self, ConfigurationError> {
        let upstream = &config.upstream;
        let mut options = Self {
            connect_timeout: upstream.connect_timeout_ms.map(Duration::from_millis),
            request_timeout: upstream.request_timeout_ms.map(Duration::from_millis),
            ..Self::default()
        };
        let Some(tls) = upstream.tls.as_ref() else {
            return Ok(options);
        };

        let read_pem = |path: &std::path::Path, what: &str| {
            let path = config.resolve_path(path);
            fs::read(&path).map_err(|err| {
                ConfigurationError::new(format!("read {what} {}: {err}", path.display()))
            })
        };
        options.client_cert_pem = tls
            .client_cert
            .as_deref()
            .map(|path| read_pem(path, "client certificate"))
            .transpose()?;
        options.client_key_pem = tls
            .client_key
            .as_deref()
            .map(|path| read_pem(path, "client key"))
            .transpose()?;
        options.ca_cert_pem = tls
            .ca_cert
            .as_deref()
            .map(|path| read_pem(path, "CA certificate"))
            .transpose()?;
        options.insecure_skip_verify = tls.insecure_skip_verify;
        Ok(options)
    }
}

#[derive(Debug)]
pub enum ForwardError {
    BuildRequest(hyper::http::Error),
    Request(LegacyClientError),
    Timeout(Duration),
    ReadBody(hyper::Error),
}

impl ForwardError {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::BuildRequest(_) => "build_request",
            Self::Request(_) => "request",
            Self::Timeout(_) => "timeout",
            Self::ReadBody(_) => "read_body",
        }
    }
}

impl std::fmt::Display for ForwardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BuildRequest(err) => write!(f, "build upstream request: {err}"),
            Self::Request(err) => {
                write!(f, "upstream request failed: {err}")?;
                let mut source = std::error::Error::source(err);
                while let Some(cause) = source {
                    write!(f, ": {cause}")?;
                    source = cause.source();
                }
                Ok(())
            }
            Self::Timeout(after) => {
                write!(f, "upstream did not answer within {}ms", after.as_millis())
            }
            Self::ReadBody(err) => write!(f, "read upstream response body: {err}"),
        }
    }
}

impl std::error::Error for ForwardError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::BuildRequest(err) => Some(err),
            Self::Request(err) => Some(err),
            Self::ReadBody(err) => Some(err),
            Self::Timeout(_) => None,
        }
    }
}

/// Upstream HTTP(S) client. Each instance owns its TLS settings.
#[derive(Clone)]
pub struct Forwarder {
    client: ForwardClient,
    request_timeout: Option<Duration>,
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl Forwarder {
    pub fn new(options: &AgentOptions) -> Result<Self, ConfigurationError> {
        ensure_rustls_crypto_provider()?;
        let tls = client_tls_config(options)?;

        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(options.connect_timeout);
        let connector = HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http);

        Ok(Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
            request_timeout: options.request_timeout,
        })
    }

    /// Sends one fully buffered request and buffers the whole response.
    pub async fn forward(
        &self,
        method: &Method,
        uri: Uri,
        inbound_headers: &HeaderMap,
        body: Bytes,
    ) -> Result<ResponseRecord, ForwardError> {
        let mut headers = inbound_headers.clone();
        strip_hop_by_hop_headers(&mut headers);
        headers.remove(header::CONTENT_LENGTH);
        set_host_header(&mut headers, &uri);

        let mut request = Request::builder()
            .method(method.clone())
            .uri(uri)
            .body(Full::new(body))
            .map_err(ForwardError::BuildRequest)?;
        *request.headers_mut() = headers;

        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(ForwardError::Request)?;
            let (parts, body) = response.into_parts();
            let body = body
                .collect()
                .await
                .map_err(ForwardError::ReadBody)?
                .to_bytes();
            Ok::<_, ForwardError>((parts, body))
        };
        let (mut parts, body) = match self.request_timeout {
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .map_err(|_| ForwardError::Timeout(limit))??,
            None => exchange.await?,
        };

        strip_hop_by_hop_headers(&mut parts.headers);
        Ok(ResponseRecord::new(
            parts.status.as_u16(),
            Headers::from_header_map(&parts.headers),
            body,
        ))
    }
}

pub(crate) fn ensure_rustls_crypto_provider() -> Result<(), ConfigurationError> {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return Ok(());
    }

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err(ConfigurationError::new("install rustls ring crypto provider"));
    }
    Ok(())
}

fn client_tls_config(options: &AgentOptions) -> Result<ClientConfig, ConfigurationError> {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        tracing::debug!("skipping native root certificate: {err}");
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    tracing::debug!(added, ignored, "loaded native root certificates");

    if let Some(ca_pem) = options.ca_cert_pem.as_deref() {
        for cert in parse_certs(ca_pem, "CA certificate")? {
            roots
                .add(cert)
                .map_err(|err| ConfigurationError::new(format!("add CA certificate: {err}")))?;
        }
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let mut config = match (
        options.client_cert_pem.as_deref(),
        options.client_key_pem.as_deref(),
    ) {
        (Some(cert_pem), Some(key_pem)) => builder
            .with_client_auth_cert(
                parse_certs(cert_pem, "client certificate")?,
                parse_private_key(key_pem)?,
            )
            .map_err(|err| {
                ConfigurationError::new(format!("invalid client certificate or key: {err}"))
            })?,
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(ConfigurationError::new(
                "client certificate and client key must be configured together",
            ));
        }
    };

    if options.insecure_skip_verify {
        tracing::warn!("upstream TLS certificate verification is disabled");
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerifier));
    }
    Ok(config)
}

fn parse_certs(pem: &[u8], what: &str) -> Result<Vec<CertificateDer<'static>>, ConfigurationError> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| ConfigurationError::new(format!("parse {what} PEM: {err}")))?;
    if certs.is_empty() {
        return Err(ConfigurationError::new(format!(
            "no certificates found in {what} PEM"
        )));
    }
    Ok(certs)
}

fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, ConfigurationError> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|err| ConfigurationError::new(format!("parse client key PEM: {err}")))?
        .ok_or_else(|| ConfigurationError::new("no private key found in client key PEM"))
}

#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

pub(crate) fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    let mut to_remove = Vec::new();
    for value in headers.get_all(header::CONNECTION).iter() {
        let Ok(value) = value.to_str() else { continue };
        for name in value.split(',') {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            to_remove.push(header_name);
        }
    }

    for header_name in to_remove {
        headers.remove(header_name);
    }

    const STANDARD: &[&str] = &[
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "proxy-connection",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
    ];
    for header_name in STANDARD {
        headers.remove(*header_name);
    }
}

fn set_host_header(headers: &mut HeaderMap, uri: &Uri) {
    let Some(authority) = uri.authority() else {
        return;
    };
    if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
        headers.insert(header::HOST, value);
    }
}
