use std::{
    convert::Infallible,
    error::Error as StdError,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full, combinators::BoxBody};
use hyper::{
    Request, Response, StatusCode,
    body::Incoming,
    header::{self, HeaderName, HeaderValue},
    http::request::Parts,
    service::service_fn,
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use tokio::{net::TcpListener, sync::oneshot};
use tracing::Instrument as _;

use crate::{
    config::{Config, ConfigurationError},
    fingerprint::{Fingerprint, fingerprint},
    forward::{AgentOptions, ForwardError, Forwarder, Upstream, strip_hop_by_hop_headers},
    hooks::{HookError, HookFn, Hooks},
    interaction::{Interaction, RequestRecord, ResponseRecord},
    store::{DirectoryStore, FixtureStore, PersistOutcome, StoreError},
};

type ProxyBody = BoxBody<Bytes, Box<dyn StdError + Send + Sync>>;

/// Everything needed to build one proxy instance.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub fixture_dir: PathBuf,
    /// Absolute upstream base URL; its path is prepended to every inbound path.
    pub url: String,
    pub hooks: Hooks,
    pub agent: AgentOptions,
}

impl ProxyOptions {
    pub fn new(fixture_dir: impl Into<PathBuf>, url: impl Into<String>) -> Self {
        Self {
            fixture_dir: fixture_dir.into(),
            url: url.into(),
            hooks: Hooks::new(),
            agent: AgentOptions::default(),
        }
    }

    pub fn normalize_fn(mut self, hook: HookFn) -> Self {
        self.hooks = self.hooks.with_normalize(hook);
        self
    }

    pub fn scrub_fn(mut self, hook: HookFn) -> Self {
        self.hooks = self.hooks.with_scrub(hook);
        self
    }

    pub fn agent_options(mut self, agent: AgentOptions) -> Self {
        self.agent = agent;
        self
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigurationError> {
        Ok(Self {
            fixture_dir: config.fixture_dir(),
            url: config.upstream.url.clone(),
            hooks: Hooks::from_config(config.normalize.as_ref(), config.scrub.as_ref())?,
            agent: AgentOptions::from_config(config)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Served from a fixture; upstream was not contacted.
    Replayed,
    /// Forwarded upstream and persisted as a new fixture.
    Recorded,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Replayed => "replayed",
            Self::Recorded => "recorded",
        }
    }
}

/// Result of one pass through the pipeline.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub outcome: Outcome,
    pub fingerprint: Fingerprint,
    /// The stored response on replay, the unscrubbed live response on record.
    pub response: ResponseRecord,
    pub upstream_latency: Option<Duration>,
}

#[derive(Debug)]
pub enum PipelineError {
    Normalize(HookError),
    Scrub(HookError),
    Lookup {
        fingerprint: Fingerprint,
        source: StoreError,
    },
    Forward(ForwardError),
    Persist {
        fingerprint: Fingerprint,
        source: StoreError,
    },
}

impl PipelineError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Forward(_) => StatusCode::BAD_GATEWAY,
            Self::Normalize(_) | Self::Scrub(_) | Self::Lookup { .. } | Self::Persist { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Normalize(_) => "normalize",
            Self::Scrub(_) => "scrub",
            Self::Lookup { .. } => "lookup",
            Self::Forward(_) => "forward",
            Self::Persist { .. } => "persist",
        }
    }

    fn detail_kind(&self) -> &'static str {
        match self {
            Self::Normalize(_) | Self::Scrub(_) => "hook",
            Self::Lookup { source, .. } | Self::Persist { source, .. } => source.kind(),
            Self::Forward(err) => err.kind(),
        }
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normalize(err) | Self::Scrub(err) => std::fmt::Display::fmt(err, f),
            Self::Lookup {
                fingerprint,
                source,
            } => write!(f, "lookup fixture {}: {source}", fingerprint.short()),
            Self::Forward(err) => std::fmt::Display::fmt(err, f),
            Self::Persist {
                fingerprint,
                source,
            } => write!(f, "persist fixture {}: {source}", fingerprint.short()),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Normalize(err) | Self::Scrub(err) => Some(err),
            Self::Lookup { source, .. } | Self::Persist { source, .. } => Some(source),
            Self::Forward(err) => Some(err),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub replayed: u64,
    pub recorded: u64,
    pub failed: u64,
    pub upstream_requests: u64,
}

#[derive(Debug, Default)]
struct EngineCounters {
    replayed: AtomicU64,
    recorded: AtomicU64,
    failed: AtomicU64,
    upstream_requests: AtomicU64,
}

/// Record/replay pipeline for one upstream, one fixture store and one pair of hooks.
pub struct Engine {
    store: Arc<dyn FixtureStore>,
    upstream: Upstream,
    hooks: Hooks,
    forwarder: Forwarder,
    counters: EngineCounters,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("upstream", &self.upstream)
            .field("hooks", &self.hooks)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Validates the upstream URL, opens the fixture directory and builds the upstream client.
    pub fn new(options: ProxyOptions) -> Result<Self, ConfigurationError> {
        let upstream = Upstream::parse(&options.url)?;
        let store = DirectoryStore::open(&options.fixture_dir)?;
        let forwarder = Forwarder::new(&options.agent)?;

        tracing::info!(
            fixture_dir = %store.dir().display(),
            upstream = %upstream,
            normalize = options.hooks.has_normalize(),
            scrub = options.hooks.has_scrub(),
            "proxy engine ready"
        );
        Ok(Self::with_store(
            Arc::new(store),
            upstream,
            options.hooks,
            forwarder,
        ))
    }

    pub fn with_store(
        store: Arc<dyn FixtureStore>,
        upstream: Upstream,
        hooks: Hooks,
        forwarder: Forwarder,
    ) -> Self {
        Self {
            store,
            upstream,
            hooks,
            forwarder,
            counters: EngineCounters::default(),
        }
    }

    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            replayed: self.counters.replayed.load(Ordering::Relaxed),
            recorded: self.counters.recorded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            upstream_requests: self.counters.upstream_requests.load(Ordering::Relaxed),
        }
    }

    /// Fingerprint an inbound request would be stored under, without touching store or upstream.
    pub fn fingerprint_request(
        &self,
        parts: &Parts,
        body: &[u8],
    ) -> Result<Fingerprint, PipelineError> {
        self.key(parts, body).map(|(_, fingerprint)| fingerprint)
    }

    /// Runs one request through normalize, fingerprint, lookup and, on a miss,
    /// forward, scrub and persist.
    ///
    /// Both hooks run on every request, hits included: the fingerprint is taken over a scrubbed
    /// copy of the normalized request, so the scrub hook has to run before lookup. A failing
    /// scrub hook therefore fails replays as well as recordings. On a hit the stored response is
    /// returned as is; no hook sees it.
    pub async fn handle(&self, parts: &Parts, body: Bytes) -> Result<Exchange, PipelineError> {
        let result = self.run(parts, body).await;
        let counter = match &result {
            Ok(exchange) if exchange.outcome == Outcome::Replayed => &self.counters.replayed,
            Ok(_) => &self.counters.recorded,
            Err(_) => &self.counters.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        result
    }

    async fn run(&self, parts: &Parts, body: Bytes) -> Result<Exchange, PipelineError> {
        let (normalized, fingerprint) = self.key(parts, &body)?;

        let stored = self
            .store
            .lookup(&fingerprint)
            .await
            .map_err(|source| PipelineError::Lookup {
                fingerprint: fingerprint.clone(),
                source,
            })?;
        if let Some(stored) = stored {
            let Some(response) = stored.response else {
                return Err(PipelineError::Lookup {
                    fingerprint,
                    source: StoreError::Internal("stored interaction has no response".to_owned()),
                });
            };
            tracing::debug!(fingerprint = %fingerprint.short(), "fixture hit");
            return Ok(Exchange {
                outcome: Outcome::Replayed,
                fingerprint,
                response,
                upstream_latency: None,
            });
        }

        tracing::debug!(fingerprint = %fingerprint.short(), "fixture miss; forwarding upstream");
        let uri = self
            .upstream
            .resolve(&parts.uri)
            .map_err(PipelineError::Forward)?;
        self.counters
            .upstream_requests
            .fetch_add(1, Ordering::Relaxed);
        let started_at = Instant::now();
        let response = self
            .forwarder
            .forward(&parts.method, uri, &parts.headers, body)
            .await
            .map_err(PipelineError::Forward)?;
        let upstream_latency = started_at.elapsed();

        let mut recorded = normalized;
        recorded.response = Some(response.clone());
        self.hooks
            .scrub(&mut recorded)
            .map_err(PipelineError::Scrub)?;

        let persisted = self
            .store
            .persist(&fingerprint, &recorded)
            .await
            .map_err(|source| PipelineError::Persist {
                fingerprint: fingerprint.clone(),
                source,
            })?;
        if persisted == PersistOutcome::AlreadyPresent {
            tracing::debug!(
                fingerprint = %fingerprint.short(),
                "fixture was written concurrently; kept the existing file"
            );
        }

        Ok(Exchange {
            outcome: Outcome::Recorded,
            fingerprint,
            response,
            upstream_latency: Some(upstream_latency),
        })
    }

    /// Builds the normalized interaction and its fingerprint.
    ///
    /// The digest is taken over a scrubbed copy of the normalized request, so a fixture name never
    /// encodes a value the scrub hook keeps off disk.
    fn key(&self, parts: &Parts, body: &[u8]) -> Result<(Interaction, Fingerprint), PipelineError> {
        let mut normalized = Interaction::new(RequestRecord::from_parts(parts, body));
        self.hooks
            .normalize(&mut normalized)
            .map_err(PipelineError::Normalize)?;

        let mut keyed = normalized.clone();
        self.hooks
            .scrub(&mut keyed)
            .map_err(PipelineError::Scrub)?;

        let fingerprint = fingerprint(&keyed.request);
        Ok((normalized, fingerprint))
    }
}

#[derive(Debug)]
pub struct ProxyHandle {
    pub listen_addr: SocketAddr,
    engine: Arc<Engine>,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Stops accepting connections and waits for the accept loop to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

struct ServeState {
    engine: Arc<Engine>,
    max_body_bytes: usize,
}

/// Builds the engine described by `config` and starts listening on `[proxy].listen`.
pub async fn serve_config(config: &Config) -> anyhow::Result<ProxyHandle> {
    let options = ProxyOptions::from_config(config)?;
    let engine = Engine::new(options)?;
    serve(
        config.proxy.listen,
        Arc::new(engine),
        config.proxy.max_body_bytes(),
    )
    .await
}

pub async fn serve(
    listen: SocketAddr,
    engine: Arc<Engine>,
    max_body_bytes: usize,
) -> anyhow::Result<ProxyHandle> {
    let listener = TcpListener::bind(listen)
        .await
        .map_err(|err| anyhow::anyhow!("bind {listen}: {err}"))?;
    let listen_addr = listener
        .local_addr()
        .map_err(|err| anyhow::anyhow!("get local_addr: {err}"))?;

    let state = Arc::new(ServeState {
        engine: Arc::clone(&engine),
        max_body_bytes,
    });
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        let service = service_fn(move |req| proxy_handler(req, Arc::clone(&state)));
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        if let Err(err) = builder.serve_connection(io, service).await {
                            tracing::debug!("connection error: {err}");
                        }
                    });
                }
            }
        }
    });

    tracing::info!(listen_addr = %listen_addr, upstream = %engine.upstream(), "proxy listening");
    Ok(ProxyHandle {
        listen_addr,
        engine,
        shutdown_tx,
        join,
    })
}

async fn proxy_handler(
    req: Request<Incoming>,
    state: Arc<ServeState>,
) -> Result<Response<ProxyBody>, Infallible> {
    let (parts, body) = req.into_parts();
    let request_method = parts.method.to_string();
    let request_url = parts
        .uri
        .path_and_query()
        .map(|path_and_query| path_and_query.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());
    let request_span = tracing::info_span!(
        "proxy.request",
        method = %request_method,
        url = %request_url,
    );

    let response = async {
        let body = match read_body_with_limit(body, state.max_body_bytes).await {
            Ok(BodyReadOutcome::Buffered(body)) => body,
            Ok(BodyReadOutcome::TooLarge { limit_bytes }) => {
                tracing::debug!(limit_bytes, "request body exceeds limit");
                let response = proxy_simple_response(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    &format!("request body exceeds {limit_bytes} bytes"),
                );
                emit_proxy_request_log(
                    &request_method,
                    &request_url,
                    RequestLogOutcome::Rejected,
                    None,
                    None,
                    response.status(),
                );
                return response;
            }
            Err(err) => {
                tracing::debug!("failed to read request body: {err}");
                let response =
                    proxy_simple_response(StatusCode::BAD_REQUEST, "failed to read request body");
                emit_proxy_request_log(
                    &request_method,
                    &request_url,
                    RequestLogOutcome::Rejected,
                    None,
                    None,
                    response.status(),
                );
                return response;
            }
        };

        match state.engine.handle(&parts, body).await {
            Ok(exchange) => {
                let response = response_from_record(&exchange.response);
                emit_proxy_request_log(
                    &request_method,
                    &request_url,
                    RequestLogOutcome::Completed(exchange.outcome),
                    Some(&exchange.fingerprint),
                    exchange.upstream_latency,
                    response.status(),
                );
                response
            }
            Err(err) => {
                tracing::warn!(
                    stage = err.kind(),
                    error_kind = err.detail_kind(),
                    "request failed: {err}"
                );
                let response = proxy_simple_response(err.status(), &err.to_string());
                emit_proxy_request_log(
                    &request_method,
                    &request_url,
                    RequestLogOutcome::Failed(err.kind()),
                    None,
                    None,
                    response.status(),
                );
                response
            }
        }
    }
    .instrument(request_span)
    .await;

    Ok(response)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestLogOutcome {
    Completed(Outcome),
    Failed(&'static str),
    Rejected,
}

impl RequestLogOutcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Completed(outcome) => outcome.as_str(),
            Self::Failed(_) => "failed",
            Self::Rejected => "rejected",
        }
    }
}

fn emit_proxy_request_log(
    method: &str,
    url: &str,
    outcome: RequestLogOutcome,
    fingerprint: Option<&Fingerprint>,
    upstream_latency: Option<Duration>,
    status: StatusCode,
) {
    let upstream_latency_ms = upstream_latency
        .map(|latency| u64::try_from(latency.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0);
    let stage = match outcome {
        RequestLogOutcome::Failed(stage) => stage,
        _ => "none",
    };

    tracing::info!(
        method = method,
        url = url,
        outcome = outcome.as_str(),
        failed_stage = stage,
        fingerprint = fingerprint.map(Fingerprint::as_str).unwrap_or("none"),
        upstream_latency_ms,
        status = status.as_u16(),
        "proxy request completed",
    );
}

#[derive(Debug)]
enum BodyReadOutcome {
    Buffered(Bytes),
    TooLarge { limit_bytes: usize },
}

async fn read_body_with_limit(
    mut body: Incoming,
    max_body_bytes: usize,
) -> Result<BodyReadOutcome, hyper::Error> {
    let mut buffered = Vec::new();
    while let Some(frame_result) = body.frame().await {
        let frame = frame_result?;
        let Ok(data) = frame.into_data() else {
            continue;
        };
        if buffered.len().saturating_add(data.len()) > max_body_bytes {
            return Ok(BodyReadOutcome::TooLarge {
                limit_bytes: max_body_bytes,
            });
        }
        buffered.extend_from_slice(&data);
    }

    Ok(BodyReadOutcome::Buffered(Bytes::from(buffered)))
}

fn boxed_full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| -> Box<dyn StdError + Send + Sync> { match never {} })
        .boxed()
}

/// Turns a recorded response back into an HTTP response.
///
/// `content-length` is recomputed from the stored body, except for an empty body that carries
/// its own length (a recorded `HEAD` response).
fn response_from_record(record: &ResponseRecord) -> Response<ProxyBody> {
    let mut response = Response::new(boxed_full(Bytes::copy_from_slice(
        record.body.as_bytes(),
    )));
    *response.status_mut() =
        StatusCode::from_u16(record.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    for (name, value) in record.headers.iter() {
        let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
            tracing::debug!("invalid header name in fixture");
            continue;
        };
        let Ok(header_value) = HeaderValue::from_bytes(value) else {
            tracing::debug!("invalid header value in fixture for {}", header_name.as_str());
            continue;
        };
        response.headers_mut().append(header_name, header_value);
    }
    strip_hop_by_hop_headers(response.headers_mut());

    let keep_stored_length =
        record.body.is_empty() && response.headers().contains_key(header::CONTENT_LENGTH);
    if !keep_stored_length
        && let Ok(content_length) = HeaderValue::from_str(&record.body.len().to_string())
    {
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, content_length);
    }

    response
}

fn proxy_simple_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(boxed_full(Bytes::from(message.to_owned())));
    *response.status_mut() = status;
    response
}
