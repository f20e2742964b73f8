use std::{collections::HashMap, io::ErrorKind, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{ConnectInfo, State},
    http::{
        HeaderMap, HeaderValue, Method, StatusCode,
        header::{AUTHORIZATION, LOCATION, RETRY_AFTER},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::{
    net::TcpListener,
    process::Command,
    sync::Mutex,
    time::{Duration, timeout},
};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

#[derive(Clone)]
struct AppState {
    api_token: Option<String>,
    resolver: Arc<dyn AudioResolver>,
    limiter: Arc<dyn RequestLimiter>,
    trust_proxy_headers: bool,
}

const DEFAULT_RATE_LIMIT_PER_MINUTE: u32 = 30;
const YT_DLP_TIMEOUT_SECONDS: u64 = 120;

const ALLOWED_SOURCE_DOMAINS: [&str; 4] = [
    "youtube.com",
    "youtu.be",
    "m.youtube.com",
    "music.youtube.com",
];

#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum FormatPreference {
    #[default]
    M4a,
    Best,
}

#[derive(Debug, Deserialize)]
struct ExtractRequest {
    url: String,
    #[serde(default)]
    format: FormatPreference,
    #[serde(default)]
    redirect: bool,
}

#[derive(Debug, Serialize)]
struct ExtractResponse {
    ok: bool,
    audio_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ext: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    abr: Option<f32>,
}

impl From<ResolvedAudio> for ExtractResponse {
    fn from(resolved: ResolvedAudio) -> Self {
        Self {
            ok: true,
            audio_url: resolved.audio_url,
            title: resolved.title,
            channel: resolved.channel,
            duration: resolved.duration,
            ext: resolved.ext,
            abr: resolved.abr,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u64>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    code: Option<&'static str>,
    retry_after_seconds: Option<u64>,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            code: None,
            retry_after_seconds: None,
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            code: None,
            retry_after_seconds: None,
        }
    }

    fn server_misconfigured() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "EXTRACTOR_TOKEN is not configured on the server.".to_string(),
            code: Some("SERVER_MISCONFIGURED"),
            retry_after_seconds: None,
        }
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
            code: None,
            retry_after_seconds: None,
        }
    }

    fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: message.into(),
            code: None,
            retry_after_seconds: None,
        }
    }

    fn rate_limit_exceeded(retry_after_seconds: u64) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: "Request rate limit exceeded. Try again in the next minute.".to_string(),
            code: Some("RATE_LIMIT_EXCEEDED"),
            retry_after_seconds: Some(retry_after_seconds),
        }
    }

    fn extraction_failed(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            code: Some("EXTRACTION_FAILED"),
            retry_after_seconds: None,
        }
    }

    fn extraction_timeout(seconds: u64) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: format!("Extraction timed out after {seconds} seconds."),
            code: Some("EXTRACTION_TIMEOUT"),
            retry_after_seconds: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            code: self.code,
            retry_after_seconds: self.retry_after_seconds,
        });

        let mut response = (self.status, body).into_response();
        if let Some(seconds) = self.retry_after_seconds
            && let Ok(value) = HeaderValue::from_str(&seconds.to_string())
        {
            response.headers_mut().insert(RETRY_AFTER, value);
        }

        response
    }
}

impl From<ResolveError> for ApiError {
    fn from(error: ResolveError) -> Self {
        match error {
            ResolveError::Tool(_) | ResolveError::NoAudioFound | ResolveError::EmptyOutput => {
                ApiError::extraction_failed(error.to_string())
            }
            ResolveError::Timeout(seconds) => ApiError::extraction_timeout(seconds),
            ResolveError::Spawn(_) | ResolveError::Parse(_) => {
                ApiError::internal(error.to_string())
            }
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "audio_resolver=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let api_token = std::env::var("EXTRACTOR_TOKEN")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string));
    if api_token.is_none() {
        warn!(
            "EXTRACTOR_TOKEN is not set. Every /extract request will be rejected with a configuration error."
        );
    }

    let rate_limit_ceiling = read_u32_env("RATE_LIMIT_PER_MINUTE")
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_RATE_LIMIT_PER_MINUTE);
    let trust_proxy_headers = read_bool_env("TRUST_PROXY_HEADERS").unwrap_or(false);

    if !trust_proxy_headers {
        warn!(
            "TRUST_PROXY_HEADERS=false: the socket peer address is used as the rate-limit identity."
        );
    }

    let state = AppState {
        api_token,
        resolver: build_resolver()?,
        limiter: Arc::new(MinuteWindowLimiter::new(rate_limit_ceiling)),
        trust_proxy_headers,
    };

    let cors = build_cors_layer()?;

    let app = Router::new()
        .route("/health", get(health))
        .route("/extract", post(extract))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = resolve_bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|error| ApiError::internal(format!("Could not bind {addr}: {error}")))?;

    info!("Audio resolver listening on http://{addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

async fn extract(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<ExtractRequest>,
) -> Result<Response, ApiError> {
    let auth_header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    authorize_bearer(auth_header, state.api_token.as_deref())?;

    let client_ip = client_ip_for_request(&state, &headers, addr);
    if let Admission::Denied {
        retry_after_seconds,
    } = state.limiter.admit(&client_ip).await
    {
        return Err(ApiError::rate_limit_exceeded(retry_after_seconds));
    }

    let source_url = parse_source_url(&payload.url)?;

    // Submitted URLs are deliberately kept out of the logs; the request id is
    // the correlation handle instead.
    let request_id = Uuid::new_v4();
    debug!(%request_id, format = ?payload.format, "invoking resolver");

    let resolved = state
        .resolver
        .resolve(&source_url, payload.format)
        .await
        .map_err(|error| {
            warn!(%request_id, "extraction failed: {error}");
            ApiError::from(error)
        })?;

    info!(%request_id, redirect = payload.redirect, "resolved audio stream");

    if payload.redirect {
        let location = HeaderValue::from_str(&resolved.audio_url).map_err(|_| {
            ApiError::internal("The resolved URL is not a valid Location header value.")
        })?;
        let mut headers = HeaderMap::new();
        headers.insert(LOCATION, location);
        return Ok((StatusCode::FOUND, headers).into_response());
    }

    Ok(Json(ExtractResponse::from(resolved)).into_response())
}

fn authorize_bearer(header: Option<&str>, configured: Option<&str>) -> Result<(), ApiError> {
    let Some(secret) = configured.and_then(non_empty) else {
        return Err(ApiError::server_misconfigured());
    };

    let Some(value) = header else {
        return Err(ApiError::unauthorized("Missing bearer token."));
    };

    let Some(presented) = value.strip_prefix("Bearer ") else {
        return Err(ApiError::unauthorized(
            "Authorization header must use the Bearer scheme.",
        ));
    };

    if !tokens_match(presented.trim(), secret) {
        return Err(ApiError::forbidden("Invalid token."));
    }

    Ok(())
}

// Compared as digests rather than raw bytes so the check does not
// short-circuit on the first differing byte.
fn tokens_match(presented: &str, secret: &str) -> bool {
    Sha256::digest(presented.as_bytes()) == Sha256::digest(secret.as_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Admission {
    Admitted,
    Denied { retry_after_seconds: u64 },
}

#[async_trait]
trait RequestLimiter: Send + Sync {
    async fn admit(&self, identity: &str) -> Admission;
}

struct MinuteWindowLimiter {
    ceiling: u32,
    buckets: Mutex<HashMap<(String, i64), u32>>,
}

impl MinuteWindowLimiter {
    fn new(ceiling: u32) -> Self {
        Self {
            ceiling,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    async fn admit_at(&self, identity: &str, now_secs: i64) -> Admission {
        let minute = now_secs.div_euclid(60);
        let mut buckets = self.buckets.lock().await;

        // Only the current and the immediately preceding minute are kept, so
        // the map stays bounded by two buckets per active client.
        buckets.retain(|(_, bucket), _| *bucket >= minute - 1);

        let count = buckets.entry((identity.to_string(), minute)).or_insert(0);
        if *count >= self.ceiling {
            let retry_after_seconds = ((minute + 1) * 60 - now_secs).max(1) as u64;
            Admission::Denied {
                retry_after_seconds,
            }
        } else {
            *count += 1;
            Admission::Admitted
        }
    }
}

#[async_trait]
impl RequestLimiter for MinuteWindowLimiter {
    async fn admit(&self, identity: &str) -> Admission {
        self.admit_at(identity, Utc::now().timestamp()).await
    }
}

fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let check_header = |key: &str| {
        headers
            .get(key)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
    };

    if let Some(forwarded) = check_header("x-forwarded-for") {
        let first_ip = forwarded
            .split(',')
            .next()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string);

        if first_ip.is_some() {
            return first_ip;
        }
    }

    check_header("cf-connecting-ip").or_else(|| check_header("x-real-ip"))
}

fn client_ip_for_request(state: &AppState, headers: &HeaderMap, addr: SocketAddr) -> String {
    if state.trust_proxy_headers {
        extract_client_ip(headers).unwrap_or_else(|| addr.ip().to_string())
    } else {
        addr.ip().to_string()
    }
}

fn parse_source_url(input: &str) -> Result<Url, ApiError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ApiError::bad_request("Provide a source URL."));
    }

    let parsed = Url::parse(trimmed)
        .map_err(|_| ApiError::bad_request("The source URL is not a valid absolute URL."))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ApiError::bad_request(
            "Only http and https source URLs are supported.",
        ));
    }

    let host = match parsed.host_str() {
        Some(host) => host.to_ascii_lowercase(),
        None => return Err(ApiError::bad_request("The source URL has no host.")),
    };

    if !is_allowed_source_host(&host) {
        return Err(ApiError::bad_request(
            "The source URL host is not on the allow-list.",
        ));
    }

    Ok(parsed)
}

fn is_allowed_source_host(host: &str) -> bool {
    ALLOWED_SOURCE_DOMAINS
        .iter()
        .any(|domain| host == *domain || host.ends_with(&format!(".{domain}")))
}

#[derive(Debug, Clone)]
struct ResolvedAudio {
    audio_url: String,
    title: Option<String>,
    channel: Option<String>,
    duration: Option<u64>,
    ext: Option<String>,
    abr: Option<f32>,
}

#[derive(Debug, Error)]
enum ResolveError {
    #[error("yt-dlp error: {0}")]
    Tool(String),
    #[error("no audio format found")]
    NoAudioFound,
    #[error("yt-dlp did not return a stream URL")]
    EmptyOutput,
    #[error("extraction timed out after {0} seconds")]
    Timeout(u64),
    #[error("could not run yt-dlp: {0}")]
    Spawn(String),
    #[error("could not parse yt-dlp output: {0}")]
    Parse(#[from] serde_json::Error),
}

#[async_trait]
trait AudioResolver: Send + Sync {
    async fn resolve(
        &self,
        url: &Url,
        preference: FormatPreference,
    ) -> Result<ResolvedAudio, ResolveError>;
}

fn build_resolver() -> Result<Arc<dyn AudioResolver>, ApiError> {
    let mode = std::env::var("RESOLVER_MODE").unwrap_or_default();
    let resolver: Arc<dyn AudioResolver> = match mode.trim() {
        "" | "dump" => Arc::new(StructuredDumpResolver),
        "direct" => Arc::new(DirectQueryResolver),
        other => {
            return Err(ApiError::internal(format!(
                "Unknown RESOLVER_MODE {other:?}. Use \"dump\" or \"direct\"."
            )));
        }
    };
    Ok(resolver)
}

fn format_selector(preference: FormatPreference) -> &'static str {
    match preference {
        FormatPreference::M4a => "bestaudio[ext=m4a]/bestaudio/best",
        FormatPreference::Best => "bestaudio/best",
    }
}

/// Resolves by asking yt-dlp for the full metadata document and picking a
/// stream variant out of it.
struct StructuredDumpResolver;

#[async_trait]
impl AudioResolver for StructuredDumpResolver {
    async fn resolve(
        &self,
        url: &Url,
        preference: FormatPreference,
    ) -> Result<ResolvedAudio, ResolveError> {
        let output = run_yt_dlp(vec![
            "-J".to_string(),
            "--no-warnings".to_string(),
            "-f".to_string(),
            format_selector(preference).to_string(),
            url.to_string(),
        ])
        .await?;

        let document: MetadataDocument = serde_json::from_slice(&output.stdout)?;
        resolve_from_document(document)
    }
}

/// Resolves by asking yt-dlp for its direct-URL output (`-g`). Only the
/// stream URL is known in this mode.
struct DirectQueryResolver;

#[async_trait]
impl AudioResolver for DirectQueryResolver {
    async fn resolve(
        &self,
        url: &Url,
        preference: FormatPreference,
    ) -> Result<ResolvedAudio, ResolveError> {
        let output = run_yt_dlp(vec![
            "-g".to_string(),
            "--no-warnings".to_string(),
            "-f".to_string(),
            format_selector(preference).to_string(),
            url.to_string(),
        ])
        .await?;

        let audio_url = last_nonempty_line(&output.stdout).ok_or(ResolveError::EmptyOutput)?;

        Ok(ResolvedAudio {
            audio_url,
            title: None,
            channel: None,
            duration: None,
            ext: None,
            abr: None,
        })
    }
}

#[derive(Debug, Deserialize)]
struct MetadataDocument {
    entries: Option<Vec<MediaEntry>>,
    #[serde(flatten)]
    single: MediaEntry,
}

#[derive(Debug, Deserialize)]
struct MediaEntry {
    title: Option<String>,
    channel: Option<String>,
    uploader: Option<String>,
    duration: Option<f64>,
    #[serde(default)]
    formats: Vec<StreamVariant>,
}

#[derive(Debug, Deserialize)]
struct StreamVariant {
    url: Option<String>,
    acodec: Option<String>,
    ext: Option<String>,
    abr: Option<f32>,
}

fn resolve_from_document(document: MetadataDocument) -> Result<ResolvedAudio, ResolveError> {
    let entry = primary_entry(document);
    let variant = select_audio_variant(&entry.formats).ok_or(ResolveError::NoAudioFound)?;
    let Some(audio_url) = variant.url.clone() else {
        return Err(ResolveError::NoAudioFound);
    };

    Ok(ResolvedAudio {
        audio_url,
        ext: variant.ext.clone(),
        abr: variant.abr,
        title: entry.title.clone(),
        channel: entry.channel.clone().or_else(|| entry.uploader.clone()),
        duration: entry.duration.map(|seconds| seconds.max(0.0).round() as u64),
    })
}

// Playlist-like documents carry an `entries` list; the first entry stands in
// for the whole collection.
fn primary_entry(document: MetadataDocument) -> MediaEntry {
    if let Some(mut entries) = document.entries
        && !entries.is_empty()
    {
        return entries.remove(0);
    }
    document.single
}

// yt-dlp lists variants in ascending quality, so the last audio-capable one
// is the best audio.
fn select_audio_variant(variants: &[StreamVariant]) -> Option<&StreamVariant> {
    variants
        .iter()
        .rev()
        .find(|variant| has_audio_codec(variant) && has_stream_url(variant))
}

fn has_audio_codec(variant: &StreamVariant) -> bool {
    matches!(variant.acodec.as_deref(), Some(codec) if codec != "none")
}

fn has_stream_url(variant: &StreamVariant) -> bool {
    variant
        .url
        .as_deref()
        .is_some_and(|value| !value.trim().is_empty())
}

async fn run_yt_dlp(args: Vec<String>) -> Result<std::process::Output, ResolveError> {
    let command_future = Command::new("yt-dlp").args(args).output();
    let output = timeout(Duration::from_secs(YT_DLP_TIMEOUT_SECONDS), command_future)
        .await
        .map_err(|_| ResolveError::Timeout(YT_DLP_TIMEOUT_SECONDS))?
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                ResolveError::Spawn("yt-dlp is not installed on this system".to_string())
            } else {
                ResolveError::Spawn(error.to_string())
            }
        })?;

    if !output.status.success() {
        return Err(ResolveError::Tool(last_diagnostic_line(&output.stderr)));
    }

    Ok(output)
}

fn last_diagnostic_line(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp exited with an error")
        .to_string()
}

// The tool may print diagnostic lines before the final URL; only the last
// non-empty line is the answer.
fn last_nonempty_line(stdout: &[u8]) -> Option<String> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .map(ToString::to_string)
}

fn build_cors_layer() -> Result<CorsLayer, ApiError> {
    let configured = std::env::var("ALLOWED_ORIGINS")
        .ok()
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(ToString::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    if configured.is_empty() {
        warn!("ALLOWED_ORIGINS is not set. Any origin may call this API.");
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(Any));
    }

    let origins = configured
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin).map_err(|_| {
                ApiError::internal(format!("Invalid origin in ALLOWED_ORIGINS: {origin}"))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any))
}

fn read_bool_env(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn read_u32_env(name: &str) -> Option<u32> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u32>().ok())
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = std::env::var("APP_ADDR")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    "0.0.0.0:8080".to_string()
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() { None } else { Some(trimmed) }
}
