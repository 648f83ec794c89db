//! HTTP handlers: device/service descriptions, SOAP control, eventing,
//! and the resource server with byte-range and DLNA time-seek streaming.

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::{
    body::Body,
    extract::{ConnectInfo, Path as UrlPath, Query, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::dlna::{self, ContentFeatures, NptRange};
use crate::dynamic;
use crate::error::AppError;
use crate::eventing;
use crate::object::resolve_under_root;
use crate::platform;
use crate::server;
use crate::soap::{self, RequestContext};
use crate::state::AppState;
use crate::transcode;

const XML_CONTENT_TYPE: &str = "text/xml; charset=\"utf-8\"";

pub async fn root_handler() -> &'static str {
    "dlnacast media server"
}

pub async fn description_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, XML_CONTENT_TYPE)],
        state.root_desc.as_str().to_owned(),
    )
}

pub async fn scpd_handler(UrlPath(key): UrlPath<String>) -> Result<Response, AppError> {
    let service = server::services()
        .iter()
        .find(|s| s.url_key == key)
        .ok_or(AppError::NotFound)?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, XML_CONTENT_TYPE)],
        service.scpd,
    )
        .into_response())
}

fn request_context(
    headers: &HeaderMap,
    addr: &SocketAddr,
    fallback_port: u16,
) -> RequestContext {
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_else(|| format!("127.0.0.1:{fallback_port}"));
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    RequestContext {
        host,
        user_agent,
        remote: Some(addr.ip()),
    }
}

/// SOAP control endpoint; every registered service shares it, routed by
/// the SOAPACTION header.
pub async fn control_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: String,
) -> Result<Response, AppError> {
    let soap_action = headers
        .get("SOAPACTION")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| AppError::BadRequest("missing SOAPACTION header".into()))?;
    let ctx = request_context(&headers, &addr, state.core.http_port);

    let resp = soap::handle_control(&state.services, soap_action, &body, &ctx)
        .await
        .map_err(|e| AppError::BadRequest(format!("{e:#}")))?;

    Ok((
        StatusCode::from_u16(resp.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        [(header::CONTENT_TYPE, XML_CONTENT_TYPE)],
        resp.body,
    )
        .into_response())
}

/// GENA eventing endpoint. Only the ContentDirectory is evented; a
/// configuration knob turns the whole endpoint into a 501 for renderers
/// that cope better without eventing.
pub async fn event_handler(
    State(state): State<AppState>,
    UrlPath(key): UrlPath<String>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    if state.core.config.stall_event_subscribe || key != "ContentDirectory" {
        return (StatusCode::NOT_IMPLEMENTED, "eventing not offered").into_response();
    }

    let sid_header = headers.get("SID").and_then(|h| h.to_str().ok());
    let callback = headers.get("CALLBACK").and_then(|h| h.to_str().ok());
    let timeout = eventing::parse_timeout(
        headers.get("TIMEOUT").and_then(|h| h.to_str().ok()),
    );
    let subs = &state.core.subscriptions;

    match method.as_str() {
        "SUBSCRIBE" => match (callback, sid_header) {
            (Some(callback), None) => {
                let urls = eventing::parse_callback_urls(callback);
                match subs.subscribe(urls, timeout) {
                    Ok((sid, granted)) => {
                        info!(%sid, "event subscription");
                        eventing::spawn_initial_notify(
                            subs,
                            sid.clone(),
                            vec![
                                (
                                    "SystemUpdateID",
                                    state.core.system_update_id().to_string(),
                                ),
                                ("ContainerUpdateIDs", String::new()),
                            ],
                        );
                        (
                            StatusCode::OK,
                            [
                                ("SID", sid),
                                ("TIMEOUT", format!("Second-{}", granted.as_secs())),
                            ],
                            "",
                        )
                            .into_response()
                    }
                    Err(e) => {
                        debug!("bad subscription: {e:#}");
                        (StatusCode::BAD_REQUEST, "bad CALLBACK").into_response()
                    }
                }
            }
            (None, Some(sid)) => match subs.renew(sid, timeout) {
                Ok(granted) => (
                    StatusCode::OK,
                    [
                        ("SID", sid.to_string()),
                        ("TIMEOUT", format!("Second-{}", granted.as_secs())),
                    ],
                    "",
                )
                    .into_response(),
                Err(_) => (StatusCode::PRECONDITION_FAILED, "no such subscription")
                    .into_response(),
            },
            _ => (StatusCode::BAD_REQUEST, "need CALLBACK or SID").into_response(),
        },
        "UNSUBSCRIBE" => match sid_header {
            Some(sid) => match subs.unsubscribe(sid) {
                Ok(()) => StatusCode::OK.into_response(),
                Err(_) => (StatusCode::PRECONDITION_FAILED, "no such subscription")
                    .into_response(),
            },
            None => (StatusCode::BAD_REQUEST, "missing SID").into_response(),
        },
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct ResQuery {
    #[serde(default)]
    path: String,
    transcode: Option<String>,
    index: Option<usize>,
}

/// `/res` — raw ranged bytes, a transcode session, or a dynamic stream.
pub async fn res_handler(
    State(state): State<AppState>,
    Query(query): Query<ResQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let fs_path = resolve_under_root(state.core.model.root_path(), &query.path);

    if dynamic::is_descriptor(&fs_path) {
        if !state.core.config.allow_dynamic_streams {
            return Err(AppError::NotFound);
        }
        return serve_dynamic(&fs_path, query.index.unwrap_or(0)).await;
    }

    match &query.transcode {
        None => serve_file(&fs_path, &headers).await,
        Some(key) => {
            if state.core.config.no_transcode {
                return Err(AppError::NotFound);
            }
            let spec = transcode::lookup(key).ok_or(AppError::NotFound)?;
            serve_transcode(&state, &fs_path, spec, &headers).await
        }
    }
}

/// Parses a single `bytes=` range against the file size.
fn parse_range_header(range_str: &str, file_size: u64) -> Result<(u64, u64), AppError> {
    let range_part = range_str.strip_prefix("bytes=").ok_or(AppError::InvalidRange)?;
    let first_range = range_part.split(',').next().ok_or(AppError::InvalidRange)?;

    let (start_str, end_str) = first_range.split_once('-').ok_or(AppError::InvalidRange)?;
    let start = if start_str.is_empty() {
        // Suffix form: the last N bytes.
        let suffix_len: u64 = end_str.parse().map_err(|_| AppError::InvalidRange)?;
        file_size.saturating_sub(suffix_len)
    } else {
        start_str.parse().map_err(|_| AppError::InvalidRange)?
    };
    let end = if end_str.is_empty() || start_str.is_empty() {
        file_size.saturating_sub(1)
    } else {
        let parsed: u64 = end_str.parse().map_err(|_| AppError::InvalidRange)?;
        parsed.min(file_size.saturating_sub(1))
    };

    if start > end || start >= file_size {
        return Err(AppError::InvalidRange);
    }
    Ok((start, end))
}

async fn serve_file(fs_path: &std::path::Path, headers: &HeaderMap) -> Result<Response, AppError> {
    let meta = tokio::fs::metadata(fs_path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            AppError::NotFound
        } else {
            AppError::Io(e)
        }
    })?;
    if !meta.is_file() {
        return Err(AppError::NotFound);
    }
    let file_size = meta.len();
    let mut file = File::open(fs_path).await?;

    let content_type = crate::mime::mime_type_by_path(fs_path)
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(
            dlna::CONTENT_FEATURES_DOMAIN,
            ContentFeatures {
                support_range: true,
                ..Default::default()
            }
            .to_string(),
        );

    let (start, end) = match headers.get(header::RANGE) {
        Some(range) => {
            let range_str = range.to_str().map_err(|_| AppError::InvalidRange)?;
            debug!(range = range_str, "ranged request");
            parse_range_header(range_str, file_size)?
        }
        None => (0, file_size.saturating_sub(1)),
    };
    let len = end - start + 1;

    let status = if len < file_size {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {start}-{end}/{file_size}"),
        );
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    builder = builder.header(header::CONTENT_LENGTH, len);

    file.seek(std::io::SeekFrom::Start(start)).await?;
    let stream = ReaderStream::with_capacity(file.take(len), 64 * 1024);
    Ok(builder.status(status).body(Body::from_stream(stream))?)
}

/// Streams a child's stdout to the client, reaping the process in the
/// background. A dropped connection just drops the stream; the exit
/// status is only ever logged.
fn stream_child(mut child: tokio::process::Child, what: String) -> Result<Body, AppError> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("child has no stdout")))?;
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) if status.success() => debug!(%what, "stream finished"),
            Ok(status) => debug!(%what, %status, "stream ended"),
            Err(e) => warn!(%what, "couldn't reap stream child: {e}"),
        }
    });
    Ok(Body::from_stream(ReaderStream::with_capacity(
        stdout,
        64 * 1024,
    )))
}

async fn serve_transcode(
    state: &AppState,
    fs_path: &std::path::Path,
    spec: &'static transcode::TranscodeSpec,
    headers: &HeaderMap,
) -> Result<Response, AppError> {
    if !fs_path.is_file() {
        return Err(AppError::NotFound);
    }

    // A DLNA time-seek range means a 206; its absence a plain 200.
    let seek_header = headers
        .get(dlna::TIME_SEEK_RANGE_DOMAIN)
        .map(|h| h.to_str().map(str::to_owned).map_err(|_| AppError::InvalidRange))
        .transpose()?;
    let range = match &seek_header {
        Some(value) => Some(
            dlna::parse_time_seek_range(value)
                .map_err(|e| AppError::BadRequest(format!("{e:#}")))?,
        ),
        None => None,
    };

    let mut builder = Response::builder()
        .header(dlna::TRANSFER_MODE_DOMAIN, "Streaming")
        .header(header::CONTENT_TYPE, spec.mime_type)
        .header(
            dlna::CONTENT_FEATURES_DOMAIN,
            ContentFeatures {
                support_time_seek: true,
                transcoded: true,
                ..Default::default()
            }
            .to_string(),
        );
    if let Some(value) = &seek_header {
        // The `*` total avoids renderer trouble with exact durations.
        builder = builder.header(dlna::TIME_SEEK_RANGE_DOMAIN, format!("{value}/*"));
    }
    if let Some(probe) = state.core.probe_file(fs_path).await {
        if let Some(duration) = probe.duration() {
            let secs = format!("{}", duration.as_secs_f64());
            builder = builder
                .header("content-duration", secs.clone())
                .header("x-content-duration", secs);
        }
    }

    let NptRange { start, end } = range.clone().unwrap_or_default();
    let length = end.map(|e| e.saturating_sub(start));
    let child = spec
        .spawn(
            fs_path,
            start,
            length,
            &state.core.config.transcode_log_pattern,
        )
        .map_err(AppError::Internal)?;
    let body = stream_child(child, format!("transcode {} {}", spec.key, fs_path.display()))?;

    let status = if range.is_some() {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    Ok(builder.status(status).body(body)?)
}

async fn serve_dynamic(fs_path: &std::path::Path, index: usize) -> Result<Response, AppError> {
    let descriptor = dynamic::load(fs_path).map_err(|_| AppError::NotFound)?;
    let resource = descriptor.resources.get(index).ok_or(AppError::NotFound)?;
    let child = transcode::spawn_dynamic(&resource.command).map_err(AppError::Internal)?;
    let body = stream_child(child, format!("dynamic {}[{index}]", fs_path.display()))?;
    Ok(Response::builder()
        .header(header::CONTENT_TYPE, resource.mime_type.clone())
        .header(dlna::TRANSFER_MODE_DOMAIN, "Streaming")
        .header(
            dlna::CONTENT_FEATURES_DOMAIN,
            ContentFeatures {
                profile_name: resource.dlna_profile.clone(),
                support_time_seek: true,
                transcoded: true,
                ..Default::default()
            }
            .to_string(),
        )
        .body(body)?)
}

#[derive(Debug, Deserialize)]
pub struct IconQuery {
    #[serde(default)]
    path: String,
    c: Option<String>,
}

/// `/icon` — shells out to the thumbnailer and returns its output.
pub async fn icon_handler(
    State(state): State<AppState>,
    Query(query): Query<IconQuery>,
) -> Result<Response, AppError> {
    let fs_path = resolve_under_root(state.core.model.root_path(), &query.path);
    if !fs_path.is_file() {
        return Err(AppError::NotFound);
    }
    let format = match query.c.as_deref() {
        Some("jpeg") => "jpeg",
        _ => "png",
    };
    let mut cmd = tokio::process::Command::new("ffmpegthumbnailer");
    cmd.arg("-i")
        .arg(&fs_path)
        .arg("-o")
        .arg("/dev/stdout")
        .arg(format!("-c{format}"))
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null());
    platform::hide_child_window(&mut cmd);
    let output = cmd
        .output()
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("thumbnailer failed to start: {e}")))?;
    if !output.status.success() {
        return Err(AppError::Internal(anyhow::anyhow!(
            "thumbnailer exited with {}",
            output.status
        )));
    }
    let content_type = if format == "jpeg" {
        "image/jpeg"
    } else {
        "image/png"
    };
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type)],
        output.stdout,
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct SubtitleQuery {
    #[serde(default)]
    path: String,
}

/// `/subtitle` — a sibling subtitle file as plain text.
pub async fn subtitle_handler(
    State(state): State<AppState>,
    Query(query): Query<SubtitleQuery>,
) -> Result<Response, AppError> {
    let fs_path: PathBuf = resolve_under_root(state.core.model.root_path(), &query.path);
    if fs_path.extension().and_then(|e| e.to_str()) != Some("srt") {
        return Err(AppError::NotFound);
    }
    let data = tokio::fs::read(&fs_path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            AppError::NotFound
        } else {
            AppError::Io(e)
        }
    })?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        data,
    )
        .into_response())
}

/// Connection gate and bookkeeping: rejects filtered addresses, records
/// the client, stamps UPnP headers on every response and optionally dumps
/// request headers.
pub async fn gate_middleware(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let ip = addr.ip();
    if !state.core.allows(ip) {
        debug!(%ip, "rejected by ip filter");
        return (StatusCode::FORBIDDEN, "forbidden").into_response();
    }
    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();
    state.core.note_client(ip, user_agent);

    if state.core.config.log_headers {
        info!(method = %request.method(), uri = %request.uri(), %ip, "request");
        for (name, value) in request.headers() {
            info!("  {name}: {}", value.to_str().unwrap_or("<binary>"));
        }
    }

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        header::SERVER,
        header::HeaderValue::from_static(server::SERVER_FIELD),
    );
    headers.insert("Ext", header::HeaderValue::from_static(""));
    if state.core.config.log_headers {
        info!(status = %response.status(), "response");
        for (name, value) in response.headers() {
            info!("  {name}: {}", value.to_str().unwrap_or("<binary>"));
        }
    }
    response
}
