//!
//! blobhouse HTTP server
//! ---------------------
//! Axum routes for the blob store. Handlers translate HTTP into orchestrator calls
//! and orchestrator results back into HTTP; authorization and storage decisions are
//! made in `orchestrator`.
//!
//! Routes:
//! - `GET /`: liveness text
//! - `GET /_search?q=&page=&pageSize=`: index search filtered to what the caller can read
//! - `PUT /{container}?restype=container`: create a container (admin only)
//! - `PUT|GET|HEAD /{container}/{*blob}`: upload, download, properties
//!
//! The caller identity comes from trusted headers set by the fronting authenticator.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::header::{self, HeaderName};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::config::{IndexMode, ServerConfig};
use crate::error::{AppError, AppResult};
use crate::identity::{principal_from_headers, RequestContext};
use crate::index::{IndexSink, MemoryIndex, NoopIndex};
use crate::security::FileDescriptorStore;
use crate::storage::{if_none_match_hits, BlobProperties, BlobStore, Metadata, META_HEADER_PREFIX, SYS_CONTENT_TYPE};

pub mod orchestrator;

use orchestrator::{BlobService, PutBlobRequest, PutOutcome};

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<BlobService>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Wire the storage root, descriptor store and index sink described by `config`.
    pub fn from_config(config: ServerConfig) -> anyhow::Result<Self> {
        let store = BlobStore::new(&config.storage_root)
            .with_context(|| format!("While opening storage root: {}", config.storage_root.display()))?;
        let descriptors = Arc::new(FileDescriptorStore::new(store.layout().clone()));
        let index: Arc<dyn IndexSink> = match config.index_mode {
            IndexMode::Memory => Arc::new(MemoryIndex::new()),
            IndexMode::None => Arc::new(NoopIndex),
        };
        let service = BlobService::new(store, descriptors, index, config.admin_role.clone());
        Ok(Self { service: Arc::new(service), config: Arc::new(config) })
    }
}

fn log_startup(config: &ServerConfig) {
    let cwd = std::env::current_dir().ok();
    let user = std::env::var("USER").or_else(|_| std::env::var("USERNAME")).ok();
    info!(
        target: "startup",
        "blobhouse starting: cwd={:?}, user={:?}, storage_root={:?}, admin_role='{}', identity_header='{}', roles_header='{}', index={:?}",
        cwd, user, config.storage_root, config.admin_role, config.identity_header, config.roles_header, config.index_mode
    );
}

/// Log the containers found under the storage root and whether each has a descriptor.
fn log_installed_containers(store: &BlobStore) {
    let mut names: Vec<(String, bool)> = Vec::new();
    if let Ok(rd) = std::fs::read_dir(store.root_path()) {
        for entry in rd.flatten() {
            if !entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let described = entry.path().join(crate::storage::paths::CONTAINER_AUTH_FILE).is_file();
            names.push((name, described));
        }
    }
    names.sort();
    if names.is_empty() {
        info!(target: "startup", "No containers found under {}", store.root_path().display());
        return;
    }
    info!(target: "startup", "Installed containers:");
    for (name, described) in names {
        if described {
            info!(target: "startup", "- {}", name);
        } else {
            warn!(target: "startup", "- {} (no .container.auth; admin-only)", name);
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "blobhouse ok" }))
        .route("/_search", get(search))
        .route("/{container}", put(put_container))
        .route("/{container}/{*blob}", put(put_blob).get(get_blob).head(head_blob))
        // Uploads stream straight to disk; there is no in-memory size cap to enforce.
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

/// Start the HTTP server and serve until the listener fails.
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    log_startup(&config);
    let addr: SocketAddr = format!("{}:{}", config.bind_addr, config.http_port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", config.bind_addr, config.http_port))?;
    let state = AppState::from_config(config)?;
    log_installed_containers(state.service.store());

    let app = router(state);
    info!(target: "startup", "Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
struct BlobQuery {
    comp: Option<String>,
    restype: Option<String>,
}

impl BlobQuery {
    fn is_metadata(&self) -> bool {
        self.comp.as_deref().map(|c| c.eq_ignore_ascii_case("metadata")).unwrap_or(false)
    }

    fn reject_unknown_comp(&self) -> AppResult<()> {
        match self.comp.as_deref() {
            None => Ok(()),
            Some(c) if c.eq_ignore_ascii_case("metadata") => Ok(()),
            Some(c) => Err(AppError::user("unsupported_comp".to_string(), format!("unsupported comp '{}'", c))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    q: Option<String>,
    page: Option<usize>,
    #[serde(rename = "pageSize")]
    page_size: Option<usize>,
}

const DEFAULT_PAGE_SIZE: usize = 20;

fn request_context(state: &AppState, headers: &HeaderMap) -> AppResult<RequestContext> {
    principal_from_headers(headers, &state.config.identity_header, &state.config.roles_header)
        .map(RequestContext::new)
        .ok_or_else(|| AppError::auth("unauthenticated", "missing caller identity"))
}

/// `<public base>/<container>[/<blob>]` with each path segment percent-encoded.
fn location(state: &AppState, container: &str, blob_path: Option<&str>) -> String {
    let base = state.config.public_base_url.as_deref().unwrap_or("");
    let mut out = format!("{}/{}", base, urlencoding::encode(container));
    if let Some(blob) = blob_path {
        for seg in blob.split('/') {
            out.push('/');
            out.push_str(&urlencoding::encode(seg));
        }
    }
    out
}

fn http_date(props: &BlobProperties) -> String {
    props.last_modified_utc().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn content_type_for(props: &BlobProperties, blob_path: &str) -> String {
    props
        .metadata
        .get(SYS_CONTENT_TYPE)
        .map(str::to_string)
        .unwrap_or_else(|| mime_guess::from_path(blob_path).first_or_octet_stream().essence_str().to_string())
}

fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(v) => {
            headers.insert(name, v);
        }
        Err(_) => warn!(target: "storage", header = %name, "dropping header value that is not valid HTTP"),
    }
}

/// Validator and caching headers shared by every blob response.
fn validator_headers(props: &BlobProperties, cache_control: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    insert_header(&mut headers, header::ETAG, &format!("\"{}\"", props.etag));
    insert_header(&mut headers, header::LAST_MODIFIED, &http_date(props));
    insert_header(&mut headers, header::CACHE_CONTROL, cache_control);
    headers
}

/// Full property headers: validators, content type, and one `x-ms-meta-*` per key.
fn property_headers(props: &BlobProperties, blob_path: &str, cache_control: &str) -> HeaderMap {
    let mut headers = validator_headers(props, cache_control);
    insert_header(&mut headers, header::CONTENT_TYPE, &content_type_for(props, blob_path));
    for (key, value) in props.metadata.iter() {
        let name = format!("{}{}", META_HEADER_PREFIX, key.to_ascii_lowercase());
        match HeaderName::from_bytes(name.as_bytes()) {
            Ok(n) => insert_header(&mut headers, n, value),
            Err(_) => warn!(target: "storage", key, "metadata key is not a valid header name; omitted"),
        }
    }
    headers
}

fn not_modified(headers: &HeaderMap, props: &BlobProperties) -> bool {
    headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(|v| if_none_match_hits(v, &props.etag))
        .unwrap_or(false)
}

async fn search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<SearchParams>,
) -> AppResult<Response> {
    let ctx = request_context(&state, &headers)?;
    let query = params.q.unwrap_or_default();
    let page = params.page.unwrap_or(1);
    let page_size = params.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
    let result = state.service.search(&ctx, &query, page, page_size)?;
    Ok(Json(serde_json::json!({ "total": result.total, "items": result.items })).into_response())
}

async fn put_container(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(container): Path<String>,
    Query(q): Query<BlobQuery>,
) -> AppResult<Response> {
    let ctx = request_context(&state, &headers)?;
    if !q.restype.as_deref().map(|r| r.eq_ignore_ascii_case("container")).unwrap_or(false) {
        return Err(AppError::user("unsupported_operation", "PUT on a container requires restype=container"));
    }
    let metadata = Metadata::from_headers(&headers)?;
    state.service.create_container(&ctx, &container, &metadata).await?;
    let mut out = HeaderMap::new();
    insert_header(&mut out, header::LOCATION, &location(&state, &container, None));
    Ok((StatusCode::CREATED, out).into_response())
}

async fn put_blob(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((container, blob)): Path<(String, String)>,
    Query(q): Query<BlobQuery>,
    body: Body,
) -> AppResult<Response> {
    let ctx = request_context(&state, &headers)?;
    q.reject_unknown_comp()?;
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let req = PutBlobRequest {
        container,
        blob_path: blob,
        metadata: Metadata::from_headers(&headers)?,
        content_type,
        metadata_only: q.is_metadata(),
        body: body.into_data_stream(),
    };
    let cache_control = state.config.cache_control();
    match state.service.put_blob(&ctx, req).await? {
        PutOutcome::Created { container, blob_path, properties, .. } => {
            let mut out = validator_headers(&properties, &cache_control);
            insert_header(&mut out, header::LOCATION, &location(&state, &container, Some(&blob_path)));
            Ok((StatusCode::CREATED, out).into_response())
        }
        PutOutcome::MetadataUpdated { properties } => {
            Ok((StatusCode::OK, validator_headers(&properties, &cache_control)).into_response())
        }
    }
}

async fn get_blob(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((container, blob)): Path<(String, String)>,
    Query(q): Query<BlobQuery>,
) -> AppResult<Response> {
    let ctx = request_context(&state, &headers)?;
    q.reject_unknown_comp()?;
    let cache_control = state.config.cache_control();
    if q.is_metadata() {
        let props = state.service.head_blob(&ctx, &container, &blob).await?;
        return Ok((StatusCode::OK, property_headers(&props, &blob, &cache_control)).into_response());
    }
    let handle = state.service.get_blob(&ctx, &container, &blob).await?;
    let props = handle.properties;
    if not_modified(&headers, &props) {
        return Ok((StatusCode::NOT_MODIFIED, validator_headers(&props, &cache_control)).into_response());
    }
    let mut out = property_headers(&props, &blob, &cache_control);
    out.insert(header::CONTENT_LENGTH, HeaderValue::from(props.size));
    let body = Body::from_stream(ReaderStream::new(handle.file));
    Ok((StatusCode::OK, out, body).into_response())
}

async fn head_blob(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((container, blob)): Path<(String, String)>,
) -> AppResult<Response> {
    let ctx = request_context(&state, &headers)?;
    let props = state.service.head_blob(&ctx, &container, &blob).await?;
    let cache_control = state.config.cache_control();
    if not_modified(&headers, &props) {
        return Ok((StatusCode::NOT_MODIFIED, validator_headers(&props, &cache_control)).into_response());
    }
    let mut out = property_headers(&props, &blob, &cache_control);
    out.insert(header::CONTENT_LENGTH, HeaderValue::from(props.size));
    Ok((StatusCode::OK, out).into_response())
}
