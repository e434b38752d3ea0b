//! Request orchestration for blob and container operations.
//!
//! `BlobService` composes the authorization resolver and the blob store. The HTTP
//! handlers in `server` only translate requests and responses; every decision about
//! who may do what, and in which order, lives here.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{FutureExt, Stream};
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::identity::RequestContext;
use crate::index::{IndexRecord, IndexSink};
use crate::security::{
    carries_access_signals, derive_descriptor, AuthorizationResolver, CreateOutcome, DescriptorKey, DescriptorStore,
    Target,
};
use crate::storage::{normalize_blob_path, validate_container_name, BlobHandle, BlobProperties, BlobStore, Metadata, SYS_CONTENT_TYPE};

/// Largest page the search surface hands out.
pub const MAX_PAGE_SIZE: usize = 100;
const SEARCH_SCAN_PAGE: usize = 200;

pub struct PutBlobRequest<S> {
    pub container: String,
    pub blob_path: String,
    pub metadata: Metadata,
    pub content_type: Option<String>,
    /// `comp=metadata`: merge metadata only; never touches content or descriptors.
    pub metadata_only: bool,
    pub body: S,
}

#[derive(Debug)]
pub enum PutOutcome {
    Created {
        container: String,
        blob_path: String,
        properties: BlobProperties,
        descriptor_created: bool,
    },
    MetadataUpdated {
        properties: BlobProperties,
    },
}

#[derive(Debug)]
pub struct SearchPage {
    pub total: usize,
    pub items: Vec<IndexRecord>,
}

fn forbidden() -> AppError {
    AppError::forbidden("forbidden", "access denied")
}

fn not_found(container: &str, blob_path: &str) -> AppError {
    AppError::not_found("not_found".to_string(), format!("blob not found: {}/{}", container, blob_path))
}

#[derive(Clone)]
pub struct BlobService {
    store: BlobStore,
    resolver: AuthorizationResolver,
    descriptors: Arc<dyn DescriptorStore>,
    index: Arc<dyn IndexSink>,
}

impl BlobService {
    pub fn new(
        store: BlobStore,
        descriptors: Arc<dyn DescriptorStore>,
        index: Arc<dyn IndexSink>,
        admin_role: impl Into<String>,
    ) -> Self {
        let resolver = AuthorizationResolver::new(descriptors.clone(), admin_role);
        Self { store, resolver, descriptors, index }
    }

    pub fn store(&self) -> &BlobStore {
        &self.store
    }

    pub fn resolver(&self) -> &AuthorizationResolver {
        &self.resolver
    }

    /// Create a container and its `.container.auth`. Admin only.
    pub async fn create_container(&self, ctx: &RequestContext, container: &str, metadata: &Metadata) -> AppResult<()> {
        if !self.resolver.is_admin(&ctx.principal) {
            info!(target: "authz", user = %ctx.user_id(), container, request_id = %ctx.request_id, "container create denied");
            return Err(forbidden());
        }
        validate_container_name(container)?;
        self.store.create_container(container).await?;
        let descriptor = derive_descriptor(ctx.user_id(), metadata, self.resolver.admin_role());
        match self.descriptors.create(&DescriptorKey::container(container), &descriptor)? {
            CreateOutcome::Created => {}
            CreateOutcome::AlreadyExisted => {
                warn!(target: "authz", container, "container descriptor already present; keeping existing one");
            }
        }
        info!(target: "storage", user = %ctx.user_id(), container, request_id = %ctx.request_id, "container created");
        Ok(())
    }

    /// PUT state machine: container gate, blob gate, content or metadata write,
    /// lazy blob descriptor, best-effort indexing.
    pub async fn put_blob<S, E>(&self, ctx: &RequestContext, req: PutBlobRequest<S>) -> AppResult<PutOutcome>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: std::fmt::Display,
    {
        let PutBlobRequest { container, blob_path, mut metadata, content_type, metadata_only, body } = req;
        validate_container_name(&container)?;
        let blob_path = normalize_blob_path(&blob_path)?;
        let principal = &ctx.principal;

        if !self.resolver.can_upload_into(&container, principal) {
            info!(target: "authz", user = %principal.user_id, container = %container, blob = %blob_path, request_id = %ctx.request_id, "upload denied at container");
            return Err(forbidden());
        }

        let target = Target::Blob { container: &container, path: &blob_path };
        let blob_descriptor_exists = self.resolver.blob_descriptor_exists(&container, &blob_path);
        if blob_descriptor_exists && !self.resolver.can_write(target, principal) {
            info!(target: "authz", user = %principal.user_id, container = %container, blob = %blob_path, request_id = %ctx.request_id, "upload denied at blob");
            return Err(forbidden());
        }

        // Uploads never create containers; that is `create_container`'s job and it sets the descriptor.
        if !self.store.container_exists(&container).await? {
            return Err(AppError::not_found(
                "container_not_found".to_string(),
                format!("container not found: {}", container),
            ));
        }

        if metadata_only {
            let properties = self.store.update_metadata(&container, &blob_path, &metadata).await?;
            debug!(target: "storage", container = %container, blob = %blob_path, request_id = %ctx.request_id, "metadata-only update");
            return Ok(PutOutcome::MetadataUpdated { properties });
        }

        let needs_descriptor = !self.resolver.container_descriptor_exists(&container) || carries_access_signals(&metadata);
        if let Some(ct) = content_type.filter(|ct| !ct.trim().is_empty()) {
            if !metadata.contains_key(SYS_CONTENT_TYPE) {
                metadata.insert(SYS_CONTENT_TYPE, ct);
            }
        }

        // The descriptor goes in before the content so the blob is never visible under
        // the broader container access.
        let blob_key = DescriptorKey::blob(&container, &blob_path);
        let mut descriptor_created = false;
        if needs_descriptor && !blob_descriptor_exists {
            let descriptor = derive_descriptor(ctx.user_id(), &metadata, self.resolver.admin_role());
            match self.descriptors.create(&blob_key, &descriptor)? {
                CreateOutcome::Created => {
                    descriptor_created = true;
                    debug!(target: "authz", container = %container, blob = %blob_path, owner = %descriptor.owner, "blob descriptor created");
                }
                CreateOutcome::AlreadyExisted => {
                    // Lost a race with a concurrent first write; the winner's descriptor stands.
                    warn!(target: "authz", container = %container, blob = %blob_path, request_id = %ctx.request_id, "blob descriptor created concurrently; keeping existing one");
                }
            }
        }

        let properties = match self.store.save(&container, &blob_path, body, &metadata, ctx.user_id()).await {
            Ok(p) => p,
            Err(e) => {
                if descriptor_created {
                    if let Err(rm) = self.descriptors.remove(&blob_key) {
                        warn!(target: "authz", container = %container, blob = %blob_path, request_id = %ctx.request_id, "failed to roll back blob descriptor: {}", rm);
                    }
                }
                return Err(e.into());
            }
        };

        self.notify_index(&container, &blob_path, &properties, ctx.user_id()).await;

        info!(
            target: "storage",
            user = %ctx.user_id(),
            container = %container,
            blob = %blob_path,
            size = properties.size,
            descriptor_created,
            request_id = %ctx.request_id,
            "blob written"
        );
        Ok(PutOutcome::Created { container, blob_path, properties, descriptor_created })
    }

    /// Report a write to the indexing sink. Errors and panics are logged and swallowed.
    async fn notify_index(&self, container: &str, blob_path: &str, properties: &BlobProperties, created_by: &str) {
        let record = IndexRecord {
            container: container.to_string(),
            path: blob_path.to_string(),
            file_name: blob_path.rsplit('/').next().unwrap_or(blob_path).to_string(),
            last_modified: properties.last_modified_utc(),
            created_by: created_by.to_string(),
            size: properties.size,
        };
        let index = self.index.clone();
        let outcome = AssertUnwindSafe(async move { index.add_or_update(record) })
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(target: "index", container, blob = blob_path, "indexing failed: {}", e),
            Err(_) => warn!(target: "index", container, blob = blob_path, "indexing panicked"),
        }
    }

    fn authorize_read(&self, ctx: &RequestContext, container: &str, blob_path: &str) -> AppResult<()> {
        // The container gate for reads is the fallback step of the blob lookup: with
        // no blob descriptor the container descriptor decides, otherwise the blob's does.
        let target = Target::Blob { container, path: blob_path };
        if self.resolver.can_read(target, &ctx.principal) {
            Ok(())
        } else {
            info!(target: "authz", user = %ctx.user_id(), container, blob = blob_path, request_id = %ctx.request_id, "read denied");
            Err(forbidden())
        }
    }

    /// GET: authorize, then open. Forbidden is decided before existence is revealed.
    pub async fn get_blob(&self, ctx: &RequestContext, container: &str, blob_path: &str) -> AppResult<BlobHandle> {
        validate_container_name(container)?;
        let blob_path = normalize_blob_path(blob_path)?;
        self.authorize_read(ctx, container, &blob_path)?;
        self.store
            .get(container, &blob_path)
            .await?
            .ok_or_else(|| not_found(container, &blob_path))
    }

    /// HEAD and `comp=metadata` reads: same gate as GET, no content opened.
    pub async fn head_blob(&self, ctx: &RequestContext, container: &str, blob_path: &str) -> AppResult<BlobProperties> {
        validate_container_name(container)?;
        let blob_path = normalize_blob_path(blob_path)?;
        self.authorize_read(ctx, container, &blob_path)?;
        self.store
            .properties(container, &blob_path)
            .await?
            .ok_or_else(|| not_found(container, &blob_path))
    }

    /// Search the index, keeping only records the caller may read. Paging applies
    /// after filtering so totals reflect what the caller can see.
    pub fn search(&self, ctx: &RequestContext, query: &str, page: usize, page_size: usize) -> AppResult<SearchPage> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        let mut visible = Vec::new();
        let mut scan_page = 1;
        loop {
            let (total, batch) = self.index.search(query, scan_page, SEARCH_SCAN_PAGE)?;
            let batch_len = batch.len();
            visible.extend(batch.into_iter().filter(|r| {
                self.resolver.can_read(Target::Blob { container: &r.container, path: &r.path }, &ctx.principal)
            }));
            if batch_len < SEARCH_SCAN_PAGE || scan_page.saturating_mul(SEARCH_SCAN_PAGE) >= total {
                break;
            }
            scan_page += 1;
        }
        let total = visible.len();
        let items = visible.into_iter().skip(page.saturating_sub(1).saturating_mul(page_size)).take(page_size).collect();
        Ok(SearchPage { total, items })
    }
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod orchestrator_tests;
