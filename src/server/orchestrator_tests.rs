use super::*;
use crate::identity::Principal;
use crate::index::MemoryIndex;
use crate::security::{AccessDescriptor, AccessLevel, DescriptorLookup, FileDescriptorStore};
use futures_util::stream;
use tempfile::TempDir;

struct Fixture {
    _tmp: TempDir,
    service: BlobService,
    descriptors: Arc<FileDescriptorStore>,
    index: Arc<MemoryIndex>,
}

fn fixture() -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let store = BlobStore::new(tmp.path()).unwrap();
    let descriptors = Arc::new(FileDescriptorStore::new(store.layout().clone()));
    let index = Arc::new(MemoryIndex::new());
    let service = BlobService::new(store, descriptors.clone(), index.clone(), "admin");
    Fixture { _tmp: tmp, service, descriptors, index }
}

fn ctx(user: &str, roles: &[&str]) -> RequestContext {
    RequestContext::new(Principal::new(user, roles.iter().map(|r| r.to_string()).collect()))
}

fn admin() -> RequestContext {
    ctx("root", &["admin"])
}

fn meta(pairs: &[(&str, &str)]) -> Metadata {
    let mut m = Metadata::new();
    for (k, v) in pairs {
        m.insert(*k, *v);
    }
    m
}

type Body = stream::Iter<std::vec::IntoIter<Result<Bytes, std::io::Error>>>;

fn body(bytes: &'static [u8]) -> Body {
    stream::iter(vec![Ok(Bytes::from_static(bytes))])
}

fn put(container: &str, blob: &str, content: &'static [u8], metadata: Metadata) -> PutBlobRequest<Body> {
    PutBlobRequest {
        container: container.into(),
        blob_path: blob.into(),
        metadata,
        content_type: None,
        metadata_only: false,
        body: body(content),
    }
}

async fn read_all(mut file: tokio::fs::File) -> Vec<u8> {
    use tokio::io::AsyncReadExt;
    let mut out = Vec::new();
    file.read_to_end(&mut out).await.unwrap();
    out
}

fn blob_descriptor(f: &Fixture, container: &str, blob: &str) -> Option<crate::security::AccessDescriptor> {
    match f.descriptors.load(&DescriptorKey::blob(container, blob)) {
        DescriptorLookup::Found(d) => Some(d),
        _ => None,
    }
}

#[tokio::test]
async fn upload_into_undescribed_container_is_forbidden() {
    let f = fixture();
    let err = f.service.put_blob(&ctx("alice", &[]), put("c1", "f.txt", b"x", Metadata::new())).await.unwrap_err();
    assert!(matches!(err, AppError::Forbidden { .. }));
    assert!(blob_descriptor(&f, "c1", "f.txt").is_none());
    assert!(f.service.store().properties("c1", "f.txt").await.unwrap().is_none());
}

#[tokio::test]
async fn listed_user_inherits_container_descriptor() {
    let f = fixture();
    f.service.create_container(&admin(), "c1", &meta(&[("users", "alice")])).await.unwrap();
    let out = f.service.put_blob(&ctx("alice", &[]), put("c1", "f.txt", b"hello", Metadata::new())).await.unwrap();
    match out {
        PutOutcome::Created { descriptor_created, properties, .. } => {
            assert!(!descriptor_created);
            assert_eq!(properties.size, 5);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(!f.descriptors.exists(&DescriptorKey::blob("c1", "f.txt")));
}

#[tokio::test]
async fn access_headers_create_blob_descriptor() {
    let f = fixture();
    f.service.create_container(&admin(), "c1", &meta(&[("users", "alice")])).await.unwrap();
    let m = meta(&[("roles", "HR,Manager"), ("users", "bob")]);
    let out = f.service.put_blob(&ctx("alice", &[]), put("c1", "f2.txt", b"x", m)).await.unwrap();
    assert!(matches!(out, PutOutcome::Created { descriptor_created: true, .. }));
    let d = blob_descriptor(&f, "c1", "f2.txt").unwrap();
    assert_eq!(d.owner, "alice");
    assert!(d.users_allowed.iter().any(|u| u == "alice"));
    assert!(d.users_allowed.iter().any(|u| u == "bob"));
    assert_eq!(d.roles_allowed, vec!["HR", "Manager"]);
    assert_eq!(d.access, AccessLevel::Private);
}

#[tokio::test]
async fn public_blob_is_readable_by_anyone_authenticated() {
    let f = fixture();
    f.service.create_container(&admin(), "c1", &meta(&[("users", "alice")])).await.unwrap();
    f.service
        .put_blob(&ctx("alice", &[]), put("c1", "pub.txt", b"open", meta(&[("access", "public")])))
        .await
        .unwrap();
    let stranger = ctx("mallory", &["Guest"]);
    let handle = f.service.get_blob(&stranger, "c1", "pub.txt").await.unwrap();
    assert_eq!(read_all(handle.file).await, b"open");
    // Public opens reads only.
    let err = f
        .service
        .put_blob(&stranger, put("c1", "pub.txt", b"defaced", Metadata::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden { .. }));
}

#[tokio::test]
async fn metadata_only_update_keeps_content() {
    let f = fixture();
    f.service.create_container(&admin(), "c1", &meta(&[("users", "alice")])).await.unwrap();
    let alice = ctx("alice", &[]);
    f.service.put_blob(&alice, put("c1", "f.txt", b"original", meta(&[("stage", "draft")]))).await.unwrap();
    let mut req = put("c1", "f.txt", b"ignored", meta(&[("Stage", "final")]));
    req.metadata_only = true;
    assert!(matches!(f.service.put_blob(&alice, req).await.unwrap(), PutOutcome::MetadataUpdated { .. }));
    let handle = f.service.get_blob(&alice, "c1", "f.txt").await.unwrap();
    assert_eq!(handle.properties.metadata.get("stage"), Some("final"));
    assert_eq!(read_all(handle.file).await, b"original");
}

#[tokio::test]
async fn metadata_only_update_on_missing_blob_is_not_found() {
    let f = fixture();
    f.service.create_container(&admin(), "c1", &meta(&[("users", "alice")])).await.unwrap();
    let mut req = put("c1", "ghost.txt", b"", meta(&[("a", "1")]));
    req.metadata_only = true;
    let err = f.service.put_blob(&ctx("alice", &[]), req).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound { .. }));
    assert!(blob_descriptor(&f, "c1", "ghost.txt").is_none());
}

#[tokio::test]
async fn blob_descriptor_is_never_regenerated() {
    let f = fixture();
    f.service.create_container(&admin(), "c1", &meta(&[("users", "alice,bob")])).await.unwrap();
    f.service
        .put_blob(&ctx("alice", &[]), put("c1", "f.txt", b"one", meta(&[("users", "carol")])))
        .await
        .unwrap();
    // bob may upload into the container but not overwrite alice's blob.
    let err = f
        .service
        .put_blob(&ctx("bob", &[]), put("c1", "f.txt", b"two", meta(&[("users", "bob")])))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden { .. }));
    // The owner rewriting with new signals leaves the original descriptor in place.
    let out = f
        .service
        .put_blob(&ctx("alice", &[]), put("c1", "f.txt", b"three", meta(&[("access", "public")])))
        .await
        .unwrap();
    assert!(matches!(out, PutOutcome::Created { descriptor_created: false, .. }));
    let d = blob_descriptor(&f, "c1", "f.txt").unwrap();
    assert_eq!(d.access, AccessLevel::Private);
    assert!(d.users_allowed.iter().any(|u| u == "carol"));
}

#[tokio::test]
async fn admin_upload_into_bare_container_creates_descriptor() {
    let f = fixture();
    // Directory present, descriptor absent: only admins pass the container gate.
    f.service.store().create_container("c9").await.unwrap();
    let out = f.service.put_blob(&admin(), put("c9", "a/b.txt", b"x", Metadata::new())).await.unwrap();
    assert!(matches!(out, PutOutcome::Created { descriptor_created: true, .. }));
    let d = blob_descriptor(&f, "c9", "a/b.txt").unwrap();
    assert_eq!(d.owner, "root");
    assert_eq!(d.roles_allowed, vec!["admin"]);
}

#[tokio::test]
async fn forbidden_wins_over_not_found() {
    let f = fixture();
    f.service.create_container(&admin(), "c1", &meta(&[("users", "alice")])).await.unwrap();
    let err = f.service.get_blob(&ctx("eve", &[]), "c1", "missing.txt").await.unwrap_err();
    assert!(matches!(err, AppError::Forbidden { .. }));
    let err = f.service.head_blob(&ctx("alice", &[]), "c1", "missing.txt").await.unwrap_err();
    assert!(matches!(err, AppError::NotFound { .. }));
}

#[tokio::test]
async fn content_type_is_recorded_unless_caller_set_one() {
    let f = fixture();
    f.service.create_container(&admin(), "c1", &Metadata::new()).await.unwrap();
    let mut req = put("c1", "data.bin", b"{}", Metadata::new());
    req.content_type = Some("application/json".into());
    f.service.put_blob(&admin(), req).await.unwrap();
    let props = f.service.head_blob(&admin(), "c1", "data.bin").await.unwrap();
    assert_eq!(props.metadata.get("contentType"), Some("application/json"));

    let mut req = put("c1", "data2.bin", b"{}", meta(&[("ContentType", "text/plain")]));
    req.content_type = Some("application/json".into());
    f.service.put_blob(&admin(), req).await.unwrap();
    let props = f.service.head_blob(&admin(), "c1", "data2.bin").await.unwrap();
    assert_eq!(props.metadata.get("contentType"), Some("text/plain"));
}

#[tokio::test]
async fn uploads_are_indexed() {
    let f = fixture();
    f.service.create_container(&admin(), "c1", &Metadata::new()).await.unwrap();
    f.service.put_blob(&admin(), put("c1", "reports/q1.pdf", b"pdf", Metadata::new())).await.unwrap();
    assert_eq!(f.index.len(), 1);
    let (total, items) = f.index.search("q1", 1, 10).unwrap();
    assert_eq!(total, 1);
    assert_eq!(items[0].file_name, "q1.pdf");
    assert_eq!(items[0].created_by, "root");
}

struct FailingIndex;

impl IndexSink for FailingIndex {
    fn add_or_update(&self, _record: IndexRecord) -> anyhow::Result<()> {
        anyhow::bail!("index offline")
    }

    fn search(&self, _q: &str, _page: usize, _size: usize) -> anyhow::Result<(usize, Vec<IndexRecord>)> {
        Ok((0, vec![]))
    }
}

struct PanickingIndex;

impl IndexSink for PanickingIndex {
    fn add_or_update(&self, _record: IndexRecord) -> anyhow::Result<()> {
        panic!("index bug")
    }

    fn search(&self, _q: &str, _page: usize, _size: usize) -> anyhow::Result<(usize, Vec<IndexRecord>)> {
        Ok((0, vec![]))
    }
}

#[tokio::test]
async fn indexing_failures_never_fail_the_write() {
    for index in [Arc::new(FailingIndex) as Arc<dyn IndexSink>, Arc::new(PanickingIndex) as Arc<dyn IndexSink>] {
        let tmp = tempfile::tempdir().unwrap();
        let store = BlobStore::new(tmp.path()).unwrap();
        let descriptors = Arc::new(FileDescriptorStore::new(store.layout().clone()));
        let service = BlobService::new(store, descriptors, index, "admin");
        service.create_container(&admin(), "c1", &Metadata::new()).await.unwrap();
        let out = service.put_blob(&admin(), put("c1", "f.txt", b"x", Metadata::new())).await.unwrap();
        assert!(matches!(out, PutOutcome::Created { .. }));
    }
}

#[tokio::test]
async fn search_hides_unreadable_blobs() {
    let f = fixture();
    f.service.create_container(&admin(), "c1", &meta(&[("users", "alice")])).await.unwrap();
    let alice = ctx("alice", &[]);
    f.service.put_blob(&alice, put("c1", "shared.txt", b"x", Metadata::new())).await.unwrap();
    f.service.create_container(&admin(), "secret", &Metadata::new()).await.unwrap();
    f.service.put_blob(&admin(), put("secret", "plan.txt", b"x", Metadata::new())).await.unwrap();
    f.service
        .put_blob(&alice, put("c1", "open.txt", b"x", meta(&[("access", "public")])))
        .await
        .unwrap();

    let page = f.service.search(&alice, "", 1, 10).unwrap();
    assert_eq!(page.total, 2);
    assert!(page.items.iter().all(|r| r.container == "c1"));

    let page = f.service.search(&ctx("bob", &[]), "txt", 1, 10).unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].path, "open.txt");

    let page = f.service.search(&admin(), "", 2, 2).unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.items.len(), 1);
}

#[tokio::test]
async fn container_creation_is_admin_only_and_exclusive() {
    let f = fixture();
    let err = f.service.create_container(&ctx("alice", &[]), "c1", &Metadata::new()).await.unwrap_err();
    assert!(matches!(err, AppError::Forbidden { .. }));
    f.service.create_container(&admin(), "c1", &Metadata::new()).await.unwrap();
    assert!(f.service.resolver().container_descriptor_exists("c1"));
    let err = f.service.create_container(&admin(), "c1", &Metadata::new()).await.unwrap_err();
    assert!(matches!(err, AppError::Conflict { .. }));
    let err = f.service.create_container(&admin(), "_search", &Metadata::new()).await.unwrap_err();
    assert!(matches!(err, AppError::UserInput { .. }));
}

#[tokio::test]
async fn traversal_paths_are_rejected() {
    let f = fixture();
    let err = f.service.put_blob(&admin(), put("c1", "../../etc/passwd", b"x", Metadata::new())).await.unwrap_err();
    assert!(matches!(err, AppError::UserInput { .. }));
    let err = f.service.get_blob(&admin(), "c1", "a/./b").await.unwrap_err();
    assert!(matches!(err, AppError::UserInput { .. }));
}

#[tokio::test]
async fn search_past_the_last_page_is_empty() {
    let f = fixture();
    f.service.create_container(&admin(), "c1", &Metadata::new()).await.unwrap();
    f.service.put_blob(&admin(), put("c1", "a.txt", b"x", Metadata::new())).await.unwrap();
    let page = f.service.search(&admin(), "", usize::MAX, usize::MAX).unwrap();
    assert_eq!(page.total, 1);
    assert!(page.items.is_empty());
    let page = f.service.search(&admin(), "", 0, 0).unwrap();
    assert_eq!(page.items.len(), 1);
}

#[tokio::test]
async fn upload_into_missing_container_is_not_found() {
    let f = fixture();
    let err = f.service.put_blob(&admin(), put("nowhere", "f.txt", b"x", Metadata::new())).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound { .. }));
    assert!(!f.service.store().container_exists("nowhere").await.unwrap());
    assert!(blob_descriptor(&f, "nowhere", "f.txt").is_none());
    // Nothing was left behind, so the container can still be created properly.
    f.service.create_container(&admin(), "nowhere", &meta(&[("users", "alice")])).await.unwrap();
    f.service.put_blob(&ctx("alice", &[]), put("nowhere", "f.txt", b"x", Metadata::new())).await.unwrap();
}

#[tokio::test]
async fn sidecar_named_directories_cannot_shadow_descriptors() {
    let f = fixture();
    f.service.create_container(&admin(), "c1", &meta(&[("users", "alice,bob")])).await.unwrap();
    let err = f
        .service
        .put_blob(&ctx("bob", &[]), put("c1", "report.auth/x", b"x", Metadata::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::UserInput { .. }));
    let out = f
        .service
        .put_blob(&ctx("alice", &[]), put("c1", "report", b"q3", meta(&[("users", "carol")])))
        .await
        .unwrap();
    assert!(matches!(out, PutOutcome::Created { descriptor_created: true, .. }));
    let handle = f.service.get_blob(&ctx("carol", &[]), "c1", "report").await.unwrap();
    assert_eq!(read_all(handle.file).await, b"q3");
    let err = f.service.get_blob(&ctx("bob", &[]), "c1", "report").await.unwrap_err();
    assert!(matches!(err, AppError::Forbidden { .. }));
}

/// File-backed store whose blob-level creates fail, as on a full or read-only disk.
struct BlobCreateFails(FileDescriptorStore);

impl DescriptorStore for BlobCreateFails {
    fn load(&self, key: &DescriptorKey) -> DescriptorLookup {
        self.0.load(key)
    }

    fn exists(&self, key: &DescriptorKey) -> bool {
        self.0.exists(key)
    }

    fn create(&self, key: &DescriptorKey, descriptor: &AccessDescriptor) -> crate::error::StorageResult<CreateOutcome> {
        if key.blob.is_some() {
            return Err(crate::error::StorageError::io(
                "descriptor",
                std::io::Error::new(std::io::ErrorKind::Other, "no space left"),
            ));
        }
        self.0.create(key, descriptor)
    }

    fn remove(&self, key: &DescriptorKey) -> crate::error::StorageResult<()> {
        self.0.remove(key)
    }
}

#[tokio::test]
async fn failed_descriptor_create_publishes_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let store = BlobStore::new(tmp.path()).unwrap();
    let descriptors = Arc::new(BlobCreateFails(FileDescriptorStore::new(store.layout().clone())));
    let service = BlobService::new(store, descriptors, Arc::new(MemoryIndex::new()), "admin");
    service.create_container(&admin(), "c1", &meta(&[("users", "alice,eve")])).await.unwrap();

    let err = service
        .put_blob(&ctx("alice", &[]), put("c1", "private.txt", b"secret", meta(&[("users", "bob")])))
        .await
        .unwrap_err();
    assert_eq!(err.http_status(), 500);
    assert!(service.store().properties("c1", "private.txt").await.unwrap().is_none());
    let err = service.get_blob(&ctx("eve", &[]), "c1", "private.txt").await.unwrap_err();
    assert!(matches!(err, AppError::NotFound { .. }));
}

#[tokio::test]
async fn failed_upload_rolls_back_new_descriptor() {
    let f = fixture();
    f.service.create_container(&admin(), "c1", &meta(&[("users", "alice")])).await.unwrap();
    let mut req = put("c1", "torn.bin", b"", meta(&[("users", "bob")]));
    req.body = stream::iter(vec![
        Ok(Bytes::from_static(b"partial")),
        Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "client went away")),
    ]);
    let err = f.service.put_blob(&ctx("alice", &[]), req).await.unwrap_err();
    assert!(matches!(err, AppError::UserInput { .. }));
    assert!(!f.descriptors.exists(&DescriptorKey::blob("c1", "torn.bin")));
    assert!(f.service.store().properties("c1", "torn.bin").await.unwrap().is_none());
    // A later good upload still gets its own descriptor.
    let out = f
        .service
        .put_blob(&ctx("alice", &[]), put("c1", "torn.bin", b"whole", meta(&[("users", "bob")])))
        .await
        .unwrap();
    assert!(matches!(out, PutOutcome::Created { descriptor_created: true, .. }));
}
