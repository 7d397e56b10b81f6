//! Document retrieval from blob storage.
//!
//! Fetches the raw bytes and content type of a stored document and encodes them
//! into an inline, MIME-typed payload the model can consume directly.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::{header::CONTENT_TYPE, Client, StatusCode, Url};
use tracing::{debug, info};

use crate::config::Settings;
use crate::error::RetrievalError;

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// A stored object as returned by the blob store.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    /// MIME type from object metadata.
    pub content_type: String,
}

/// Self-describing inline document payload (MIME type + base64 data).
#[derive(Debug, Clone, PartialEq)]
pub struct InlineMedia {
    pub mime_type: String,
    pub data: String,
    pub byte_len: usize,
}

impl InlineMedia {
    pub fn encode(object: &StoredObject) -> Self {
        Self {
            mime_type: object.content_type.clone(),
            data: BASE64.encode(&object.bytes),
            byte_len: object.bytes.len(),
        }
    }

    /// `data:<mime>;base64,<payload>`
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

/// Blob storage collaborator.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<StoredObject, RetrievalError>;
}

/// Fetch a document and encode it inline. Failures propagate immediately.
pub async fn retrieve_inline(
    store: &dyn BlobStore,
    storage_path: &str,
) -> Result<InlineMedia, RetrievalError> {
    let path = normalize_path(storage_path);
    if path.is_empty() {
        return Err(RetrievalError::NotFound(storage_path.to_string()));
    }

    let object = store.get(path).await?;
    let media = InlineMedia::encode(&object);

    info!(
        "Retrieved {} ({} bytes, {})",
        path, media.byte_len, media.mime_type
    );
    Ok(media)
}

fn normalize_path(storage_path: &str) -> &str {
    storage_path.trim().trim_start_matches('/')
}

/// Supabase Storage backed blob store.
#[derive(Clone)]
pub struct SupabaseStorage {
    client: Client,
    base_url: String,
    service_role_key: String,
    bucket: String,
}

impl SupabaseStorage {
    pub fn new(settings: &Settings) -> Self {
        Self {
            client: Client::new(),
            base_url: settings.supabase_url.clone(),
            service_role_key: settings.supabase_service_role_key.clone(),
            bucket: settings.storage_bucket.clone(),
        }
    }
}

#[async_trait]
impl BlobStore for SupabaseStorage {
    async fn get(&self, path: &str) -> Result<StoredObject, RetrievalError> {
        let url = object_url(&self.base_url, &self.bucket, path)?;
        debug!("Fetching object: {}", url);

        let resp = self
            .client
            .get(url)
            .header("apikey", &self.service_role_key)
            .header("Authorization", format!("Bearer {}", self.service_role_key))
            .send()
            .await
            .map_err(|e| RetrievalError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_failure(path, status, &text));
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| FALLBACK_CONTENT_TYPE.to_string());

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| RetrievalError::Transport(e.to_string()))?
            .to_vec();

        Ok(StoredObject {
            bytes,
            content_type,
        })
    }
}

/// `{base}/storage/v1/object/{bucket}/{path}` with every segment percent-encoded,
/// so names containing `#`, `?` or non-ASCII characters stay part of the path.
fn object_url(base_url: &str, bucket: &str, path: &str) -> Result<Url, RetrievalError> {
    let mut url = Url::parse(base_url)
        .map_err(|e| RetrievalError::Transport(format!("invalid storage url {}: {}", base_url, e)))?;
    url.path_segments_mut()
        .map_err(|_| RetrievalError::Transport(format!("invalid storage url {}", base_url)))?
        .pop_if_empty()
        .extend(["storage", "v1", "object", bucket])
        .extend(path.split('/'));
    Ok(url)
}

/// Storage API reports a missing object either as 404 or as 400 with a `not_found` body.
fn classify_failure(path: &str, status: StatusCode, body: &str) -> RetrievalError {
    let lowered = body.to_lowercase();
    match status {
        StatusCode::NOT_FOUND => RetrievalError::NotFound(path.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            RetrievalError::AccessDenied(path.to_string())
        }
        StatusCode::BAD_REQUEST if lowered.contains("not_found") || lowered.contains("not found") => {
            RetrievalError::NotFound(path.to_string())
        }
        _ => RetrievalError::Transport(format!("{} - {}", status, body)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;

    #[test]
    fn test_data_url() {
        let media = InlineMedia::encode(&StoredObject {
            bytes: b"hello".to_vec(),
            content_type: "application/pdf".to_string(),
        });
        assert_eq!(media.data_url(), "data:application/pdf;base64,aGVsbG8=");
        assert_eq!(media.byte_len, 5);
        assert!(!media.is_image());
    }

    #[test]
    fn test_classify_failure() {
        assert!(matches!(
            classify_failure("a", StatusCode::NOT_FOUND, ""),
            RetrievalError::NotFound(_)
        ));
        assert!(matches!(
            classify_failure("a", StatusCode::BAD_REQUEST, r#"{"statusCode":"404","error":"not_found"}"#),
            RetrievalError::NotFound(_)
        ));
        assert!(matches!(
            classify_failure("a", StatusCode::FORBIDDEN, ""),
            RetrievalError::AccessDenied(_)
        ));
        assert!(matches!(
            classify_failure("a", StatusCode::INTERNAL_SERVER_ERROR, "oops"),
            RetrievalError::Transport(_)
        ));
    }

    #[test]
    fn test_object_url_encodes_each_segment() {
        let url = object_url("https://db.example.co", "documents", "quotes/報價#2.pdf").unwrap();
        assert!(url.fragment().is_none());
        assert!(url.query().is_none());
        assert!(url
            .as_str()
            .starts_with("https://db.example.co/storage/v1/object/documents/quotes/"));
        assert!(url.as_str().ends_with("%232.pdf"));

        let segments: Vec<&str> = url.path_segments().unwrap().collect();
        assert_eq!(segments.len(), 6);

        let url = object_url("https://db.example.co/", "documents", "a?b.pdf").unwrap();
        assert_eq!(url.as_str(), "https://db.example.co/storage/v1/object/documents/a%3Fb.pdf");
        assert!(object_url("not a url", "documents", "a.pdf").is_err());
    }

    #[tokio::test]
    async fn test_mime_type_comes_from_metadata_not_extension() {
        let store = MemoryStore::new();
        store.put_object("quotes/scan.bin", b"%PDF-1.7".to_vec(), "application/pdf");

        let media = retrieve_inline(&store, "/quotes/scan.bin").await.unwrap();
        assert_eq!(media.mime_type, "application/pdf");
    }

    #[tokio::test]
    async fn test_missing_and_denied_objects() {
        let store = MemoryStore::new();
        store.put_object("private/q.pdf", b"x".to_vec(), "application/pdf");
        store.deny("private/q.pdf");

        let err = retrieve_inline(&store, "quotes/none.pdf").await.unwrap_err();
        assert!(matches!(err, RetrievalError::NotFound(_)));

        let err = retrieve_inline(&store, "private/q.pdf").await.unwrap_err();
        assert!(matches!(err, RetrievalError::AccessDenied(_)));

        let err = retrieve_inline(&store, "  ").await.unwrap_err();
        assert!(matches!(err, RetrievalError::NotFound(_)));
    }
}
