//! Attachment ingestion: inbound caller objects become provider-native
//! input items; outbound tool artifacts (generated images, container
//! files) are persisted and made tenant-addressable.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use maestro_core::types::TenantId;
use maestro_protocol::frames::MessageAttachment;
use maestro_providers::RunItem;
use maestro_storage::port::asset_key;
use maestro_storage::ObjectStore;

use crate::error::{EngineError, Result};

const PRESIGN_TTL: Duration = Duration::from_secs(15 * 60);

/// Caller-supplied input attachment reference.
#[derive(Debug, Clone, Deserialize)]
pub struct InputAttachment {
    pub object_id: String,
    #[serde(default)]
    pub kind: Option<String>,
}

/// Downloads code-interpreter container files. External collaborator;
/// deployments without one skip container citations.
#[async_trait]
pub trait ContainerFileGateway: Send + Sync {
    async fn download(&self, container_file_id: &str, filename: &str) -> Result<Vec<u8>>;
}

/// Resolve inbound attachments into provider-native input items plus the
/// attachment records persisted with the user message.
pub async fn resolve_input(
    objects: &Arc<dyn ObjectStore>,
    attachments: &[InputAttachment],
) -> Result<(Vec<Value>, Vec<MessageAttachment>)> {
    let mut items = Vec::with_capacity(attachments.len());
    let mut records = Vec::with_capacity(attachments.len());
    for att in attachments {
        let filename = att
            .object_id
            .rsplit('/')
            .next()
            .unwrap_or(att.object_id.as_str())
            .to_string();
        let mime = mime_for_filename(&filename);
        if att.kind.as_deref() == Some("image") && !mime.starts_with("image/") {
            return Err(EngineError::Validation(format!(
                "attachment '{}' declared kind=image but looks like {mime}",
                att.object_id
            )));
        }
        let url = objects
            .get_presigned_download(&att.object_id, PRESIGN_TTL)
            .await?;
        let size = objects.get_object_bytes(&att.object_id).await?.len() as u64;

        let item = if mime.starts_with("image/") {
            json!({"type": "input_image", "image_url": url})
        } else {
            json!({"type": "input_file", "file_url": url, "filename": filename})
        };
        items.push(item);
        records.push(MessageAttachment {
            object_id: att.object_id.clone(),
            filename,
            mime_type: mime.to_string(),
            size_bytes: size,
            tool_call_id: None,
            container_file_id: None,
            presigned_url: Some(url),
        });
    }
    Ok((items, records))
}

/// Persist a generated image carried on a run item. Deduplicates by
/// `tool_call_id` within one run so retried items do not double-store.
pub async fn persist_output_image(
    objects: &Arc<dyn ObjectStore>,
    tenant_id: TenantId,
    item: &RunItem,
    seen_tool_calls: &mut HashSet<String>,
) -> Result<Option<MessageAttachment>> {
    let Some(data) = &item.image_base64 else {
        return Ok(None);
    };
    if let Some(tool_call_id) = &item.tool_call_id {
        if !seen_tool_calls.insert(tool_call_id.clone()) {
            return Ok(None);
        }
    }

    let bytes = STANDARD
        .decode(data)
        .map_err(|e| EngineError::Validation(format!("invalid image payload: {e}")))?;
    let filename = sanitize_filename(item.image_filename.as_deref().unwrap_or("generated.png"));
    let mime = item
        .image_mime
        .clone()
        .unwrap_or_else(|| mime_for_filename(&filename).to_string());

    let key = asset_key(&tenant_id.to_string(), &Uuid::new_v4().to_string(), &filename);
    let size = bytes.len() as u64;
    objects.put_object(&key, bytes, &mime).await?;
    let url = objects.get_presigned_download(&key, PRESIGN_TTL).await.ok();
    debug!(key = %key, size, "stored generated image");

    Ok(Some(MessageAttachment {
        object_id: key,
        filename,
        mime_type: mime,
        size_bytes: size,
        tool_call_id: item.tool_call_id.clone(),
        container_file_id: None,
        presigned_url: url,
    }))
}

/// Fetch container-file citations referenced by a run item's annotations
/// and persist them as tenant assets. Deduplicates by container file id.
pub async fn ingest_container_citations(
    objects: &Arc<dyn ObjectStore>,
    gateway: &Arc<dyn ContainerFileGateway>,
    tenant_id: TenantId,
    annotations: &[Value],
    seen_container_files: &mut HashSet<String>,
) -> Vec<MessageAttachment> {
    let mut out = Vec::new();
    for ann in annotations {
        if ann.get("type").and_then(Value::as_str) != Some("container_file_citation") {
            continue;
        }
        let Some(file_id) = ann.get("container_file_id").and_then(Value::as_str) else {
            continue;
        };
        if !seen_container_files.insert(file_id.to_string()) {
            continue;
        }
        let filename = sanitize_filename(
            ann.get("filename")
                .and_then(Value::as_str)
                .unwrap_or("container-file.bin"),
        );
        let bytes = match gateway.download(file_id, &filename).await {
            Ok(b) => b,
            Err(e) => {
                warn!(container_file_id = %file_id, error = %e, "container file download failed");
                continue;
            }
        };
        let mime = mime_for_filename(&filename).to_string();
        let key = asset_key(&tenant_id.to_string(), &Uuid::new_v4().to_string(), &filename);
        let size = bytes.len() as u64;
        if let Err(e) = objects.put_object(&key, bytes, &mime).await {
            warn!(container_file_id = %file_id, error = %e, "container file store failed");
            continue;
        }
        let url = objects.get_presigned_download(&key, PRESIGN_TTL).await.ok();
        out.push(MessageAttachment {
            object_id: key,
            filename,
            mime_type: mime,
            size_bytes: size,
            tool_call_id: None,
            container_file_id: Some(file_id.to_string()),
            presigned_url: url,
        });
    }
    out
}

/// Strip path separators and control characters; keep the name readable.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0'..='\u{1f}' => '_',
            other => other,
        })
        .collect();
    let trimmed = cleaned.trim_matches(['.', ' ']).to_string();
    if trimmed.is_empty() {
        "file.bin".to_string()
    } else {
        trimmed
    }
}

/// Extension-based mime inference for stored artifacts.
pub fn mime_for_filename(name: &str) -> &'static str {
    match name.rsplit('.').next().map(|e| e.to_ascii_lowercase()).as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("pdf") => "application/pdf",
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("txt") | Some("md") => "text/plain",
        Some("html") => "text/html",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_storage::memory::MemoryObjectStore;

    fn objects() -> Arc<dyn ObjectStore> {
        Arc::new(MemoryObjectStore::new())
    }

    #[tokio::test]
    async fn image_inputs_become_input_image_items() {
        let store = objects();
        store
            .put_object("asset/t/a/photo.png", vec![1, 2, 3], "image/png")
            .await
            .unwrap();
        let (items, records) = resolve_input(
            &store,
            &[InputAttachment {
                object_id: "asset/t/a/photo.png".to_string(),
                kind: Some("image".to_string()),
            }],
        )
        .await
        .unwrap();
        assert_eq!(items[0]["type"], json!("input_image"));
        assert_eq!(records[0].mime_type, "image/png");
        assert_eq!(records[0].size_bytes, 3);
    }

    #[tokio::test]
    async fn non_image_declared_as_image_is_rejected() {
        let store = objects();
        store
            .put_object("asset/t/a/notes.txt", vec![1], "text/plain")
            .await
            .unwrap();
        let err = resolve_input(
            &store,
            &[InputAttachment {
                object_id: "asset/t/a/notes.txt".to_string(),
                kind: Some("image".to_string()),
            }],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn generated_images_are_stored_and_deduped() {
        let store = objects();
        let tenant = TenantId::new();
        let mut seen = HashSet::new();
        let item = RunItem {
            item_type: "image_generation".to_string(),
            tool_call_id: Some("call_1".to_string()),
            image_base64: Some(STANDARD.encode(b"png-bytes")),
            image_filename: Some("out.png".to_string()),
            ..Default::default()
        };
        let first = persist_output_image(&store, tenant, &item, &mut seen)
            .await
            .unwrap();
        let attachment = first.unwrap();
        assert_eq!(attachment.filename, "out.png");
        assert_eq!(attachment.size_bytes, 9);
        assert!(attachment.object_id.starts_with(&format!("asset/{tenant}/")));

        // second arrival of the same tool call is a no-op
        let second = persist_output_image(&store, tenant, &item, &mut seen)
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn filenames_are_sanitized() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_filename(""), "file.bin");
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
    }

    struct StubGateway;

    #[async_trait]
    impl ContainerFileGateway for StubGateway {
        async fn download(&self, _id: &str, _filename: &str) -> Result<Vec<u8>> {
            Ok(b"csv,data".to_vec())
        }
    }

    #[tokio::test]
    async fn container_citations_are_ingested_once() {
        let store = objects();
        let gateway: Arc<dyn ContainerFileGateway> = Arc::new(StubGateway);
        let tenant = TenantId::new();
        let mut seen = HashSet::new();
        let annotations = vec![
            json!({"type": "container_file_citation", "container_file_id": "cf_1", "filename": "data.csv"}),
            json!({"type": "container_file_citation", "container_file_id": "cf_1", "filename": "data.csv"}),
            json!({"type": "url_citation", "url": "https://docs.rs"}),
        ];
        let attachments =
            ingest_container_citations(&store, &gateway, tenant, &annotations, &mut seen).await;
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].mime_type, "text/csv");
        assert_eq!(attachments[0].container_file_id.as_deref(), Some("cf_1"));
    }
}
