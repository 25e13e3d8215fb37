use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Narrow object-store port consumed by the ledger and attachment paths.
///
/// Keys are full tenant-scoped paths (`payload/{tenant}/…`,
/// `asset/{tenant}/…`); callers own the layout, backends own the bytes.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// Write an object. Content-hash style keys make repeated puts no-ops.
    async fn put_object(&self, key: &str, bytes: Vec<u8>, mime_type: &str) -> Result<()>;

    async fn get_object_bytes(&self, key: &str) -> Result<Vec<u8>>;

    /// URL a client can GET without credentials until `ttl` expires.
    async fn get_presigned_download(&self, key: &str, ttl: Duration) -> Result<String>;

    async fn delete_object(&self, key: &str) -> Result<()>;
}

/// Object key for a spilled ledger payload.
pub fn ledger_payload_key(tenant_id: &str, conversation_id: &str, event_id: u64) -> String {
    format!("payload/{tenant_id}/{conversation_id}/{event_id}.json.gz")
}

/// Object key for a stored attachment.
pub fn asset_key(tenant_id: &str, asset_id: &str, filename: &str) -> String {
    format!("asset/{tenant_id}/{asset_id}/{filename}")
}
