//! S3-compatible backend (AWS S3 or MinIO, path-style addressing).
//!
//! Signs requests with SigV4 directly; presigned downloads use the
//! query-string variant so clients need no credentials.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::debug;

use maestro_core::config::ObjectStoreConfig;

use crate::error::{Result, StorageError};
use crate::port::ObjectStore;

type HmacSha256 = Hmac<Sha256>;

const SERVICE: &str = "s3";
const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

#[derive(Debug)]
pub struct S3ObjectStore {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
    region: String,
    access_key: String,
    secret_key: String,
}

impl S3ObjectStore {
    pub fn from_config(config: &ObjectStoreConfig) -> Result<Self> {
        let bucket = config
            .bucket
            .clone()
            .ok_or_else(|| StorageError::Config("object_store.bucket is required".into()))?;
        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://s3.{}.amazonaws.com", config.region));
        let access_key = config
            .access_key
            .clone()
            .ok_or_else(|| StorageError::Config("object_store.access_key is required".into()))?;
        let secret_key = config
            .secret_key
            .clone()
            .ok_or_else(|| StorageError::Config("object_store.secret_key is required".into()))?;
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            bucket,
            region: config.region.clone(),
            access_key,
            secret_key,
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key)
    }

    fn canonical_path(&self, key: &str) -> String {
        format!("/{}/{}", self.bucket, key)
    }

    fn host(&self) -> String {
        self.endpoint
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .to_string()
    }

    /// Authorization header for a server-side request.
    fn sign_request(
        &self,
        method: &str,
        key: &str,
        payload_hash: &str,
        amz_date: &str,
    ) -> String {
        let date = &amz_date[..8];
        let canonical_headers = format!(
            "host:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n",
            self.host(),
            payload_hash,
            amz_date
        );
        let signed_headers = "host;x-amz-content-sha256;x-amz-date";
        let canonical_request = format!(
            "{method}\n{}\n\n{canonical_headers}\n{signed_headers}\n{payload_hash}",
            self.canonical_path(key)
        );
        let scope = format!("{date}/{}/{SERVICE}/aws4_request", self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            sha256_hex(canonical_request.as_bytes())
        );
        let signature = hex::encode(hmac_chain(&self.secret_key, date, &self.region, &string_to_sign));
        format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.access_key
        )
    }

    async fn send(
        &self,
        method: reqwest::Method,
        key: &str,
        body: Option<(Vec<u8>, &str)>,
    ) -> Result<reqwest::Response> {
        let amz_date = amz_timestamp();
        let payload_hash = match &body {
            Some((bytes, _)) => sha256_hex(bytes),
            None => sha256_hex(b""),
        };
        let auth = self.sign_request(method.as_str(), key, &payload_hash, &amz_date);

        let mut req = self
            .client
            .request(method, self.object_url(key))
            .header("authorization", auth)
            .header("x-amz-content-sha256", payload_hash)
            .header("x-amz-date", amz_date);
        if let Some((bytes, mime)) = body {
            req = req.header("content-type", mime).body(bytes);
        }
        Ok(req.send().await?)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn name(&self) -> &str {
        "s3"
    }

    async fn put_object(&self, key: &str, bytes: Vec<u8>, mime_type: &str) -> Result<()> {
        let resp = self
            .send(reqwest::Method::PUT, key, Some((bytes, mime_type)))
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(StorageError::Backend(format!("PUT {key}: {status}: {text}")));
        }
        debug!(key, "object stored");
        Ok(())
    }

    async fn get_object_bytes(&self, key: &str) -> Result<Vec<u8>> {
        let resp = self.send(reqwest::Method::GET, key, None).await?;
        if resp.status().as_u16() == 404 {
            return Err(StorageError::NotFound {
                key: key.to_string(),
            });
        }
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(StorageError::Backend(format!("GET {key}: {status}")));
        }
        Ok(resp.bytes().await?.to_vec())
    }

    async fn get_presigned_download(&self, key: &str, ttl: Duration) -> Result<String> {
        let amz_date = amz_timestamp();
        let date = &amz_date[..8];
        let scope = format!("{date}/{}/{SERVICE}/aws4_request", self.region);
        let credential = format!("{}/{scope}", self.access_key).replace('/', "%2F");
        let query = format!(
            "X-Amz-Algorithm=AWS4-HMAC-SHA256&X-Amz-Credential={credential}\
             &X-Amz-Date={amz_date}&X-Amz-Expires={}&X-Amz-SignedHeaders=host",
            ttl.as_secs()
        );
        let canonical_headers = format!("host:{}\n", self.host());
        let canonical_request = format!(
            "GET\n{}\n{query}\n{canonical_headers}\nhost\n{UNSIGNED_PAYLOAD}",
            self.canonical_path(key)
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            sha256_hex(canonical_request.as_bytes())
        );
        let signature = hex::encode(hmac_chain(&self.secret_key, date, &self.region, &string_to_sign));
        Ok(format!(
            "{}?{query}&X-Amz-Signature={signature}",
            self.object_url(key)
        ))
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let resp = self.send(reqwest::Method::DELETE, key, None).await?;
        // 404 is fine: deletes are idempotent
        if !resp.status().is_success() && resp.status().as_u16() != 404 {
            let status = resp.status();
            return Err(StorageError::Backend(format!("DELETE {key}: {status}")));
        }
        Ok(())
    }
}

fn amz_timestamp() -> String {
    chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string()
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn hmac_raw(key: &[u8], data: &str) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// SigV4 key derivation: secret → date → region → service → request.
fn hmac_chain(secret: &str, date: &str, region: &str, string_to_sign: &str) -> Vec<u8> {
    let k_date = hmac_raw(format!("AWS4{secret}").as_bytes(), date);
    let k_region = hmac_raw(&k_date, region);
    let k_service = hmac_raw(&k_region, SERVICE);
    let k_signing = hmac_raw(&k_service, "aws4_request");
    hmac_raw(&k_signing, string_to_sign)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> S3ObjectStore {
        S3ObjectStore::from_config(&ObjectStoreConfig {
            provider: maestro_core::config::ObjectStoreProvider::Minio,
            bucket: Some("maestro".into()),
            endpoint: Some("http://127.0.0.1:9000".into()),
            region: "us-east-1".into(),
            access_key: Some("minioadmin".into()),
            secret_key: Some("minioadmin".into()),
        })
        .unwrap()
    }

    #[test]
    fn urls_are_path_style() {
        let s = store();
        assert_eq!(
            s.object_url("payload/t/c/1.json.gz"),
            "http://127.0.0.1:9000/maestro/payload/t/c/1.json.gz"
        );
        assert_eq!(s.host(), "127.0.0.1:9000");
    }

    #[test]
    fn missing_credentials_fail_configuration() {
        let err = S3ObjectStore::from_config(&ObjectStoreConfig {
            provider: maestro_core::config::ObjectStoreProvider::S3,
            bucket: Some("maestro".into()),
            endpoint: None,
            region: "us-east-1".into(),
            access_key: None,
            secret_key: None,
        })
        .unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
    }

    #[tokio::test]
    async fn presigned_url_carries_sigv4_query() {
        let s = store();
        let url = s
            .get_presigned_download("asset/t/a/f.png", Duration::from_secs(900))
            .await
            .unwrap();
        assert!(url.contains("X-Amz-Algorithm=AWS4-HMAC-SHA256"));
        assert!(url.contains("X-Amz-Expires=900"));
        assert!(url.contains("X-Amz-Signature="));
    }
}
