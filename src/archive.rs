//! Handoff of captured files to remote object storage.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tracing::{info, warn};

use crate::config::ArchiveConfig;

const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Persists captured files remotely. The extractor keeps no reference after `store`.
#[async_trait]
pub trait ArchiveSink: Send + Sync {
    /// Store `bytes` and return the object key
    async fn store(
        &self,
        month_slug: &str,
        filename: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String>;
}

/// Content type inferred from the file extension
pub fn content_type_for(filename: &str) -> &'static str {
    let name = filename.to_lowercase();
    if name.ends_with(".csv") {
        "text/csv"
    } else if name.ends_with(".pdf") {
        "application/pdf"
    } else if name.ends_with(".xlsx") || name.ends_with(".xls") {
        XLSX_MIME
    } else {
        "application/octet-stream"
    }
}

/// `{namespace}/{month_slug}/{filename}`
pub fn object_key(namespace: &str, month_slug: &str, filename: &str) -> String {
    let namespace = namespace.trim_matches('/');
    if namespace.is_empty() {
        format!("{}/{}", month_slug, filename)
    } else {
        format!("{}/{}/{}", namespace, month_slug, filename)
    }
}

/// Store a file with its inferred content type
pub async fn archive_file(
    sink: &dyn ArchiveSink,
    month_slug: &str,
    filename: &str,
    bytes: &[u8],
) -> Result<String> {
    sink.store(month_slug, filename, bytes, content_type_for(filename))
        .await
}

/// Supabase Storage REST upload
pub struct SupabaseStorage {
    client: Client,
    base_url: String,
    service_key: SecretString,
    bucket: String,
    namespace: String,
}

impl SupabaseStorage {
    pub fn new(
        base_url: impl Into<String>,
        service_key: SecretString,
        bucket: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(UPLOAD_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            service_key,
            bucket: bucket.into(),
            namespace: namespace.into(),
        })
    }

    /// Report storage; `None` when archiving is disabled or the endpoint is not configured
    pub fn from_config(config: &ArchiveConfig) -> Result<Option<Self>> {
        Self::configured(config, &config.bucket, &config.namespace)
    }

    /// Invoice PDF storage, same endpoint with its own bucket and namespace
    pub fn invoices_from_config(config: &ArchiveConfig) -> Result<Option<Self>> {
        Self::configured(config, &config.invoice_bucket, &config.invoice_namespace)
    }

    fn configured(config: &ArchiveConfig, bucket: &str, namespace: &str) -> Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        let (Some(url), Some(key)) = (&config.url, &config.service_key) else {
            warn!("Archive enabled but SUPABASE_URL / SUPABASE_SERVICE_KEY missing, skipping uploads");
            return Ok(None);
        };
        let storage = Self::new(
            url.clone(),
            SecretString::from(key.clone()),
            bucket,
            namespace,
        )?;
        Ok(Some(storage))
    }

    fn object_url(&self, key: &str) -> String {
        let encoded: Vec<String> = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!(
            "{}/storage/v1/object/{}/{}",
            self.base_url.trim_end_matches('/'),
            urlencoding::encode(&self.bucket),
            encoded.join("/")
        )
    }
}

#[async_trait]
impl ArchiveSink for SupabaseStorage {
    async fn store(
        &self,
        month_slug: &str,
        filename: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String> {
        let key = object_key(&self.namespace, month_slug, filename);
        let url = self.object_url(&key);

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.service_key.expose_secret())
            .header("Content-Type", content_type)
            .header("x-upsert", "true")
            .body(bytes.to_vec())
            .send()
            .await
            .context("Storage upload request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Storage upload failed ({status}): {body}");
        }

        info!("Archived {} ({} bytes)", key, bytes.len());
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_bytes, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn storage(url: &str) -> SupabaseStorage {
        SupabaseStorage::new(
            url,
            SecretString::from("service-key".to_string()),
            "polaroo",
            "polaroo/raw",
        )
        .unwrap()
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("export_20240501T100000Z.csv"), "text/csv");
        assert_eq!(content_type_for("REPORT.XLSX"), XLSX_MIME);
        assert_eq!(content_type_for("old.xls"), XLSX_MIME);
        assert_eq!(content_type_for("factura.PDF"), "application/pdf");
        assert_eq!(content_type_for("notes.txt"), "application/octet-stream");
    }

    #[test]
    fn test_object_key() {
        assert_eq!(
            object_key("polaroo/raw", "2024-05", "export.csv"),
            "polaroo/raw/2024-05/export.csv"
        );
        assert_eq!(object_key("/", "2024-05", "a.csv"), "2024-05/a.csv");
    }

    #[test]
    fn test_object_url_encodes_segments() {
        let storage = storage("https://x.supabase.co/");
        assert_eq!(
            storage.object_url("polaroo/raw/2024-05/Informe mayo.xlsx"),
            "https://x.supabase.co/storage/v1/object/polaroo/polaroo/raw/2024-05/Informe%20mayo.xlsx"
        );
    }

    #[tokio::test]
    async fn store_posts_with_upsert_and_bearer() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/storage/v1/object/polaroo/polaroo/raw/2024-05/export.csv"))
            .and(header("authorization", "Bearer service-key"))
            .and(header("content-type", "text/csv"))
            .and(header("x-upsert", "true"))
            .and(body_bytes(b"a,b\n1,2\n".to_vec()))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Key": "polaroo/polaroo/raw/2024-05/export.csv"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let key = archive_file(&storage(&server.uri()), "2024-05", "export.csv", b"a,b\n1,2\n").await?;
        assert_eq!(key, "polaroo/raw/2024-05/export.csv");
        Ok(())
    }

    #[tokio::test]
    async fn invoices_go_to_their_own_bucket() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/storage/v1/object/polaroo_pdfs/invoices/2024-05/factura_20240501T100000Z.pdf"))
            .and(header("content-type", "application/pdf"))
            .and(header("x-upsert", "true"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let config = ArchiveConfig {
            url: Some(server.uri()),
            service_key: Some("service-key".to_string()),
            ..Default::default()
        };
        let invoices = SupabaseStorage::invoices_from_config(&config)?.unwrap();
        let key = archive_file(&invoices, "2024-05", "factura_20240501T100000Z.pdf", b"%PDF").await?;
        assert_eq!(key, "invoices/2024-05/factura_20240501T100000Z.pdf");
        Ok(())
    }

    #[tokio::test]
    async fn store_surfaces_http_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("invalid key"))
            .mount(&server)
            .await;

        let err = storage(&server.uri())
            .store("2024-05", "a.csv", b"x", "text/csv")
            .await
            .unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("403"));
        assert!(message.contains("invalid key"));
    }

    #[test]
    fn test_from_config_requires_endpoint() {
        let mut config = ArchiveConfig::default();
        assert!(SupabaseStorage::from_config(&config).unwrap().is_none());

        config.url = Some("https://x.supabase.co".to_string());
        config.service_key = Some("k".to_string());
        assert!(SupabaseStorage::from_config(&config).unwrap().is_some());
        assert!(SupabaseStorage::invoices_from_config(&config).unwrap().is_some());

        config.enabled = false;
        assert!(SupabaseStorage::from_config(&config).unwrap().is_none());
        assert!(SupabaseStorage::invoices_from_config(&config).unwrap().is_none());
    }
}
