use super::{AttachmentUpload, Backend, BackendError, RemoteAttachment};
use crate::config::BackendConfig;
use crate::error::AppError;
use crate::services::normalize;
use base64::Engine;
use serde_json::{json, Value};
use std::time::Duration;

const USER_AGENT: &str = concat!("lbw-inspect/", env!("CARGO_PKG_VERSION"));

/// REST client for the table API (`/tables/{table}/records`)
pub struct RestBackend {
    client: reqwest::Client,
    config: BackendConfig,
}

impl RestBackend {
    pub fn new(config: BackendConfig) -> Result<Self, AppError> {
        if config.base_url.trim().is_empty() {
            return Err(AppError::Config("backend.base_url is not set".to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .tcp_keepalive(Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| AppError::Config(format!("Client build failed: {}", e)))?;

        Ok(Self { client, config })
    }

    fn records_url(&self, table: &str) -> String {
        format!(
            "{}/tables/{}/records",
            self.config.base_url.trim_end_matches('/'),
            table
        )
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header("Accept", "application/json");
        match &self.config.access_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<Value, BackendError> {
        let response = builder.send().await.map_err(classify)?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status.as_u16(), body));
        }

        let text = response.text().await.map_err(classify)?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| BackendError::Transient(format!("Failed to parse response: {}", e)))
    }

    fn key_filter(key: &str, id: &str) -> String {
        format!("{}={}", key, id.replace('\'', "''"))
    }
}

fn classify(e: reqwest::Error) -> BackendError {
    if e.is_connect() {
        BackendError::Offline(e.to_string())
    } else if e.is_timeout() {
        BackendError::Transient(format!("Timeout: {}", e))
    } else if let Some(status) = e.status() {
        BackendError::from_status(status.as_u16(), e.to_string())
    } else {
        BackendError::Transient(e.to_string())
    }
}

impl Backend for RestBackend {
    async fn create_visual(&self, payload: &Value) -> Result<String, BackendError> {
        let url = format!("{}?response=rows", self.records_url(&self.config.visual_table));
        let body = self
            .send(self.request(reqwest::Method::POST, &url).json(payload))
            .await?;
        normalize::extract_record_id(&body, normalize::visual_id_names()).ok_or_else(|| {
            BackendError::Transient("Create response carried no record id".to_string())
        })
    }

    async fn update_visual(&self, visual_id: &str, payload: &Value) -> Result<(), BackendError> {
        let url = self.records_url(&self.config.visual_table);
        let filter = Self::key_filter(&self.config.visual_key, visual_id);
        self.send(
            self.request(reqwest::Method::PUT, &url)
                .query(&[("q.where", filter)])
                .json(payload),
        )
        .await?;
        Ok(())
    }

    async fn delete_visual(&self, visual_id: &str) -> Result<(), BackendError> {
        let url = self.records_url(&self.config.visual_table);
        let filter = Self::key_filter(&self.config.visual_key, visual_id);
        match self
            .send(self.request(reqwest::Method::DELETE, &url).query(&[("q.where", filter)]))
            .await
        {
            // Already gone counts as deleted
            Err(BackendError::Rejected { status: 404 | 410, .. }) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn upload_attachment(
        &self,
        upload: &AttachmentUpload,
    ) -> Result<RemoteAttachment, BackendError> {
        let url = format!(
            "{}?response=rows",
            self.records_url(&self.config.attachment_table)
        );
        let body = json!({
            "LBWID": upload.owner_id,
            "Annotation": upload.caption,
            "Drawings": upload.drawings,
            "FileName": upload.file_name,
            "ContentHash": upload.content_hash,
            "ClientRef": upload.client_ref,
            "Attachment": base64::engine::general_purpose::STANDARD.encode(&upload.bytes),
        });
        let response = self
            .send(self.request(reqwest::Method::POST, &url).json(&body))
            .await?;

        let records = normalize::records_of(&response);
        let record = records.first().ok_or_else(|| {
            BackendError::Transient("Upload response carried no record".to_string())
        })?;
        let attachment = normalize::normalize_attachment(record)
            .map_err(|e| BackendError::Transient(e.to_string()))?;

        Ok(RemoteAttachment {
            file_key: attachment
                .photo
                .unwrap_or_else(|| format!("{}/{}", attachment.attach_id, upload.file_name)),
            record_id: attachment.attach_id,
        })
    }

    async fn update_attachment(&self, record_id: &str, payload: &Value) -> Result<(), BackendError> {
        let url = self.records_url(&self.config.attachment_table);
        let filter = Self::key_filter(&self.config.attachment_key, record_id);
        // Stored under the server's column name for captions
        let body = json!({
            "Annotation": payload.get("Caption").cloned().unwrap_or(Value::Null),
            "Drawings": payload.get("Drawings").cloned().unwrap_or(Value::Null),
        });
        self.send(
            self.request(reqwest::Method::PUT, &url)
                .query(&[("q.where", filter)])
                .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn delete_attachment(&self, record_id: &str) -> Result<(), BackendError> {
        let url = self.records_url(&self.config.attachment_table);
        let filter = Self::key_filter(&self.config.attachment_key, record_id);
        match self
            .send(self.request(reqwest::Method::DELETE, &url).query(&[("q.where", filter)]))
            .await
        {
            Err(BackendError::Rejected { status: 404 | 410, .. }) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn list_visuals(&self, service_id: &str) -> Result<Vec<Value>, BackendError> {
        let url = self.records_url(&self.config.visual_table);
        let filter = format!("ServiceID='{}'", service_id.replace('\'', "''"));
        let body = self
            .send(self.request(reqwest::Method::GET, &url).query(&[("q.where", filter)]))
            .await?;
        Ok(normalize::records_of(&body))
    }

    async fn find_visual_by_client_ref(&self, client_ref: &str) -> Result<Option<Value>, BackendError> {
        let url = self.records_url(&self.config.visual_table);
        let filter = format!("ClientRef='{}'", client_ref.replace('\'', "''"));
        let body = self
            .send(self.request(reqwest::Method::GET, &url).query(&[("q.where", filter)]))
            .await?;
        Ok(normalize::records_of(&body).into_iter().next())
    }

    async fn photo_url(&self, file_key: &str) -> Result<String, BackendError> {
        if file_key.starts_with("http://") || file_key.starts_with("https://") {
            return Ok(file_key.to_string());
        }
        Ok(format!(
            "{}/files/{}",
            self.config.base_url.trim_end_matches('/'),
            file_key.trim_start_matches('/')
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> RestBackend {
        RestBackend::new(BackendConfig {
            base_url: "https://api.example.test/rest/v2/".to_string(),
            ..BackendConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_requires_base_url() {
        assert!(RestBackend::new(BackendConfig::default()).is_err());
    }

    #[test]
    fn test_records_url() {
        assert_eq!(
            backend().records_url("LPS_Services_LBW"),
            "https://api.example.test/rest/v2/tables/LPS_Services_LBW/records"
        );
    }

    #[tokio::test]
    async fn test_photo_url() {
        let b = backend();
        assert_eq!(
            b.photo_url("/9/beam.jpg").await.unwrap(),
            "https://api.example.test/rest/v2/files/9/beam.jpg"
        );
        assert_eq!(
            b.photo_url("https://cdn.example.test/x.jpg").await.unwrap(),
            "https://cdn.example.test/x.jpg"
        );
    }
}
