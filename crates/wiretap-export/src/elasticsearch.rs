//! Elasticsearch bulk exporter
//!
//! Sends each batch as one `_bulk` request. Documents are indexed with the
//! transaction id as `_id`, so a batch resent after an ambiguous failure
//! overwrites instead of duplicating.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};
use wiretap_core::config::ElasticsearchSettings;
use wiretap_core::metrics::{add, SharedMetrics};
use wiretap_core::plugins::{ExportPlugin, Plugin, PluginError, PluginInfo, PluginResult};
use wiretap_core::transaction::Transaction;

/// Authentication method
#[derive(Debug, Clone, Default)]
pub enum ElasticsearchAuth {
    #[default]
    None,
    /// Encoded API key, sent as `Authorization: ApiKey <key>`
    ApiKey(String),
    Basic { username: String, password: String },
}

/// Elasticsearch exporter configuration
#[derive(Debug, Clone)]
pub struct ElasticsearchConfig {
    /// Cluster base URL
    pub url: String,

    /// Target index. `%`-patterns are expanded from the transaction
    /// timestamp, e.g. `wiretap-%Y.%m.%d`.
    pub index: String,

    pub auth: ElasticsearchAuth,

    pub headers: HashMap<String, String>,

    pub timeout: Duration,

    pub compression: bool,

    pub user_agent: String,
}

impl From<&ElasticsearchSettings> for ElasticsearchConfig {
    fn from(settings: &ElasticsearchSettings) -> Self {
        let auth = match (&settings.api_key, &settings.username) {
            (Some(key), _) => ElasticsearchAuth::ApiKey(key.clone()),
            (None, Some(username)) => ElasticsearchAuth::Basic {
                username: username.clone(),
                password: settings.password.clone().unwrap_or_default(),
            },
            (None, None) => ElasticsearchAuth::None,
        };
        Self {
            url: settings.url.trim_end_matches('/').to_string(),
            index: settings.index.clone(),
            auth,
            headers: settings.headers.clone(),
            timeout: Duration::from_secs(settings.timeout_secs),
            compression: settings.compression,
            user_agent: format!("wiretap/{}", wiretap_core::SENSOR_VERSION),
        }
    }
}

/// Elasticsearch `_bulk` exporter
pub struct ElasticsearchExporter {
    config: ElasticsearchConfig,
    client: Option<Client>,
    metrics: SharedMetrics,
}

impl ElasticsearchExporter {
    pub fn new(config: ElasticsearchConfig, metrics: SharedMetrics) -> Self {
        Self {
            config,
            client: None,
            metrics,
        }
    }

    fn init_client(&mut self) -> PluginResult<()> {
        let mut builder = Client::builder()
            .timeout(self.config.timeout)
            .user_agent(&self.config.user_agent);

        if self.config.compression {
            builder = builder.gzip(true);
        }

        let client = builder.build().map_err(|e| {
            PluginError::InitializationFailed(format!("Failed to create HTTP client: {}", e))
        })?;

        self.client = Some(client);
        Ok(())
    }

    fn index_for(&self, transaction: &Transaction) -> String {
        if self.config.index.contains('%') {
            transaction.timestamp.format(&self.config.index).to_string()
        } else {
            self.config.index.clone()
        }
    }

    /// NDJSON body: an action line followed by the document, per transaction
    pub fn bulk_body(&self, batch: &[Transaction]) -> PluginResult<String> {
        let mut body = String::new();
        for transaction in batch {
            let action = json!({ "index": { "_index": self.index_for(transaction), "_id": transaction.id } });
            body.push_str(&serde_json::to_string(&action)?);
            body.push('\n');
            body.push_str(&serde_json::to_string(transaction)?);
            body.push('\n');
        }
        Ok(body)
    }

    async fn send(&self, body: String) -> PluginResult<Value> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| PluginError::OperationFailed("Elasticsearch client not initialized".into()))?;

        let mut request = client
            .post(format!("{}/_bulk", self.config.url))
            .header("Content-Type", "application/x-ndjson");

        request = match &self.config.auth {
            ElasticsearchAuth::None => request,
            ElasticsearchAuth::ApiKey(key) => request.header("Authorization", format!("ApiKey {}", key)),
            ElasticsearchAuth::Basic { username, password } => request.basic_auth(username, Some(password)),
        };

        for (key, value) in &self.config.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| PluginError::Unavailable(format!("Network error: {}", e)))?;
        let status = response.status();

        if status.is_success() {
            response
                .json::<Value>()
                .await
                .map_err(|e| PluginError::Unavailable(format!("Unreadable bulk response: {}", e)))
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(classify_status(status, text))
        }
    }
}

/// 5xx and 429 are worth retrying, other 4xx mean the payload is refused
fn classify_status(status: StatusCode, body: String) -> PluginError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        PluginError::Unavailable(format!("Elasticsearch returned {}: {}", status, body))
    } else {
        PluginError::Rejected(format!("Elasticsearch returned {}: {}", status, body))
    }
}

/// Outcome of the per-item part of a bulk response
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BulkItems {
    pub failed: usize,
    /// Items refused because the cluster is overloaded
    pub throttled: usize,
    pub first_error: Option<String>,
}

/// Count item failures in a `_bulk` response
pub fn inspect_bulk_response(response: &Value) -> BulkItems {
    let mut items = BulkItems::default();
    if !response.get("errors").and_then(Value::as_bool).unwrap_or(false) {
        return items;
    }
    for item in response
        .get("items")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let Some(result) = item.as_object().and_then(|o| o.values().next()) else {
            continue;
        };
        let status = result.get("status").and_then(Value::as_u64).unwrap_or(0);
        if let Some(error) = result.get("error") {
            items.failed += 1;
            if status == 429 {
                items.throttled += 1;
            }
            if items.first_error.is_none() {
                items.first_error = Some(error.to_string());
            }
        }
    }
    items
}

impl PluginInfo for ElasticsearchExporter {
    fn name(&self) -> &str {
        "elasticsearch-exporter"
    }

    fn description(&self) -> &str {
        "Indexes transactions through the Elasticsearch bulk API"
    }
}

impl Plugin for ElasticsearchExporter {
    fn init(&mut self) -> PluginResult<()> {
        if !self.config.url.starts_with("http://") && !self.config.url.starts_with("https://") {
            return Err(PluginError::ConfigurationError(format!(
                "Elasticsearch URL must be http(s): {}",
                self.config.url
            )));
        }
        self.init_client()?;
        info!(
            "Elasticsearch exporter initialized: url={}, index={}",
            self.config.url, self.config.index
        );
        Ok(())
    }

    fn shutdown(&mut self) -> PluginResult<()> {
        self.client = None;
        Ok(())
    }
}

#[async_trait]
impl ExportPlugin for ElasticsearchExporter {
    async fn export_batch(&self, batch: &[Transaction]) -> PluginResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let body = self.bulk_body(batch)?;
        let response = self.send(body).await?;

        let items = inspect_bulk_response(&response);
        if items.throttled > 0 {
            // Whole batch goes again; ids make the accepted items idempotent
            return Err(PluginError::Unavailable(format!(
                "{} of {} documents throttled",
                items.throttled,
                batch.len()
            )));
        }
        if items.failed > 0 {
            add(&self.metrics.publish.item_errors, items.failed as u64);
            warn!(
                failed = items.failed,
                total = batch.len(),
                error = items.first_error.as_deref().unwrap_or_default(),
                "Bulk request had rejected documents"
            );
        }
        debug!("Indexed {} transactions", batch.len() - items.failed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use wiretap_core::message::{Message, MessageKind};
    use wiretap_core::metrics::create_metrics;
    use wiretap_core::packet::{Direction, Transport};
    use wiretap_core::transaction::FlowInfo;

    fn transaction() -> Transaction {
        let flow = FlowInfo {
            flow_id: 3,
            transport: Transport::Tcp,
            client: "10.0.0.1:40000".parse::<SocketAddr>().unwrap().into(),
            server: "10.0.0.2:80".parse::<SocketAddr>().unwrap().into(),
        };
        // 2023-11-14T22:13:20Z
        let req = Message::new("http", MessageKind::Request, Direction::ToServer, 1_700_000_000_000_000_000);
        Transaction::no_reply(&flow, req)
    }

    fn exporter(index: &str) -> ElasticsearchExporter {
        let settings = ElasticsearchSettings {
            index: index.to_string(),
            url: "http://es:9200/".to_string(),
            api_key: Some("abc".to_string()),
            ..Default::default()
        };
        ElasticsearchExporter::new(ElasticsearchConfig::from(&settings), create_metrics())
    }

    #[test]
    fn test_config_from_settings() {
        let e = exporter("wiretap");
        assert_eq!(e.config.url, "http://es:9200");
        assert!(matches!(e.config.auth, ElasticsearchAuth::ApiKey(ref k) if k == "abc"));
    }

    #[test]
    fn test_bulk_body_shape() {
        let e = exporter("wiretap-%Y.%m.%d");
        let tx = transaction();
        let body = e.bulk_body(std::slice::from_ref(&tx)).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(body.ends_with('\n'));

        let action: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(action["index"]["_index"], "wiretap-2023.11.14");
        assert_eq!(action["index"]["_id"], tx.id.as_str());

        let doc: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(doc["status"], "no_reply");
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, String::new()).is_retryable());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, String::new()).is_retryable());
        assert!(!classify_status(StatusCode::BAD_REQUEST, String::new()).is_retryable());
        assert!(!classify_status(StatusCode::UNAUTHORIZED, String::new()).is_retryable());
    }

    #[test]
    fn test_bulk_item_errors() {
        let ok = json!({ "errors": false, "items": [{ "index": { "status": 201 } }] });
        assert_eq!(inspect_bulk_response(&ok), BulkItems::default());

        let partial = json!({
            "errors": true,
            "items": [
                { "index": { "status": 201 } },
                { "index": { "status": 400, "error": { "type": "mapper_parsing_exception" } } },
                { "index": { "status": 429, "error": { "type": "es_rejected_execution_exception" } } }
            ]
        });
        let items = inspect_bulk_response(&partial);
        assert_eq!(items.failed, 2);
        assert_eq!(items.throttled, 1);
        assert!(items.first_error.unwrap().contains("mapper_parsing_exception"));
    }

    #[tokio::test]
    async fn test_unreachable_cluster_is_retryable() {
        let settings = ElasticsearchSettings {
            url: "http://127.0.0.1:1".to_string(),
            timeout_secs: 2,
            ..Default::default()
        };
        let mut e = ElasticsearchExporter::new(ElasticsearchConfig::from(&settings), create_metrics());
        e.init().unwrap();
        let err = e.export_batch(&[transaction()]).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
