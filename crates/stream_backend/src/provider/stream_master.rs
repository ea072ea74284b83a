use async_trait::async_trait;
use serde_json::Value;

use crate::{id_to_string, BackendAdapter, BackendError, BackendType, StreamSnapshot};

const UNKNOWN_CHANNEL: &str = "Unknown Channel";

/// Stream Master keeps no session, every call is anonymous.
pub struct StreamMasterBackend {
    server_url: String,
    client: reqwest::Client,
}

impl StreamMasterBackend {
    pub fn new(server_url: &str) -> Result<Self, BackendError> {
        Ok(Self {
            server_url: server_url.to_string(),
            client: super::http_client()?,
        })
    }

    async fn fetch_channel_metrics(&self) -> Result<Value, BackendError> {
        let url = format!("{}/api/statistics/getchannelmetrics", self.server_url);
        let response = self
            .client
            .get(&url)
            .header("accept", "application/json")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BackendError::Status(response.status()));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl BackendAdapter for StreamMasterBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::StreamMaster
    }

    fn stream_url_template(&self) -> String {
        format!("{}/v/0/{{id}}", self.server_url)
    }

    async fn list_active_streams(&self) -> Result<Vec<StreamSnapshot>, BackendError> {
        let metrics = self.fetch_channel_metrics().await?;
        parse_channel_metrics(&metrics)
    }

    async fn switch_to_next(&self, stream_id: &str) -> Result<bool, BackendError> {
        let url = format!("{}/api/streaming/movetonextstream", self.server_url);
        // Channel ids are integers upstream; keep them numeric on the wire when possible
        let channel_id = stream_id
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::from(stream_id));
        let response = self
            .client
            .patch(&url)
            .header("accept", "application/json")
            .json(&serde_json::json!({ "SMChannelId": channel_id }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BackendError::Status(response.status()));
        }
        let result: Value = response.json().await?;
        Ok(switch_succeeded(&result))
    }
}

/// Normalise `/api/statistics/getchannelmetrics`.
///
/// Field names come in both camelCase and PascalCase depending on the server
/// version. Failed channels are not reported.
pub fn parse_channel_metrics(metrics: &Value) -> Result<Vec<StreamSnapshot>, BackendError> {
    let channels = metrics
        .as_array()
        .ok_or_else(|| BackendError::Parse("channel metrics is not an array".to_string()))?;

    let mut snapshots = Vec::with_capacity(channels.len());
    for channel in channels {
        if either(channel, "isFailed", "IsFailed")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            continue;
        }
        let Some(id) = either(channel, "id", "Id").and_then(id_to_string) else {
            log::debug!("Skipping channel without id: {channel}");
            continue;
        };
        let name = either(channel, "name", "Name")
            .and_then(Value::as_str)
            .unwrap_or(UNKNOWN_CHANNEL);
        let clients = either(channel, "clientStreams", "ClientStreams")
            .and_then(Value::as_array)
            .map(|clients| {
                clients
                    .iter()
                    .map(|client| {
                        either(client, "clientUserAgent", "ClientUserAgent")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string()
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        snapshots.push(StreamSnapshot::new(&id, name, clients));
    }
    Ok(snapshots)
}

/// A switch succeeded when the server reports `isError: false` under either casing.
pub fn switch_succeeded(result: &Value) -> bool {
    either(result, "isError", "IsError").and_then(Value::as_bool) == Some(false)
}

fn either<'a>(value: &'a Value, camel: &str, pascal: &str) -> Option<&'a Value> {
    value
        .get(camel)
        .filter(|v| !v.is_null())
        .or_else(|| value.get(pascal))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_channel_metrics_camel_case() {
        let metrics = json!([
            {
                "id": 12,
                "name": "News HD",
                "isFailed": false,
                "clientStreams": [
                    { "clientUserAgent": "VLC/3.0.20" },
                    { "clientUserAgent": "Buffer Watchdog" }
                ]
            },
            {
                "id": 13,
                "name": "Broken",
                "isFailed": true,
                "clientStreams": []
            }
        ]);
        let snapshots = parse_channel_metrics(&metrics).unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].id, "12");
        assert_eq!(snapshots[0].name, "News HD");
        assert!(snapshots[0].has_client("Buffer Watchdog"));
        assert!(snapshots[0].has_client("VLC/3.0.20"));
    }

    #[test]
    fn test_parse_channel_metrics_pascal_case() {
        let metrics = json!([
            {
                "Id": "7",
                "ClientStreams": [{ "ClientUserAgent": "Kodi" }]
            }
        ]);
        let snapshots = parse_channel_metrics(&metrics).unwrap();
        assert_eq!(snapshots[0].id, "7");
        assert_eq!(snapshots[0].name, UNKNOWN_CHANNEL);
        assert_eq!(snapshots[0].clients.len(), 1);
        assert!(snapshots[0].has_client("Kodi"));
    }

    #[test]
    fn test_parse_channel_metrics_rejects_non_array() {
        assert!(matches!(
            parse_channel_metrics(&json!({ "error": "nope" })),
            Err(BackendError::Parse(_))
        ));
    }

    #[test]
    fn test_switch_succeeded() {
        assert!(switch_succeeded(&json!({ "isError": false })));
        assert!(switch_succeeded(&json!({ "IsError": false })));
        assert!(!switch_succeeded(&json!({ "isError": true })));
        assert!(!switch_succeeded(&json!({ "message": "ok" })));
    }
}
