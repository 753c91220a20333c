//! Managed-device lookups against the device-management API

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::error::FetchError;
use crate::token::AccessToken;
use crate::{Error, Result};

/// Flattened device record: property name → display value, ordered by name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceMetadata {
    fields: BTreeMap<String, String>,
}

impl DeviceMetadata {
    /// Flatten a managed-device JSON object.
    ///
    /// Strings are kept verbatim, `null` becomes an empty string, and other
    /// values (numbers, booleans, nested objects and arrays) are rendered as
    /// compact JSON.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Malformed`] if the value is not an object or
    /// lacks a non-empty `id`; such a record is incomplete and must not be
    /// cached.
    pub fn from_json(value: Value) -> std::result::Result<Self, FetchError> {
        let Value::Object(object) = value else {
            return Err(FetchError::Malformed(
                "device record is not a JSON object".to_string(),
            ));
        };

        let fields: BTreeMap<String, String> = object
            .into_iter()
            .map(|(key, value)| (key, display_value(value)))
            .collect();

        match fields.get("id") {
            Some(id) if !id.is_empty() => Ok(Self { fields }),
            _ => Err(FetchError::Malformed(
                "device record has no id".to_string(),
            )),
        }
    }

    /// Look up one property
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Iterate properties in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of properties
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the record has no properties
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl FromIterator<(String, String)> for DeviceMetadata {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

fn display_value(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Source of managed-device records
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Fetch one device record using `token` for bearer authentication
    async fn managed_device(
        &self,
        token: &AccessToken,
        device_id: &str,
    ) -> std::result::Result<DeviceMetadata, FetchError>;
}

/// Error body returned by the device API
#[derive(Debug, Deserialize)]
struct GraphErrorResponse {
    error: GraphErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GraphErrorDetail {
    code: String,
}

/// Client for `GET {graph_url}/deviceManagement/managedDevices/{id}`
pub struct GraphClient {
    http_client: Client,
    base_url: Url,
}

impl GraphClient {
    /// Create a client rooted at `graph_url` (e.g. `https://graph.microsoft.com/v1.0`)
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `graph_url` cannot be used as a base URL.
    pub fn new(http_client: Client, graph_url: &str) -> Result<Self> {
        let base_url = Url::parse(graph_url)
            .map_err(|e| Error::Config(format!("Invalid Graph URL {graph_url:?}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::Config(format!(
                "Graph URL cannot be a base: {graph_url}"
            )));
        }
        Ok(Self {
            http_client,
            base_url,
        })
    }

    /// URL of one managed device; the id is escaped as a single path segment.
    ///
    /// Dot segments are dropped by URL normalisation, so `.` and `..` must be
    /// rejected before calling this.
    pub fn device_url(&self, device_id: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["deviceManagement", "managedDevices", device_id]);
        }
        url
    }
}

/// Whether `device_id` names one resource below the managed-devices collection
fn is_addressable(device_id: &str) -> bool {
    !matches!(device_id, "" | "." | "..")
}

#[async_trait]
impl DeviceDirectory for GraphClient {
    async fn managed_device(
        &self,
        token: &AccessToken,
        device_id: &str,
    ) -> std::result::Result<DeviceMetadata, FetchError> {
        if !is_addressable(device_id) {
            debug!(device_id, "Device id cannot name a single managed device");
            return Err(FetchError::NotFound(device_id.to_string()));
        }
        let url = self.device_url(device_id);
        debug!(device_id, url = %url, "Fetching managed device");

        let response = self
            .http_client
            .get(url)
            .bearer_auth(token.secret())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout
                } else {
                    FetchError::upstream(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let code = serde_json::from_str::<GraphErrorResponse>(&body)
                .map(|r| r.error.code)
                .ok();
            warn!(device_id, status = status.as_u16(), error_code = ?code, "Device API returned error");
            return Err(classify_status(status, code.as_deref(), device_id));
        }

        let body: Value = response.json().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Malformed(format!("invalid JSON body: {e}"))
            }
        })?;

        DeviceMetadata::from_json(body)
    }
}

/// 404 and 400 mean the device id is unknown to the API; everything else is
/// an upstream failure.
fn classify_status(status: StatusCode, code: Option<&str>, device_id: &str) -> FetchError {
    match status {
        StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST => {
            FetchError::NotFound(device_id.to_owned())
        }
        _ => FetchError::UpstreamError {
            status: Some(status.as_u16()),
            message: match code {
                Some(code) => format!("HTTP {status} ({code})"),
                None => format!("HTTP {status}"),
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn from_json_flattens_scalar_fields() {
        let md = DeviceMetadata::from_json(json!({
            "id": "device-123",
            "model": "Surface",
            "isEncrypted": true,
            "totalStorageSpaceInBytes": 256,
            "notes": null
        }))
        .unwrap();

        assert_eq!(md.get("id"), Some("device-123"));
        assert_eq!(md.get("model"), Some("Surface"));
        assert_eq!(md.get("isEncrypted"), Some("true"));
        assert_eq!(md.get("totalStorageSpaceInBytes"), Some("256"));
        assert_eq!(md.get("notes"), Some(""));
        assert_eq!(md.len(), 5);
    }

    #[test]
    fn from_json_renders_nested_values_as_json() {
        let md = DeviceMetadata::from_json(json!({
            "id": "d",
            "hardwareInformation": {"serialNumber": "SN1"},
            "roleScopeTagIds": ["0", "1"]
        }))
        .unwrap();

        assert_eq!(md.get("hardwareInformation"), Some(r#"{"serialNumber":"SN1"}"#));
        assert_eq!(md.get("roleScopeTagIds"), Some(r#"["0","1"]"#));
    }

    #[test]
    fn fields_iterate_in_name_order() {
        let md = DeviceMetadata::from_json(json!({"model": "x", "id": "d", "a": "1"})).unwrap();
        let keys: Vec<&str> = md.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "id", "model"]);
    }

    #[test]
    fn non_object_is_malformed() {
        assert!(matches!(
            DeviceMetadata::from_json(json!(["id", "d"])),
            Err(FetchError::Malformed(_))
        ));
    }

    #[test]
    fn record_without_id_is_malformed() {
        assert!(matches!(
            DeviceMetadata::from_json(json!({"model": "Surface"})),
            Err(FetchError::Malformed(_))
        ));
        assert!(matches!(
            DeviceMetadata::from_json(json!({"id": ""})),
            Err(FetchError::Malformed(_))
        ));
    }

    #[test]
    fn serializes_as_plain_object() {
        let md: DeviceMetadata = [("id".to_string(), "d".to_string())].into_iter().collect();
        assert_eq!(serde_json::to_value(&md).unwrap(), json!({"id": "d"}));
    }

    #[test]
    fn device_url_appends_escaped_id() {
        let client = GraphClient::new(Client::new(), "https://graph.microsoft.com/v1.0").unwrap();
        assert_eq!(
            client.device_url("device-123").as_str(),
            "https://graph.microsoft.com/v1.0/deviceManagement/managedDevices/device-123"
        );
        assert_eq!(
            client.device_url("../../users").path(),
            "/v1.0/deviceManagement/managedDevices/..%2F..%2Fusers"
        );
    }

    #[test]
    fn dot_segments_are_not_addressable() {
        assert!(!is_addressable(""));
        assert!(!is_addressable("."));
        assert!(!is_addressable(".."));
        assert!(is_addressable("..."));
        assert!(is_addressable("./x"));
        assert!(is_addressable("device-123"));
    }

    #[tokio::test]
    async fn dot_device_ids_are_not_found_without_a_request() {
        // Nothing listens on the discard port; reaching the network would fail
        // with an upstream error instead of NotFound.
        let client = GraphClient::new(Client::new(), "http://127.0.0.1:9/v1.0").unwrap();
        let token = AccessToken::new("token");

        for id in [".", ".."] {
            assert_eq!(
                client.managed_device(&token, id).await,
                Err(FetchError::NotFound(id.to_string()))
            );
        }
    }

    #[test]
    fn invalid_graph_url_is_config_error() {
        assert!(matches!(
            GraphClient::new(Client::new(), "mailto:ops@example.com"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, None, "d"),
            FetchError::NotFound("d".to_string())
        );
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST, None, "d"),
            FetchError::NotFound("d".to_string())
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED, Some("InvalidAuthenticationToken"), "d"),
            FetchError::UpstreamError {
                status: Some(401),
                message: "HTTP 401 Unauthorized (InvalidAuthenticationToken)".to_string(),
            }
        );
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, None, "d"),
            FetchError::UpstreamError { status: Some(503), .. }
        ));
    }
}
