//! Wire codec for stored resources.
//!
//! The store keeps `spec.options`, `status.response`, and `status.error` as
//! JSON-encoded strings inside an otherwise flat document. This module is the
//! only place that encodes or decodes those strings; everything above it works
//! with [`Resource`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::resource::{Resource, ResourceKey, ResourceStatus};

/// Resource metadata as stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMetadata {
    /// Resource name.
    pub name: String,
    /// Opaque version token.
    #[serde(default)]
    pub resource_version: String,
    /// Labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// `spec` block as stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireSpec {
    /// JSON-encoded request options.
    #[serde(default)]
    pub options: String,
}

/// `status` block as stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireStatus {
    /// Plain state string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// JSON-encoded response payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    /// JSON-encoded error payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Plain operation name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<String>,
}

/// A resource document exactly as the store holds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireResource {
    /// API group.
    pub group: String,
    /// Resource type.
    pub resource_type: String,
    /// Metadata.
    pub metadata: WireMetadata,
    /// Spec.
    #[serde(default)]
    pub spec: WireSpec,
    /// Status.
    #[serde(default)]
    pub status: WireStatus,
}

impl WireResource {
    /// Returns the resource key of this document.
    #[must_use]
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.group, &self.resource_type, &self.metadata.name)
    }
}

/// Encodes a decoded resource into its stored form.
///
/// # Errors
///
/// Returns a serialization error if any embedded JSON field cannot be encoded.
pub fn encode(resource: &Resource) -> Result<WireResource> {
    Ok(WireResource {
        group: resource.key.group.clone(),
        resource_type: resource.key.resource_type.clone(),
        metadata: WireMetadata {
            name: resource.key.id.clone(),
            resource_version: resource.resource_version.clone(),
            labels: resource.labels.clone(),
            annotations: resource.annotations.clone(),
        },
        spec: WireSpec {
            options: encode_field(&resource.options)?,
        },
        status: encode_status(&resource.status)?,
    })
}

/// Decodes a stored document into the domain view.
///
/// An empty `spec.options` string decodes to JSON `null`.
///
/// # Errors
///
/// Returns a serialization error if an embedded JSON field is malformed.
pub fn decode(wire: WireResource) -> Result<Resource> {
    let key = wire.key();
    let options = decode_field(&key, "spec.options", &wire.spec.options)?;
    let response = wire
        .status
        .response
        .as_deref()
        .map(|raw| decode_field(&key, "status.response", raw))
        .transpose()?;
    let error = wire
        .status
        .error
        .as_deref()
        .map(|raw| decode_field(&key, "status.error", raw))
        .transpose()?;

    Ok(Resource {
        key,
        resource_version: wire.metadata.resource_version,
        labels: wire.metadata.labels,
        annotations: wire.metadata.annotations,
        options,
        status: ResourceStatus {
            state: wire.status.state,
            response,
            error,
            last_operation: wire.status.last_operation,
        },
    })
}

/// Encodes a decoded status block into its stored form.
///
/// # Errors
///
/// Returns a serialization error if the response or error cannot be encoded.
pub fn encode_status(status: &ResourceStatus) -> Result<WireStatus> {
    Ok(WireStatus {
        state: status.state.clone(),
        response: status.response.as_ref().map(encode_field).transpose()?,
        error: status.error.as_ref().map(encode_field).transpose()?,
        last_operation: status.last_operation.clone(),
    })
}

/// Encodes a JSON value as an embedded string field.
///
/// # Errors
///
/// Returns a serialization error if the value cannot be encoded.
pub fn encode_field(value: &Value) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::Serialization {
        message: format!("encode embedded field: {e}"),
    })
}

fn decode_field(key: &ResourceKey, field: &str, raw: &str) -> Result<Value> {
    if raw.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(raw).map_err(|e| Error::Serialization {
        message: format!("decode {field} of {key}: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn options_are_stored_as_json_strings() {
        let resource = Resource {
            key: ResourceKey::new("backup.hangar.io", "defaultbackups", "b1"),
            resource_version: "7".into(),
            labels: BTreeMap::from([("state".to_string(), "in_queue".to_string())]),
            annotations: BTreeMap::new(),
            options: json!({"guid": "b1", "type": "online"}),
            status: ResourceStatus {
                state: Some("in_queue".into()),
                error: Some(json!({"code": 500})),
                ..ResourceStatus::default()
            },
        };

        let wire = encode(&resource).expect("encode");
        let document = serde_json::to_value(&wire).expect("to_value");
        assert!(document["spec"]["options"].is_string());
        assert_eq!(document["status"]["error"], json!("{\"code\":500}"));
        assert_eq!(document["metadata"]["resourceVersion"], json!("7"));

        assert_eq!(decode(wire).expect("decode"), resource);
    }

    #[test]
    fn empty_options_decode_to_null() {
        let wire = WireResource {
            group: "g".into(),
            resource_type: "t".into(),
            metadata: WireMetadata {
                name: "x".into(),
                ..WireMetadata::default()
            },
            spec: WireSpec::default(),
            status: WireStatus::default(),
        };
        let resource = decode(wire).expect("decode");
        assert_eq!(resource.options, Value::Null);
        assert_eq!(resource.key.to_string(), "g/t/x");
    }

    #[test]
    fn malformed_embedded_json_names_the_field() {
        let wire = WireResource {
            group: "g".into(),
            resource_type: "t".into(),
            metadata: WireMetadata {
                name: "x".into(),
                ..WireMetadata::default()
            },
            spec: WireSpec {
                options: "{not json".into(),
            },
            status: WireStatus::default(),
        };
        let err = decode(wire).expect_err("should fail");
        assert!(err.to_string().contains("spec.options"));
    }
}
