//! Instance source details
//!
//! An instance boots either from an image or from an existing boot volume.
//! The backend encodes this as an object whose `source_type` field selects
//! which of the remaining fields apply.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resource::Value;

#[derive(Debug, Error)]
pub enum SourceDetailsError {
    #[error("invalid source_details: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("source_details must be a map")]
    NotAMap,
}

/// Where an instance boots from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source_type", deny_unknown_fields)]
pub enum InstanceSourceDetails {
    /// Boot from an image; a new boot volume is created
    #[serde(rename = "image")]
    Image {
        image_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        boot_volume_size_in_gbs: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kms_key_id: Option<String>,
    },
    /// Boot from an existing boot volume
    #[serde(rename = "bootVolume")]
    BootVolume { boot_volume_id: String },
}

impl InstanceSourceDetails {
    pub fn source_type(&self) -> &'static str {
        match self {
            Self::Image { .. } => "image",
            Self::BootVolume { .. } => "bootVolume",
        }
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self, SourceDetailsError> {
        Ok(serde_json::from_value(value)?)
    }

    /// Decode from a resource attribute
    pub fn from_value(value: &Value) -> Result<Self, SourceDetailsError> {
        match value {
            Value::Map(_) => Self::from_json(value.to_json()),
            _ => Err(SourceDetailsError::NotAMap),
        }
    }

    /// Encode as a resource attribute
    pub fn to_value(&self) -> Value {
        let json = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        Value::from_json(&json).unwrap_or_else(|| Value::Map(Default::default()))
    }
}
