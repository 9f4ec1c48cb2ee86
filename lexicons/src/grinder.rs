use serde::{Deserialize, Serialize};

use crate::{Datetime, Record};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grinder {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", rename = "type")]
    pub grinder_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub burr_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: Datetime,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Record for Grinder {
    const NSID: &'static str = crate::nsid::GRINDER;

    fn created_at(&self) -> &Datetime {
        &self.created_at
    }
}
