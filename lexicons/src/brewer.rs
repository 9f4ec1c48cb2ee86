use serde::{Deserialize, Serialize};

use crate::{Datetime, Record};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Brewer {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", rename = "type")]
    pub brewer_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: Datetime,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Record for Brewer {
    const NSID: &'static str = crate::nsid::BREWER;

    fn created_at(&self) -> &Datetime {
        &self.created_at
    }
}
