use serde::{Deserialize, Serialize};

use crate::{AtUri, Datetime, Record};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bean {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub origin: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roast_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Strong reference to the `Roaster` record this bean came from. Absent
    /// when the roaster wasn't recorded, or when it lives on a PDS that has
    /// since gone dark — the reference is never validated at write time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roaster_ref: Option<AtUri>,
    pub created_at: Datetime,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Record for Bean {
    const NSID: &'static str = crate::nsid::BEAN;

    fn created_at(&self) -> &Datetime {
        &self.created_at
    }
}
