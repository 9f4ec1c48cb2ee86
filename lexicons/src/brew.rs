use serde::{Deserialize, Serialize};

use crate::{AtUri, Datetime, Record};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pour {
    pub number: u32,
    pub water: f64,
    pub seconds: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Brew {
    pub bean_ref: AtUri,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grinder_ref: Option<AtUri>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brewer_ref: Option<AtUri>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub water_amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coffee_amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grind_size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_seconds: Option<u32>,
    /// `0..=10` inclusive. Validated by [`Brew::validate`], not by serde.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasting_notes: Option<String>,
    /// A missing list and an empty list are equivalent; the codec never
    /// distinguishes them so we normalize to `None` on empty at write time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pours: Option<Vec<Pour>>,
    pub created_at: Datetime,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum BrewValidationError {
    #[error("rating {0} out of range 0..=10")]
    RatingOutOfRange(u8),
    #[error("pour {index} has non-contiguous number {number}, expected {expected}")]
    NonContiguousPours {
        index: usize,
        number: u32,
        expected: u32,
    },
}

impl Brew {
    /// Checks the invariants the spec calls out: rating bounds and pour
    /// numbering contiguity. Ordering within `pours` is preserved as given.
    pub fn validate(&self) -> Result<(), BrewValidationError> {
        if let Some(rating) = self.rating {
            if rating > 10 {
                return Err(BrewValidationError::RatingOutOfRange(rating));
            }
        }
        if let Some(pours) = &self.pours {
            for (index, pour) in pours.iter().enumerate() {
                let expected = index as u32 + 1;
                if pour.number != expected {
                    return Err(BrewValidationError::NonContiguousPours {
                        index,
                        number: pour.number,
                        expected,
                    });
                }
            }
        }
        Ok(())
    }
}

impl Record for Brew {
    const NSID: &'static str = crate::nsid::BREW;

    fn created_at(&self) -> &Datetime {
        &self.created_at
    }
}
