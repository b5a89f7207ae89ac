use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{ProviderId, ValidationError};

/// Common product record produced by provider adapters.
///
/// Cached verbatim; the orchestration layer only relies on `source` and `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub id: String,
    pub source: ProviderId,
    pub name: String,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub in_stock: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Provider-specific attributes passed through untouched.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl ProductRecord {
    pub fn new(
        source: ProviderId,
        id: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ValidationError::EmptyProductId);
        }

        Ok(Self {
            id,
            source,
            name: name.into(),
            price: None,
            currency: None,
            in_stock: None,
            url: None,
            image_url: None,
            attributes: BTreeMap::new(),
        })
    }

    pub fn with_price(mut self, price: f64, currency: &str) -> Result<Self, ValidationError> {
        if !price.is_finite() {
            return Err(ValidationError::NonFiniteValue { field: "price" });
        }
        if price < 0.0 {
            return Err(ValidationError::NegativeValue { field: "price" });
        }

        self.price = Some(price);
        self.currency = Some(validate_currency_code(currency)?);
        Ok(self)
    }

    pub fn with_stock(mut self, in_stock: bool) -> Self {
        self.in_stock = Some(in_stock);
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Identity used when merging results from several providers.
    pub fn identity(&self) -> (&str, &str) {
        (self.source.as_str(), self.id.as_str())
    }
}

pub fn validate_currency_code(input: &str) -> Result<String, ValidationError> {
    let normalized = input.trim().to_ascii_uppercase();
    let is_valid = normalized.len() == 3 && normalized.chars().all(|ch| ch.is_ascii_alphabetic());

    if !is_valid {
        return Err(ValidationError::InvalidCurrency {
            value: input.to_owned(),
        });
    }

    Ok(normalized)
}
