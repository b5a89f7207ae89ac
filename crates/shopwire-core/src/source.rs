use std::borrow::Borrow;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ValidationError;

/// Registered provider name used to key breakers, limiters, caches and reports.
///
/// Names are normalized to lowercase ASCII (`[a-z0-9_-]`), so `"Rainforest"`
/// and `"rainforest"` address the same provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProviderId(Arc<str>);

impl ProviderId {
    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        let normalized = value.trim().to_ascii_lowercase();
        if normalized.is_empty() {
            return Err(ValidationError::EmptyProviderName);
        }

        if let Some((index, ch)) = normalized
            .chars()
            .enumerate()
            .find(|(_, ch)| !(ch.is_ascii_alphanumeric() || *ch == '_' || *ch == '-'))
        {
            return Err(ValidationError::ProviderNameInvalidChar { ch, index });
        }

        Ok(Self(Arc::from(normalized)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Environment-variable friendly form (`price-api` becomes `PRICE_API`).
    pub fn env_key(&self) -> String {
        self.0.replace('-', "_").to_ascii_uppercase()
    }
}

impl Display for ProviderId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ProviderId {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl Borrow<str> for ProviderId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl Serialize for ProviderId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ProviderId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Self::parse(&value).map_err(serde::de::Error::custom)
    }
}
