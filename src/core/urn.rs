// src/core/urn.rs

//! The URN identifier library.
//!
//! Every item ingested by the engine is identified by a Uniform Resource
//! Name of the shape `v2e::<provider>::<type>::<atomic_id>`. URNs are the
//! atomic keys for checkpoints and the resume points for crash recovery,
//! so parsing and formatting must be total inverses of each other and
//! equality must be byte-exact.

use crate::core::UeeError;
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// The fixed scheme prefix of every engine URN.
pub const URN_SCHEME: &str = "v2e";

/// The segment separator. The atomic id may contain any printable ASCII
/// except this sequence.
const SEPARATOR: &str = "::";

/// A parsed, validated URN.
///
/// Fields are private: a constructed `Urn` is always well-formed, which is
/// what lets `format` and `parse` round-trip without re-validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Urn {
    provider: String,
    item_type: String,
    atomic_id: String,
}

impl Urn {
    /// Constructs a URN from its parts, validating each segment.
    pub fn new(
        provider: impl Into<String>,
        item_type: impl Into<String>,
        atomic_id: impl Into<String>,
    ) -> Result<Self, UeeError> {
        let urn = Self {
            provider: provider.into(),
            item_type: item_type.into(),
            atomic_id: atomic_id.into(),
        };
        urn.validate()?;
        Ok(urn)
    }

    /// Parses a URN string of the shape `v2e::<provider>::<type>::<atomic_id>`.
    pub fn parse(input: &str) -> Result<Self, UeeError> {
        let mut segments = input.splitn(4, SEPARATOR);

        let scheme = segments.next().unwrap_or_default();
        if scheme != URN_SCHEME {
            return Err(UeeError::UrnParse(format!(
                "expected scheme '{URN_SCHEME}', got '{scheme}'"
            )));
        }

        let provider = segments
            .next()
            .ok_or_else(|| UeeError::UrnParse("missing provider segment".to_string()))?;
        let item_type = segments
            .next()
            .ok_or_else(|| UeeError::UrnParse("missing type segment".to_string()))?;
        let atomic_id = segments
            .next()
            .ok_or_else(|| UeeError::UrnParse("missing atomic id segment".to_string()))?;

        Self::new(provider, item_type, atomic_id)
    }

    /// Returns true when `input` parses as a well-formed URN.
    pub fn is_valid(input: &str) -> bool {
        Self::parse(input).is_ok()
    }

    /// The canonical byte string for map/KV keys. Identical to the
    /// `Display` form; kept as a separate operation so call sites that
    /// need a key read as such.
    pub fn key(&self) -> String {
        self.to_string()
    }

    /// The provider segment, e.g. `nvd`.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// The item type segment, e.g. `cve`.
    pub fn item_type(&self) -> &str {
        &self.item_type
    }

    /// The atomic identifier segment, e.g. `CVE-2024-0001`.
    pub fn atomic_id(&self) -> &str {
        &self.atomic_id
    }

    fn validate(&self) -> Result<(), UeeError> {
        validate_label("provider", &self.provider)?;
        validate_label("type", &self.item_type)?;

        if self.atomic_id.is_empty() {
            return Err(UeeError::UrnParse("atomic id is empty".to_string()));
        }
        if self.atomic_id.contains(SEPARATOR) {
            return Err(UeeError::UrnParse(format!(
                "atomic id '{}' contains the '{SEPARATOR}' separator",
                self.atomic_id
            )));
        }
        if let Some(bad) = self
            .atomic_id
            .chars()
            .find(|c| !c.is_ascii() || c.is_ascii_control())
        {
            return Err(UeeError::UrnParse(format!(
                "atomic id contains non-printable or non-ASCII character {bad:?}"
            )));
        }
        Ok(())
    }
}

/// Provider and type segments are lowercase identifiers: `[a-z0-9_]+`.
fn validate_label(name: &str, value: &str) -> Result<(), UeeError> {
    if value.is_empty() {
        return Err(UeeError::UrnParse(format!("{name} segment is empty")));
    }
    if let Some(bad) = value
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_'))
    {
        return Err(UeeError::UrnParse(format!(
            "{name} segment '{value}' contains invalid character {bad:?} (must be lowercase [a-z0-9_])"
        )));
    }
    Ok(())
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{URN_SCHEME}{SEPARATOR}{}{SEPARATOR}{}{SEPARATOR}{}",
            self.provider, self.item_type, self.atomic_id
        )
    }
}

impl FromStr for Urn {
    type Err = UeeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// URNs serialize as their canonical string form so durable records stay
// human-readable and the round-trip invariant carries through serde.

impl Serialize for Urn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Urn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct UrnVisitor;

        impl Visitor<'_> for UrnVisitor {
            type Value = Urn;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a URN string of the form v2e::<provider>::<type>::<id>")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Urn, E> {
                Urn::parse(v).map_err(|e| E::custom(e.to_string()))
            }
        }

        deserializer.deserialize_str(UrnVisitor)
    }
}
