//! Owner scoping for every read and write.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::entity::{Entity, EntityId};
use super::error::QuantopsError;

/// The tenant that owns a unit of work. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(value: impl Into<String>) -> Result<Self, QuantopsError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(QuantopsError::invalid_input("owner_id must not be empty"));
        }
        Ok(OwnerId(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for OwnerId {
    type Error = QuantopsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        OwnerId::new(value)
    }
}

impl From<OwnerId> for String {
    fn from(value: OwnerId) -> Self {
        value.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolve a lookup for `owner`. A missing entity and a foreign entity
/// produce the same error, so callers cannot probe for other tenants' ids.
pub fn scope_to_owner(
    owner: &OwnerId,
    id: &EntityId,
    found: Option<Entity>,
) -> Result<Entity, QuantopsError> {
    match found {
        Some(entity) if &entity.owner_id == owner => Ok(entity),
        _ => Err(QuantopsError::AccessDenied { id: id.to_string() }),
    }
}
