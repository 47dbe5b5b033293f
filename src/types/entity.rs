use crate::types::conversions::string_to_address;
use crate::types::slot::Scope;
use ethers::types::Address;
use serde::{Deserialize, Serialize};

/// Largest decimals value for which `10^decimals` still fits in a U256.
pub const MAX_DECIMALS: u8 = 77;
const MAX_SYMBOL_LEN: usize = 32;
const MAX_NAME_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidEntityError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Zero address is not a valid entity")]
    ZeroAddress,
    #[error("Entities must be distinct, got {0:?} twice")]
    IdenticalEntities(Address),
    #[error("Unsupported decimals: {0} (max {MAX_DECIMALS})")]
    UnsupportedDecimals(u8),
    #[error("Invalid {field}: {reason}")]
    InvalidMetadata { field: &'static str, reason: String },
    #[error("No pair derivation configured for scope {0}")]
    UnknownScope(Scope),
}

/// Identity of a token within a scope. Orders by scope, then address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId {
    pub scope: Scope,
    pub address: Address,
}

impl EntityId {
    pub fn new(scope: Scope, address: Address) -> Self {
        Self { scope, address }
    }
}

/// A token known to the cache, either from the default list or imported by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub scope: Scope,
    pub address: Address,
    pub decimals: u8,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl Entity {
    pub fn id(&self) -> EntityId {
        EntityId::new(self.scope, self.address)
    }
}

/// Untrusted token description coming from the UI (search box, list import).
#[derive(Debug, Clone, Deserialize)]
pub struct EntityDescriptor {
    pub scope: Scope,
    pub address: String,
    pub decimals: u8,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

fn check_metadata(
    field: &'static str,
    value: Option<String>,
    max_len: usize,
) -> Result<Option<String>, InvalidEntityError> {
    let Some(raw) = value else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.chars().count() > max_len {
        return Err(InvalidEntityError::InvalidMetadata {
            field,
            reason: format!("longer than {} characters", max_len),
        });
    }
    if trimmed.chars().any(char::is_control) {
        return Err(InvalidEntityError::InvalidMetadata {
            field,
            reason: "contains control characters".to_string(),
        });
    }
    Ok(Some(trimmed.to_string()))
}

impl TryFrom<EntityDescriptor> for Entity {
    type Error = InvalidEntityError;

    fn try_from(descriptor: EntityDescriptor) -> Result<Self, Self::Error> {
        let address = string_to_address(descriptor.address.trim())
            .map_err(|_| InvalidEntityError::InvalidAddress(descriptor.address.clone()))?;
        if address.is_zero() {
            return Err(InvalidEntityError::ZeroAddress);
        }
        if descriptor.decimals > MAX_DECIMALS {
            return Err(InvalidEntityError::UnsupportedDecimals(descriptor.decimals));
        }
        Ok(Entity {
            scope: descriptor.scope,
            address,
            decimals: descriptor.decimals,
            symbol: check_metadata("symbol", descriptor.symbol, MAX_SYMBOL_LEN)?,
            name: check_metadata("name", descriptor.name, MAX_NAME_LEN)?,
        })
    }
}
