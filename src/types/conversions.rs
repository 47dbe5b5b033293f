use ethers::types::{Address, U256};
use rust_decimal::Decimal;
use std::str::FromStr;

/// Largest scale a `Decimal` can carry.
const MAX_SCALE: u32 = 28;

// Display amounts for the UI: raw integer units scaled by token decimals.
// Values beyond Decimal's 96-bit mantissa are reported as Overflow.
pub fn u256_to_decimal(value: U256, decimals: u8) -> Result<Decimal, ConversionError> {
    let value_str = value.to_string();
    let mut decimal_value = Decimal::from_str(&value_str).map_err(|e| ConversionError::InvalidDecimal(e.to_string()))?;

    let scale = u32::from(decimals);
    if scale <= MAX_SCALE {
        decimal_value.set_scale(scale).map_err(|e| ConversionError::InvalidDecimal(e.to_string()))?;
        return Ok(decimal_value.normalize());
    }
    // Scale in steps when decimals exceed Decimal's max precision
    let mut remaining = scale;
    while remaining > 0 {
        let step = remaining.min(18);
        let divisor = Decimal::from(10u64.pow(step));
        decimal_value = decimal_value.checked_div(divisor).ok_or(ConversionError::Overflow)?;
        remaining -= step;
    }
    Ok(decimal_value.normalize())
}

pub fn address_to_string(addr: Address) -> String {
    format!("{:?}", addr).to_lowercase()
}

pub fn string_to_address(s: &str) -> Result<Address, ConversionError> {
    Address::from_str(s).map_err(|e| ConversionError::InvalidAddress(e.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("Invalid decimal: {0}")]
    InvalidDecimal(String),
    #[error("Overflow in conversion")]
    Overflow,
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}
