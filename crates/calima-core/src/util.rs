//! Helpers for turning btleplug identifiers into strings.

use btleplug::platform::PeripheralId;

/// Address reported by platforms that hide the MAC (macOS).
pub const ZERO_ADDRESS: &str = "00:00:00:00:00:00";

/// Format a peripheral ID as a string.
///
/// On macOS, peripheral IDs are UUIDs. On other platforms they wrap the
/// MAC address.
pub fn format_peripheral_id(id: &PeripheralId) -> String {
    format!("{:?}", id)
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

/// Whether `address` is the placeholder some platforms report.
pub fn is_zero_address(address: &str) -> bool {
    address == ZERO_ADDRESS
}

/// Identifier used to find the peripheral again: the peripheral ID where
/// the address is hidden, the address everywhere else.
pub fn create_identifier(address: &str, peripheral_id: &PeripheralId) -> String {
    if is_zero_address(address) {
        format_peripheral_id(peripheral_id)
    } else {
        address.to_uppercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_address() {
        assert!(is_zero_address("00:00:00:00:00:00"));
        assert!(!is_zero_address("58:2B:DB:00:00:01"));
    }
}
