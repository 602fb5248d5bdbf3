//! Advertisements seen during discovery.

use serde::{Deserialize, Serialize};

/// A peripheral seen during a discovery run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    /// Platform identifier (peripheral UUID on macOS, MAC address elsewhere).
    pub id: String,
    /// BLE MAC address, uppercase. All zeros on platforms that hide it.
    pub address: String,
    /// Advertised local name.
    pub local_name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
}

impl Advertisement {
    /// Create an advertisement, normalising the address to uppercase.
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into().to_uppercase(),
            local_name: None,
            rssi: None,
        }
    }

    /// Set the advertised name.
    #[must_use]
    pub fn with_local_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }

    /// Set the signal strength.
    #[must_use]
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// Whether the address starts with `prefix` (case-insensitive).
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.address.starts_with(&prefix.to_uppercase())
    }

    /// Whether `identifier` names this peripheral by id or address.
    pub fn matches(&self, identifier: &str) -> bool {
        self.id.eq_ignore_ascii_case(identifier) || self.address.eq_ignore_ascii_case(identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_is_uppercased() {
        let adv = Advertisement::new("id-1", "58:2b:db:aa:bb:cc");
        assert_eq!(adv.address, "58:2B:DB:AA:BB:CC");
    }

    #[test]
    fn test_prefix_match_is_case_insensitive() {
        let adv = Advertisement::new("id-1", "58:2B:DB:AA:BB:CC");
        assert!(adv.has_prefix("58:2b:db"));
        assert!(!adv.has_prefix("AA:BB"));
    }

    #[test]
    fn test_matches_id_or_address() {
        let adv = Advertisement::new("b1c2", "58:2B:DB:AA:BB:CC").with_local_name("PAX Calima");
        assert!(adv.matches("B1C2"));
        assert!(adv.matches("58:2b:db:aa:bb:cc"));
        assert!(!adv.matches("PAX Calima"));
    }
}
