//! Declarative stack configuration, loadable from JSON.
//!
//! ```json
//! {
//!   "address": "10.0.0.1",
//!   "netmask": "255.255.255.0",
//!   "gateway": "10.0.0.254",
//!   "dns": "10.0.0.53"
//! }
//! ```

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::inet::Inet;

/// Static network configuration for one stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackConfig {
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    #[serde(default = "default_dns")]
    pub dns: Ipv4Addr,
    /// Start IPv6 autoconfiguration alongside the static v4 setup.
    #[serde(default)]
    pub slaac: bool,
}

fn default_dns() -> Ipv4Addr {
    // a sensible public default, overridable per deployment
    Ipv4Addr::new(1, 1, 1, 1)
}

impl StackConfig {
    pub fn from_json(json: &str) -> Result<StackConfig> {
        serde_json::from_str(json).map_err(|e| Error::Parse(format!("config: {e}")))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Parse(format!("config: {e}")))
    }

    /// Apply to a stack: configure addresses and optionally kick SLAAC.
    pub fn apply(&self, inet: &Inet) {
        inet.configure(self.address, self.netmask, self.gateway, self.dns);
        if self.slaac {
            inet.start_slaac();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let config = StackConfig {
            address: Ipv4Addr::new(10, 0, 0, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::new(10, 0, 0, 254),
            dns: Ipv4Addr::new(10, 0, 0, 53),
            slaac: false,
        };
        let json = config.to_json().unwrap();
        assert_eq!(StackConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_defaults() {
        let json = r#"{
            "address": "192.168.1.10",
            "netmask": "255.255.255.0",
            "gateway": "192.168.1.1"
        }"#;
        let config = StackConfig::from_json(json).unwrap();
        assert_eq!(config.dns, Ipv4Addr::new(1, 1, 1, 1));
        assert!(!config.slaac);
    }

    #[test]
    fn test_bad_json_rejected() {
        assert!(StackConfig::from_json("{\"address\": \"not-an-ip\"}").is_err());
    }
}
