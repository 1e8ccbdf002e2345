//! Sender-to-destination routing table.
//!
//! The table is a flat JSON document:
//!
//! ```json
//! {
//!   "default_forward_mail": "inbox@example.org",
//!   "mail_mapping": {
//!     "billing@example.org": ["invoices@vendor.com", "shop@store.com"]
//!   }
//! }
//! ```
//!
//! Destinations are kept in a `BTreeMap`, so lookups walk them in ascending
//! lexicographic order. When a sender appears under more than one destination
//! the lexicographically smallest destination wins.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutingTable {
    #[serde(rename = "default_forward_mail", alias = "default")]
    pub default_destination: String,

    #[serde(rename = "mail_mapping", alias = "mapping", default)]
    pub mapping: BTreeMap<String, BTreeSet<String>>,
}

impl RoutingTable {
    /// Parses and validates a serialized table.
    ///
    /// Structural problems are reported here rather than at lookup time.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let table: RoutingTable = serde_json::from_str(raw)
            .map_err(|e| ConfigError::InvalidRoutingTable(e.to_string()))?;
        table.validate()?;
        Ok(table)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !looks_like_address(&self.default_destination) {
            return Err(ConfigError::InvalidRoutingTable(format!(
                "default destination '{}' is not an address",
                self.default_destination
            )));
        }
        for (destination, senders) in &self.mapping {
            if !looks_like_address(destination) {
                return Err(ConfigError::InvalidRoutingTable(format!(
                    "destination '{}' is not an address",
                    destination
                )));
            }
            if senders.iter().any(|s| s.trim().is_empty()) {
                return Err(ConfigError::InvalidRoutingTable(format!(
                    "destination '{}' lists an empty sender",
                    destination
                )));
            }
        }
        Ok(())
    }

    /// Resolves the forward destination for `sender`. Never fails.
    pub fn resolve_destination(&self, sender: &str) -> &str {
        self.mapping
            .iter()
            .find(|(_, senders)| senders.contains(sender))
            .map(|(destination, _)| destination.as_str())
            .unwrap_or(self.default_destination.as_str())
    }
}

fn looks_like_address(value: &str) -> bool {
    let value = value.trim();
    matches!(value.split_once('@'), Some((local, domain)) if !local.is_empty() && !domain.is_empty())
}
