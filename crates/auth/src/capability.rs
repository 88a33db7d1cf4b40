//! Capability evaluator: decides whether `(capability, channel)` is permitted
//! under a capability map.
//!
//! Policy: a `"*"` key, if present, short-circuits — the per-channel key is
//! never consulted once `"*"` exists, even if it wouldn't have granted the
//! capability either. This precedence is deliberate and must be reproduced
//! exactly.

use std::collections::HashMap;

/// `pattern -> comma-separated capability list`.
pub type CapabilityMap = HashMap<String, String>;

#[must_use]
pub fn has_capability(capability: &str, channel: &str, capabilities: &CapabilityMap) -> bool {
    if let Some(csv) = capabilities.get("*") {
        return csv_grants(csv, capability);
    }

    match capabilities.get(channel) {
        Some(csv) => csv_grants(csv, capability),
        None => false,
    }
}

fn csv_grants(csv: &str, capability: &str) -> bool {
    csv.split(',').any(|c| c == "*" || c == capability)
}
