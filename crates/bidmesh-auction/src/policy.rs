//! How much a node trusts events from its peers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Receiver-side validation of remote auction events
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationPolicy {
    /// Claimed identities must match the link, remote bids must raise the
    /// top price, and only the auctioneer may close.
    #[default]
    Strict,
    /// Apply remote events as sent
    Trusting,
}

impl ValidationPolicy {
    /// Whether remote events are checked
    pub fn is_strict(self) -> bool {
        self == ValidationPolicy::Strict
    }
}

impl FromStr for ValidationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(ValidationPolicy::Strict),
            "trusting" => Ok(ValidationPolicy::Trusting),
            other => Err(format!("unknown validation policy: {}", other)),
        }
    }
}

impl fmt::Display for ValidationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationPolicy::Strict => f.write_str("strict"),
            ValidationPolicy::Trusting => f.write_str("trusting"),
        }
    }
}
