use serde::{Deserialize, Serialize};

/// How a principal signed in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Device-local identity with no credentials, used by kid devices.
    Anonymous,
    /// Account-backed identity (username + password) carrying an email.
    Federated,
}
