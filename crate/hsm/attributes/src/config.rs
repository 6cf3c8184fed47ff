use serde::{Deserialize, Serialize};

use crate::{AmbiguityPolicy, AttributeLengthStrategy, FetchMode};

/// Attribute retrieval settings of an HSM.
///
/// Every field has a default, so a partial configuration such as
/// `{"mode": "single"}` is valid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributeFetchConfig {
    pub mode: FetchMode,
    pub length_strategy: AttributeLengthStrategy,
    pub ambiguity_policy: AmbiguityPolicy,
}
