use serde::{Deserialize, Serialize};

/// How many attributes are sent to the device per round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    /// Every pending attribute in a single template
    #[default]
    Batch,
    /// One attribute at a time, in request order
    Single,
}

/// Interpretation of `CKR_ATTRIBUTE_SENSITIVE` / `CKR_ATTRIBUTE_TYPE_INVALID`
/// when the device may be using them to report a too small buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguityPolicy {
    /// Read the status as "buffer too small" when several attributes are
    /// unavailable and at least one buffer length was a guess.
    /// Two genuinely inapplicable attributes fetched alongside a guess cost
    /// one extra length-only round before being reported unavailable.
    #[default]
    CountHeuristic,
    /// Never reinterpret: unavailable attributes are final
    Strict,
}

impl AmbiguityPolicy {
    /// Whether a sensitive/invalid status must be handled as a too small buffer
    #[must_use]
    pub const fn treats_as_too_small(
        &self,
        unavailable_count: usize,
        used_speculative_length: bool,
    ) -> bool {
        match self {
            Self::CountHeuristic => unavailable_count > 1 && used_speculative_length,
            Self::Strict => false,
        }
    }
}
