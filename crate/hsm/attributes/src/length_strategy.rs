//! Initial buffer sizes for attribute retrieval.
//!
//! `C_GetAttributeValue` only reveals the size of an attribute once it is asked
//! with a zero-sized (or too small) buffer. Guessing a buffer size up front saves
//! one round trip for every attribute that fits, at the cost of a retry for the
//! ones that do not.

use std::collections::HashSet;

use pkcs11_sys::{
    CK_ATTRIBUTE_TYPE, CKA_COEFFICIENT, CKA_EC_PARAMS, CKA_EC_POINT, CKA_EXPONENT_1,
    CKA_EXPONENT_2, CKA_ISSUER, CKA_MODULUS, CKA_PRIME_1, CKA_PRIME_2, CKA_PRIVATE_EXPONENT,
    CKA_SUBJECT, CKA_VALUE,
};
use serde::{Deserialize, Serialize};

/// Covers RSA moduli up to 16384 bits and most DER certificates
pub const DEFAULT_LARGE_ATTRIBUTE_LENGTH: usize = 2048;
/// Covers booleans, classes, key types, short labels and compressed EC points
pub const DEFAULT_ATTRIBUTE_LENGTH: usize = 72;

/// Returned by [`AttributeLengthStrategy::length_hint`] when no guess should be made:
/// the attribute length is first queried from the device.
pub const UNKNOWN_LENGTH: usize = 0;

fn default_large_attributes() -> HashSet<CK_ATTRIBUTE_TYPE> {
    HashSet::from([
        CKA_MODULUS,
        CKA_VALUE,
        CKA_PRIVATE_EXPONENT,
        CKA_PRIME_1,
        CKA_PRIME_2,
        CKA_EXPONENT_1,
        CKA_EXPONENT_2,
        CKA_COEFFICIENT,
        CKA_SUBJECT,
        CKA_ISSUER,
        CKA_EC_PARAMS,
        CKA_EC_POINT,
    ])
}

const fn default_large_length() -> usize {
    DEFAULT_LARGE_ATTRIBUTE_LENGTH
}

const fn default_length() -> usize {
    DEFAULT_ATTRIBUTE_LENGTH
}

/// Table driven guesses: attributes known to be potentially large get
/// `large_length`, every other attribute gets `default_length`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedClassStrategy {
    #[serde(default = "default_large_attributes")]
    pub large_attributes: HashSet<CK_ATTRIBUTE_TYPE>,
    #[serde(default = "default_large_length")]
    pub large_length: usize,
    #[serde(default = "default_length")]
    pub default_length: usize,
}

impl Default for FixedClassStrategy {
    fn default() -> Self {
        Self {
            large_attributes: default_large_attributes(),
            large_length: DEFAULT_LARGE_ATTRIBUTE_LENGTH,
            default_length: DEFAULT_ATTRIBUTE_LENGTH,
        }
    }
}

impl FixedClassStrategy {
    #[must_use]
    pub fn new(
        large_attributes: impl IntoIterator<Item = CK_ATTRIBUTE_TYPE>,
        large_length: usize,
        default_length: usize,
    ) -> Self {
        Self {
            large_attributes: large_attributes.into_iter().collect(),
            large_length,
            default_length,
        }
    }

    #[must_use]
    pub fn length_hint(&self, attribute_type: CK_ATTRIBUTE_TYPE) -> usize {
        if self.large_attributes.contains(&attribute_type) {
            self.large_length
        } else {
            self.default_length
        }
    }
}

/// Provides the first buffer length to try for an attribute.
///
/// Any positive hint is speculative: the retrieval process treats it as an
/// untrusted upper bound and falls back to querying the exact length when the
/// device rejects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttributeLengthStrategy {
    FixedClass(FixedClassStrategy),
    /// Always ask the device for the exact length first.
    /// Use it when a spurious `CKR_BUFFER_TOO_SMALL` must be avoided.
    NoGuess,
}

impl Default for AttributeLengthStrategy {
    fn default() -> Self {
        Self::FixedClass(FixedClassStrategy::default())
    }
}

impl AttributeLengthStrategy {
    /// The buffer length to try first for `attribute_type`,
    /// or [`UNKNOWN_LENGTH`] to query the exact length first.
    #[must_use]
    pub fn length_hint(&self, attribute_type: CK_ATTRIBUTE_TYPE) -> usize {
        match self {
            Self::FixedClass(strategy) => strategy.length_hint(attribute_type),
            Self::NoGuess => UNKNOWN_LENGTH,
        }
    }
}
