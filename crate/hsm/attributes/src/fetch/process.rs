//! Multi-round `C_GetAttributeValue` driver.
//!
//! Each round sends a template made of the attributes not fetched yet, each one
//! with either a guessed buffer length, the exact length reported by the device
//! in a previous round, or no buffer at all to learn the length. The replies move
//! every entry forward until all of them hold a value or are known unavailable:
//!
//! ```text
//! LengthGuessed --too small--> LengthUnknown --length--> LengthConfirmed --value--> Fetched
//!       |                            |                                                ^
//!       +-----------value------------+--------------unavailable / not applicable------+
//! ```
//!
//! A guessed length can fail at most once per attribute and a confirmed length is
//! satisfied in the next round, so a batch converges in at most 3 rounds when the
//! status codes are not ambiguous.

use std::collections::{HashMap, HashSet};

use pkcs11_sys::{CK_ATTRIBUTE_TYPE, CK_OBJECT_HANDLE, CK_SESSION_HANDLE};
use tracing::{debug, trace, warn};

use crate::{
    HError, HResult,
    device::{AttributeDevice, AttributeReply, AttributeRequest, RoundResponse, RoundStatus},
    fetch::{
        entry::{FetchEntry, FetchedAttribute},
        policy::{AmbiguityPolicy, FetchMode},
    },
    length_strategy::AttributeLengthStrategy,
};

/// The template of one round
#[derive(Debug)]
struct Query {
    requests: Vec<AttributeRequest>,
    /// At least one buffer length is a guess
    speculative: bool,
}

impl Query {
    fn capacity_of(&self, attribute_type: CK_ATTRIBUTE_TYPE) -> Option<usize> {
        self.requests
            .iter()
            .find(|r| r.attribute_type == attribute_type)
            .map(|r| r.capacity)
    }
}

/// Retrieves a set of attributes of one object, in as few rounds as possible.
///
/// The process is bound to one session and one object and must not be shared
/// between threads: PKCS#11 sessions do not support overlapping operations.
pub struct GetAttributeProcess<'a, D: AttributeDevice + ?Sized> {
    device: &'a D,
    session: CK_SESSION_HANDLE,
    object: CK_OBJECT_HANDLE,
    length_strategy: &'a AttributeLengthStrategy,
    mode: FetchMode,
    ambiguity_policy: AmbiguityPolicy,
    rounds: usize,
}

impl<'a, D: AttributeDevice + ?Sized> GetAttributeProcess<'a, D> {
    pub fn new(
        device: &'a D,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        length_strategy: &'a AttributeLengthStrategy,
        mode: FetchMode,
    ) -> Self {
        Self {
            device,
            session,
            object,
            length_strategy,
            mode,
            ambiguity_policy: AmbiguityPolicy::default(),
            rounds: 0,
        }
    }

    #[must_use]
    pub fn with_ambiguity_policy(mut self, ambiguity_policy: AmbiguityPolicy) -> Self {
        self.ambiguity_policy = ambiguity_policy;
        self
    }

    /// Number of device calls made by the last `fetch`
    #[must_use]
    pub const fn rounds(&self) -> usize {
        self.rounds
    }

    /// Fetch the values of `attribute_types`.
    ///
    /// The result holds one entry per requested type, in the requested order.
    /// Sensitive or inapplicable attributes are returned as
    /// [`AttributeValue::Unavailable`](crate::AttributeValue::Unavailable).
    ///
    /// # Errors
    /// * `HError::DuplicateAttribute` if a type is requested twice
    /// * `HError::Pkcs11` if the device returns a fatal status; it carries the
    ///   return code and every attribute type still unresolved at that point
    /// * `HError::UnexpectedAttribute` or `HError::ProtocolViolation` if the
    ///   device replies inconsistently
    pub fn fetch(
        &mut self,
        attribute_types: &[CK_ATTRIBUTE_TYPE],
    ) -> HResult<Vec<FetchedAttribute>> {
        let mut index = HashMap::with_capacity(attribute_types.len());
        let mut entries = Vec::with_capacity(attribute_types.len());
        for (position, attribute_type) in attribute_types.iter().enumerate() {
            if index.insert(*attribute_type, position).is_some() {
                return Err(HError::DuplicateAttribute(*attribute_type));
            }
            entries.push(FetchEntry::new(
                *attribute_type,
                self.length_strategy.length_hint(*attribute_type),
            ));
        }

        self.rounds = 0;
        while let Some(query) = self.build_query(&entries) {
            self.rounds += 1;
            trace!(
                "C_GetAttributeValue round {} on object {}: {:?}",
                self.rounds, self.object, query.requests
            );
            let response =
                self.device
                    .get_attribute_values(self.session, self.object, &query.requests)?;
            Self::apply_response(
                self.ambiguity_policy,
                &mut entries,
                &index,
                &query,
                response,
            )?;
        }
        debug!(
            "Retrieved {} attributes of object {} in {} rounds",
            entries.len(),
            self.object,
            self.rounds
        );

        entries.into_iter().map(FetchEntry::into_fetched).collect()
    }

    fn build_query(&self, entries: &[FetchEntry]) -> Option<Query> {
        let pending = entries.iter().filter(|entry| !entry.is_fetched());
        let selected: Vec<&FetchEntry> = match self.mode {
            FetchMode::Batch => pending.collect(),
            FetchMode::Single => pending.take(1).collect(),
        };
        if selected.is_empty() {
            return None;
        }
        Some(Query {
            speculative: selected.iter().any(|entry| entry.is_speculative()),
            requests: selected
                .iter()
                .map(|entry| AttributeRequest::new(entry.attribute_type(), entry.length()))
                .collect(),
        })
    }

    fn apply_response(
        ambiguity_policy: AmbiguityPolicy,
        entries: &mut [FetchEntry],
        index: &HashMap<CK_ATTRIBUTE_TYPE, usize>,
        query: &Query,
        response: RoundResponse,
    ) -> HResult<()> {
        let status = RoundStatus::from(response.status);
        if let RoundStatus::Failed(rv) = status {
            return Err(HError::Pkcs11 {
                rv,
                outstanding: entries
                    .iter()
                    .filter(|entry| !entry.is_fetched())
                    .map(FetchEntry::attribute_type)
                    .collect(),
            });
        }
        if response.entries.len() != query.requests.len() {
            return Err(HError::ProtocolViolation(format!(
                "{} attributes requested but {} returned",
                query.requests.len(),
                response.entries.len()
            )));
        }

        let unavailable_count = response
            .entries
            .iter()
            .filter(|r| r.reply.is_unavailable())
            .count();
        let too_small = match status {
            RoundStatus::BufferTooSmall => true,
            RoundStatus::SensitiveOrInvalid => {
                let ambiguous =
                    ambiguity_policy.treats_as_too_small(unavailable_count, query.speculative);
                if ambiguous {
                    warn!(
                        "status {:#x} with {unavailable_count} unavailable attributes and guessed \
                         lengths: retrying as too small buffers",
                        response.status
                    );
                }
                ambiguous
            }
            RoundStatus::Ok | RoundStatus::Failed(_) => false,
        };

        let mut seen = HashSet::with_capacity(response.entries.len());
        for attribute in response.entries {
            let capacity = query
                .capacity_of(attribute.attribute_type)
                .ok_or(HError::UnexpectedAttribute(attribute.attribute_type))?;
            if !seen.insert(attribute.attribute_type) {
                return Err(HError::ProtocolViolation(format!(
                    "attribute {:#x} is returned more than once",
                    attribute.attribute_type
                )));
            }
            let entry = index
                .get(&attribute.attribute_type)
                .and_then(|position| entries.get_mut(*position))
                .ok_or(HError::UnexpectedAttribute(attribute.attribute_type))?;
            if entry.is_fetched() {
                return Err(HError::UnexpectedAttribute(attribute.attribute_type));
            }
            match attribute.reply {
                AttributeReply::Value(_) if capacity == 0 => {
                    return Err(HError::ProtocolViolation(format!(
                        "a value is returned for attribute {:#x} when only its length was asked",
                        attribute.attribute_type
                    )));
                }
                AttributeReply::Length(_) if capacity > 0 => {
                    return Err(HError::ProtocolViolation(format!(
                        "a length is returned for attribute {:#x} instead of its value",
                        attribute.attribute_type
                    )));
                }
                AttributeReply::Value(value) => entry.set_value(value),
                AttributeReply::Length(length) => entry.confirm_length(length),
                AttributeReply::Unavailable => {
                    if status == RoundStatus::Ok {
                        return Err(HError::ProtocolViolation(format!(
                            "attribute {:#x} is unavailable but the call succeeded",
                            attribute.attribute_type
                        )));
                    }
                    // a length query cannot fail for lack of space
                    if too_small && capacity > 0 {
                        entry.reset_length()?;
                    } else {
                        entry.set_unavailable();
                    }
                }
            }
        }
        Ok(())
    }
}
