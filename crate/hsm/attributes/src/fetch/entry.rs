use pkcs11_sys::CK_ATTRIBUTE_TYPE;
use zeroize::Zeroizing;

use crate::{HError, HResult};

/// Final value of a requested attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    Value(Zeroizing<Vec<u8>>),
    /// The attribute is sensitive or does not apply to the object
    Unavailable,
}

impl AttributeValue {
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Value(bytes) => Some(bytes.as_slice()),
            Self::Unavailable => None,
        }
    }

    /// Actual length of the value, `None` when unavailable
    #[must_use]
    pub fn len(&self) -> Option<usize> {
        self.as_bytes().map(<[u8]>::len)
    }

    #[must_use]
    pub const fn is_available(&self) -> bool {
        matches!(self, Self::Value(_))
    }
}

/// A requested attribute with its retrieved value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedAttribute {
    pub attribute_type: CK_ATTRIBUTE_TYPE,
    pub value: AttributeValue,
}

/// Derived from the length fields of a [`FetchEntry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    LengthUnknown,
    LengthGuessed,
    LengthConfirmed,
    Fetched,
}

/// Retrieval state of one requested attribute
#[derive(Debug)]
pub(crate) struct FetchEntry {
    attribute_type: CK_ATTRIBUTE_TYPE,
    /// Buffer length to request, 0 to ask the length
    length: usize,
    /// `length` was reported by the device
    length_known: bool,
    result: Option<AttributeValue>,
}

impl FetchEntry {
    pub(crate) const fn new(attribute_type: CK_ATTRIBUTE_TYPE, length_hint: usize) -> Self {
        Self {
            attribute_type,
            length: length_hint,
            length_known: false,
            result: None,
        }
    }

    pub(crate) const fn attribute_type(&self) -> CK_ATTRIBUTE_TYPE {
        self.attribute_type
    }

    pub(crate) const fn length(&self) -> usize {
        self.length
    }

    pub(crate) const fn state(&self) -> EntryState {
        if self.result.is_some() {
            EntryState::Fetched
        } else if self.length == 0 {
            EntryState::LengthUnknown
        } else if self.length_known {
            EntryState::LengthConfirmed
        } else {
            EntryState::LengthGuessed
        }
    }

    pub(crate) const fn is_fetched(&self) -> bool {
        self.result.is_some()
    }

    /// A buffer is requested with a length the device never confirmed
    pub(crate) const fn is_speculative(&self) -> bool {
        matches!(self.state(), EntryState::LengthGuessed)
    }

    pub(crate) fn set_value(&mut self, value: Zeroizing<Vec<u8>>) {
        self.result = Some(AttributeValue::Value(value));
    }

    /// Record the exact length reported by the device.
    /// An empty attribute needs no further round.
    pub(crate) fn confirm_length(&mut self, length: usize) {
        if length == 0 {
            self.set_value(Zeroizing::new(Vec::new()));
        } else {
            self.length = length;
            self.length_known = true;
        }
    }

    /// The buffer was too small: query the exact length next round
    pub(crate) fn reset_length(&mut self) -> HResult<()> {
        if self.length_known {
            return Err(HError::ProtocolViolation(format!(
                "attribute {:#x} was rejected as too small at its reported length of {} bytes",
                self.attribute_type, self.length
            )));
        }
        self.length = 0;
        Ok(())
    }

    pub(crate) fn set_unavailable(&mut self) {
        self.result = Some(AttributeValue::Unavailable);
    }

    pub(crate) fn into_fetched(self) -> HResult<FetchedAttribute> {
        let value = self.result.ok_or_else(|| {
            HError::Default(format!(
                "attribute {:#x} was not retrieved",
                self.attribute_type
            ))
        })?;
        Ok(FetchedAttribute {
            attribute_type: self.attribute_type,
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use pkcs11_sys::{CKA_LABEL, CKA_MODULUS};

    use super::*;

    #[test]
    fn state_transitions() -> HResult<()> {
        let mut entry = FetchEntry::new(CKA_MODULUS, 72);
        assert_eq!(entry.state(), EntryState::LengthGuessed);
        assert!(entry.is_speculative());

        entry.reset_length()?;
        assert_eq!(entry.state(), EntryState::LengthUnknown);
        assert!(!entry.is_speculative());

        entry.confirm_length(300);
        assert_eq!(entry.state(), EntryState::LengthConfirmed);
        assert_eq!(entry.length(), 300);
        assert!(!entry.is_speculative());

        entry.set_value(Zeroizing::new(vec![1_u8; 300]));
        assert_eq!(entry.state(), EntryState::Fetched);
        let fetched = entry.into_fetched()?;
        assert_eq!(fetched.value.len(), Some(300));
        Ok(())
    }

    #[test]
    fn confirmed_length_cannot_be_too_small() {
        let mut entry = FetchEntry::new(CKA_MODULUS, 0);
        entry.confirm_length(256);
        assert!(matches!(
            entry.reset_length(),
            Err(HError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn empty_attribute_is_fetched_on_confirmation() -> HResult<()> {
        let mut entry = FetchEntry::new(CKA_LABEL, 0);
        assert_eq!(entry.state(), EntryState::LengthUnknown);
        entry.confirm_length(0);
        assert!(entry.is_fetched());
        let fetched = entry.into_fetched()?;
        assert_eq!(fetched.value.as_bytes(), Some(&[][..]));
        Ok(())
    }

    #[test]
    fn unfetched_entry_cannot_be_returned() {
        let entry = FetchEntry::new(CKA_LABEL, 72);
        assert!(entry.into_fetched().is_err());
    }
}
