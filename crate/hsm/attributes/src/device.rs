//! The single device operation the attribute retrieval process depends on:
//! a batched, size-blind `C_GetAttributeValue`.

use std::sync::Arc;

use pkcs11_sys::{
    CK_ATTRIBUTE_TYPE, CK_OBJECT_HANDLE, CK_RV, CK_SESSION_HANDLE, CK_ULONG,
    CKR_ATTRIBUTE_SENSITIVE, CKR_ATTRIBUTE_TYPE_INVALID, CKR_BUFFER_TOO_SMALL, CKR_OK,
};
use zeroize::Zeroizing;

use crate::HResult;

/// Length reported by the device when an attribute cannot be returned
/// at the requested buffer size, or does not apply to the object.
pub const CK_UNAVAILABLE_INFORMATION: CK_ULONG = !0;

/// One attribute of a `C_GetAttributeValue` template.
/// A `capacity` of 0 asks for the attribute length only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeRequest {
    pub attribute_type: CK_ATTRIBUTE_TYPE,
    pub capacity: usize,
}

impl AttributeRequest {
    #[must_use]
    pub const fn new(attribute_type: CK_ATTRIBUTE_TYPE, capacity: usize) -> Self {
        Self {
            attribute_type,
            capacity,
        }
    }

    #[must_use]
    pub const fn is_length_only(&self) -> bool {
        self.capacity == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeReply {
    /// The value fitted in the provided buffer
    Value(Zeroizing<Vec<u8>>),
    /// Length only, in answer to a zero capacity request
    Length(usize),
    /// `CK_UNAVAILABLE_INFORMATION`: too small a buffer, or not applicable
    Unavailable,
}

impl AttributeReply {
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeResponse {
    pub attribute_type: CK_ATTRIBUTE_TYPE,
    pub reply: AttributeReply,
}

/// The outcome of one `C_GetAttributeValue` call: a single return code
/// and one reply per requested attribute, in any order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundResponse {
    pub status: CK_RV,
    pub entries: Vec<AttributeResponse>,
}

/// Classification of a `C_GetAttributeValue` return code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundStatus {
    Ok,
    BufferTooSmall,
    /// `CKR_ATTRIBUTE_SENSITIVE` or `CKR_ATTRIBUTE_TYPE_INVALID`.
    /// Some devices also return these codes when a buffer was too small.
    SensitiveOrInvalid,
    Failed(CK_RV),
}

impl From<CK_RV> for RoundStatus {
    fn from(rv: CK_RV) -> Self {
        match rv {
            CKR_OK => Self::Ok,
            CKR_BUFFER_TOO_SMALL => Self::BufferTooSmall,
            CKR_ATTRIBUTE_SENSITIVE | CKR_ATTRIBUTE_TYPE_INVALID => Self::SensitiveOrInvalid,
            rv => Self::Failed(rv),
        }
    }
}

/// A device able to answer `C_GetAttributeValue` requests.
///
/// Implementations must return exactly one response entry per request entry.
/// A zero capacity request must be answered with a length (or `Unavailable`),
/// a positive capacity request with a value or `Unavailable`.
/// Device return codes are carried in [`RoundResponse::status`];
/// `Err` is reserved for failures of the binding itself.
pub trait AttributeDevice {
    fn get_attribute_values(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        requests: &[AttributeRequest],
    ) -> HResult<RoundResponse>;
}

impl<D: AttributeDevice + ?Sized> AttributeDevice for Arc<D> {
    fn get_attribute_values(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        requests: &[AttributeRequest],
    ) -> HResult<RoundResponse> {
        (**self).get_attribute_values(session, object, requests)
    }
}
