//! Copyright 2024 Cosmian Tech SAS

use pkcs11_sys::{CK_ATTRIBUTE_TYPE, CK_RV};
use thiserror::Error;

pub type HResult<T> = Result<T, HError>;

#[derive(Error, Debug)]
pub enum HError {
    #[error("{0}")]
    Default(String),

    #[error("Error loading the library: {0}")]
    LibLoading(#[from] libloading::Error),

    /// Fatal status returned by `C_GetAttributeValue`.
    /// `outstanding` lists the attributes that were still unresolved in that round.
    #[error("PKCS#11 error {rv:#x} while fetching attributes {outstanding:?}")]
    Pkcs11 {
        rv: CK_RV,
        outstanding: Vec<CK_ATTRIBUTE_TYPE>,
    },

    #[error("attribute {0:#x} is requested more than once")]
    DuplicateAttribute(CK_ATTRIBUTE_TYPE),

    /// The device answered for an attribute that was not part of the query.
    /// This is a defect of the device adapter, not a device condition.
    #[error("the device returned attribute {0:#x} which was not requested")]
    UnexpectedAttribute(CK_ATTRIBUTE_TYPE),

    #[error("PKCS#11 protocol violation: {0}")]
    ProtocolViolation(String),

    #[error(transparent)]
    TryFromIntError(#[from] std::num::TryFromIntError),
}
