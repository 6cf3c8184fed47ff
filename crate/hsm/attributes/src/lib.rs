//! Copyright 2024 Cosmian Tech SAS
//!
//! Retrieval of PKCS#11 object attributes.
//!
//! `C_GetAttributeValue` fetches many attributes in one call but only reveals
//! the size of a value when given a too small or empty buffer, and some devices
//! report a too small buffer with the same codes they use for sensitive or
//! inapplicable attributes. [`GetAttributeProcess`] hides this behind a single
//! `fetch` call, using an [`AttributeLengthStrategy`] to guess buffer sizes and
//! save round trips.

#![allow(non_snake_case)]

mod base_hsm;
mod config;
mod device;
mod error;
mod fetch;
mod hsm_lib;
mod instrumented;
mod length_strategy;
mod session;
mod slots;

pub use base_hsm::{BaseHsm, Info};
pub use config::AttributeFetchConfig;
pub use device::{
    AttributeDevice, AttributeReply, AttributeRequest, AttributeResponse,
    CK_UNAVAILABLE_INFORMATION, RoundResponse, RoundStatus,
};
pub use error::{HError, HResult};
pub use fetch::{
    AmbiguityPolicy, AttributeValue, FetchMode, FetchedAttribute, GetAttributeProcess,
};
pub use instrumented::{CallStats, InstrumentedDevice};
pub use length_strategy::{
    AttributeLengthStrategy, DEFAULT_ATTRIBUTE_LENGTH, DEFAULT_LARGE_ATTRIBUTE_LENGTH,
    FixedClassStrategy, UNKNOWN_LENGTH,
};
pub use session::Session;
pub use slots::{ObjectHandlesCache, SlotManager};

#[cfg(test)]
mod tests;

/// Call a PKCS#11 function of the library and return early with an
/// `HError::Default` carrying `$msg` if it does not return `CKR_OK`.
#[macro_export]
macro_rules! hsm_call {
    ($hsm:expr, $msg:expr, $fn_name:ident $(, $arg:expr)* $(,)?) => {{
        #[allow(unsafe_code)]
        let rv = match $hsm.$fn_name {
            Some(func) => unsafe { func($($arg),*) },
            None => {
                return Err($crate::HError::Default(format!(
                    "{} not available on library",
                    stringify!($fn_name)
                )));
            }
        };
        if rv != ::pkcs11_sys::CKR_OK {
            return Err($crate::HError::Default(format!("{}: {rv:#x}", $msg)));
        }
    }};
}
