//! A PKCS#11 session and the object level operations built on it.
//!
//! Attribute retrieval goes through [`GetAttributeProcess`] with the slot
//! configuration, so callers never size `CK_ATTRIBUTE` buffers themselves.

use std::{ptr, sync::Arc};

use pkcs11_sys::{
    CK_ATTRIBUTE, CK_ATTRIBUTE_TYPE, CK_BBOOL, CK_FALSE, CK_OBJECT_CLASS, CK_OBJECT_HANDLE,
    CK_SESSION_HANDLE, CK_ULONG, CKA_CLASS, CKA_LABEL, CKA_TOKEN, CKA_VALUE, CKO_DATA,
};
use tracing::{debug, trace};

use crate::{
    AttributeFetchConfig, AttributeValue, FetchedAttribute, GetAttributeProcess, HError,
    HResult, ObjectHandlesCache, hsm_call, hsm_lib::HsmLib, instrumented::InstrumentedDevice,
};

/// Maximum number of handles retrieved per `C_FindObjects` call
const FIND_MAX_OBJECT_COUNT: usize = 64;

pub struct Session {
    device: Arc<InstrumentedDevice<Arc<HsmLib>>>,
    handle: CK_SESSION_HANDLE,
    object_handles_cache: Arc<ObjectHandlesCache>,
    fetch_config: Arc<AttributeFetchConfig>,
    logged_in: bool,
    closed: bool,
}

impl Session {
    pub(crate) fn new(
        device: Arc<InstrumentedDevice<Arc<HsmLib>>>,
        session_handle: CK_SESSION_HANDLE,
        object_handles_cache: Arc<ObjectHandlesCache>,
        fetch_config: Arc<AttributeFetchConfig>,
    ) -> Self {
        debug!("Creating new session: {session_handle}");
        Self {
            device,
            handle: session_handle,
            object_handles_cache,
            fetch_config,
            logged_in: false,
            closed: false,
        }
    }

    fn hsm(&self) -> &HsmLib {
        self.device.inner()
    }

    pub(crate) const fn set_logged_in(&mut self) {
        self.logged_in = true;
    }

    #[must_use]
    pub const fn session_handle(&self) -> CK_SESSION_HANDLE {
        self.handle
    }

    /// Close the session, logging out first if it logged in.
    /// Closing twice is a no-op.
    pub fn close(&mut self) -> HResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let result = logout_then_close(self.logged_in, || self.logout(), || self.close_session());
        debug!("Closed session {}", self.handle);
        result
    }

    fn logout(&self) -> HResult<()> {
        hsm_call!(self.hsm(), "Failed logging out", C_Logout, self.handle);
        Ok(())
    }

    fn close_session(&self) -> HResult<()> {
        hsm_call!(
            self.hsm(),
            "Failed closing a session",
            C_CloseSession,
            self.handle
        );
        Ok(())
    }

    /// Retrieve the values of `attribute_types` for an object.
    ///
    /// One result is returned per requested type, in the same order.
    /// Attributes that are sensitive or do not apply to the object are
    /// returned as [`AttributeValue::Unavailable`].
    ///
    /// # Errors
    /// * If a type is requested twice
    /// * If `C_GetAttributeValue` returns a fatal error such as `CKR_OBJECT_HANDLE_INVALID`
    pub fn get_attributes(
        &self,
        object_handle: CK_OBJECT_HANDLE,
        attribute_types: &[CK_ATTRIBUTE_TYPE],
    ) -> HResult<Vec<FetchedAttribute>> {
        debug!(
            "Retrieving attributes {attribute_types:x?} of object {object_handle} in session {}",
            self.handle
        );
        GetAttributeProcess::new(
            &*self.device,
            self.handle,
            object_handle,
            &self.fetch_config.length_strategy,
            self.fetch_config.mode,
        )
        .with_ambiguity_policy(self.fetch_config.ambiguity_policy)
        .fetch(attribute_types)
    }

    /// Retrieve a single attribute value of an object
    pub fn get_attribute(
        &self,
        object_handle: CK_OBJECT_HANDLE,
        attribute_type: CK_ATTRIBUTE_TYPE,
    ) -> HResult<AttributeValue> {
        self.get_attributes(object_handle, &[attribute_type])?
            .pop()
            .map(|attribute| attribute.value)
            .ok_or_else(|| {
                HError::Default(format!("attribute {attribute_type:#x} was not retrieved"))
            })
    }

    fn find_object_handles(
        &self,
        mut template: Vec<CK_ATTRIBUTE>,
    ) -> HResult<Vec<CK_OBJECT_HANDLE>> {
        let mut object_handles: Vec<CK_OBJECT_HANDLE> = Vec::new();
        hsm_call!(
            self.hsm(),
            "Failed to initialize object search: C_FindObjectsInit failed",
            C_FindObjectsInit,
            self.handle,
            template.as_mut_ptr(),
            CK_ULONG::try_from(template.len())?
        );

        let mut handles_buf = vec![CK_OBJECT_HANDLE::default(); FIND_MAX_OBJECT_COUNT];
        let mut object_count: CK_ULONG = 0;
        loop {
            hsm_call!(
                self.hsm(),
                "Failed to find objects",
                C_FindObjects,
                self.handle,
                handles_buf.as_mut_ptr(),
                CK_ULONG::try_from(FIND_MAX_OBJECT_COUNT)?,
                &raw mut object_count
            );
            if object_count == 0 {
                break;
            }
            trace!("Found {object_count} objects");
            object_handles.extend_from_slice(
                handles_buf
                    .get(..usize::try_from(object_count)?)
                    .ok_or_else(|| {
                        HError::Default("More objects returned than requested".to_owned())
                    })?,
            );
        }
        hsm_call!(
            self.hsm(),
            "Failed to finalize object search",
            C_FindObjectsFinal,
            self.handle
        );
        Ok(object_handles)
    }

    /// Find the handle of the object with the given `CKA_LABEL`.
    /// Handles are cached per slot.
    ///
    /// Returns `None` if no object carries that label.
    pub fn get_object_handle(&self, label: &[u8]) -> HResult<Option<CK_OBJECT_HANDLE>> {
        if let Some(handle) = self.object_handles_cache.get(label)? {
            return Ok(Some(handle));
        }
        let template = vec![CK_ATTRIBUTE {
            type_: CKA_LABEL,
            pValue: label.as_ptr().cast::<std::ffi::c_void>().cast_mut(),
            ulValueLen: CK_ULONG::try_from(label.len())?,
        }];
        let object_handles = self.find_object_handles(template)?;
        let Some(handle) = object_handles.first().copied() else {
            return Ok(None);
        };
        if object_handles.len() > 1 {
            debug!(
                "Found {} objects with the same label, using handle {handle}",
                object_handles.len()
            );
        }
        self.object_handles_cache.insert(label.to_vec(), handle)?;
        Ok(Some(handle))
    }

    /// Create a session (non token) data object
    pub fn create_data_object(&self, label: &[u8], value: &[u8]) -> HResult<CK_OBJECT_HANDLE> {
        let mut class: CK_OBJECT_CLASS = CKO_DATA;
        let mut token: CK_BBOOL = CK_FALSE;
        let mut template = [
            CK_ATTRIBUTE {
                type_: CKA_CLASS,
                pValue: (&raw mut class).cast::<std::ffi::c_void>(),
                ulValueLen: CK_ULONG::try_from(size_of::<CK_OBJECT_CLASS>())?,
            },
            CK_ATTRIBUTE {
                type_: CKA_TOKEN,
                pValue: (&raw mut token).cast::<std::ffi::c_void>(),
                ulValueLen: CK_ULONG::try_from(size_of::<CK_BBOOL>())?,
            },
            CK_ATTRIBUTE {
                type_: CKA_LABEL,
                pValue: label.as_ptr().cast::<std::ffi::c_void>().cast_mut(),
                ulValueLen: CK_ULONG::try_from(label.len())?,
            },
            CK_ATTRIBUTE {
                type_: CKA_VALUE,
                pValue: if value.is_empty() {
                    ptr::null_mut()
                } else {
                    value.as_ptr().cast::<std::ffi::c_void>().cast_mut()
                },
                ulValueLen: CK_ULONG::try_from(value.len())?,
            },
        ];
        let mut object_handle = CK_OBJECT_HANDLE::default();
        hsm_call!(
            self.hsm(),
            "Failed creating a data object",
            C_CreateObject,
            self.handle,
            template.as_mut_ptr(),
            CK_ULONG::try_from(template.len())?,
            &raw mut object_handle
        );
        self.object_handles_cache
            .insert(label.to_vec(), object_handle)?;
        Ok(object_handle)
    }

    pub fn destroy_object(&self, object_handle: CK_OBJECT_HANDLE) -> HResult<()> {
        hsm_call!(
            self.hsm(),
            "Failed to destroy object",
            C_DestroyObject,
            self.handle,
            object_handle
        );
        self.object_handles_cache.remove_handle(object_handle)?;
        Ok(())
    }
}

/// Close the session even when the logout fails, reporting the first error
fn logout_then_close(
    logged_in: bool,
    logout: impl FnOnce() -> HResult<()>,
    close: impl FnOnce() -> HResult<()>,
) -> HResult<()> {
    let logout = if logged_in { logout() } else { Ok(()) };
    let close = close();
    logout.and(close)
}

impl Drop for Session {
    fn drop(&mut self) {
        drop(self.close());
    }
}
