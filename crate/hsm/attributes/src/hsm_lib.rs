use std::ptr;

use libloading::Library;
use pkcs11_sys::{
    CK_ATTRIBUTE, CK_C_CloseSession, CK_C_CreateObject, CK_C_DestroyObject, CK_C_Finalize,
    CK_C_FindObjects, CK_C_FindObjectsFinal, CK_C_FindObjectsInit, CK_C_GetAttributeValue,
    CK_C_GetInfo, CK_C_INITIALIZE_ARGS, CK_C_Initialize, CK_C_Login, CK_C_Logout,
    CK_C_OpenSession, CK_OBJECT_HANDLE, CK_SESSION_HANDLE, CK_ULONG, CKF_OS_LOCKING_OK,
};
use zeroize::Zeroizing;

use crate::{
    HError, HResult,
    device::{
        AttributeDevice, AttributeReply, AttributeRequest, AttributeResponse,
        CK_UNAVAILABLE_INFORMATION, RoundResponse,
    },
    hsm_call,
};

/// The PKCS#11 functions of a dynamically loaded HSM library.
///
/// The library is initialized with OS locking when loaded
/// and finalized when this struct is dropped.
pub struct HsmLib {
    _library: Library,
    pub(crate) C_Initialize: CK_C_Initialize,
    pub(crate) C_Finalize: CK_C_Finalize,
    pub(crate) C_GetInfo: CK_C_GetInfo,

    pub(crate) C_OpenSession: CK_C_OpenSession,
    pub(crate) C_CloseSession: CK_C_CloseSession,
    pub(crate) C_Login: CK_C_Login,
    pub(crate) C_Logout: CK_C_Logout,

    pub(crate) C_FindObjectsInit: CK_C_FindObjectsInit,
    pub(crate) C_FindObjects: CK_C_FindObjects,
    pub(crate) C_FindObjectsFinal: CK_C_FindObjectsFinal,

    pub(crate) C_CreateObject: CK_C_CreateObject,
    pub(crate) C_DestroyObject: CK_C_DestroyObject,
    pub(crate) C_GetAttributeValue: CK_C_GetAttributeValue,
}

impl HsmLib {
    #[allow(unsafe_code)]
    pub(crate) fn instantiate<P>(path: P) -> HResult<Self>
    where
        P: AsRef<std::ffi::OsStr>,
    {
        unsafe {
            let library = Library::new(path)?;
            let hsm_lib = Self {
                C_Initialize: Some(*library.get(b"C_Initialize")?),
                C_Finalize: Some(*library.get(b"C_Finalize")?),
                C_GetInfo: Some(*library.get(b"C_GetInfo")?),
                C_OpenSession: Some(*library.get(b"C_OpenSession")?),
                C_CloseSession: Some(*library.get(b"C_CloseSession")?),
                C_Login: Some(*library.get(b"C_Login")?),
                C_Logout: Some(*library.get(b"C_Logout")?),
                C_FindObjectsInit: Some(*library.get(b"C_FindObjectsInit")?),
                C_FindObjects: Some(*library.get(b"C_FindObjects")?),
                C_FindObjectsFinal: Some(*library.get(b"C_FindObjectsFinal")?),
                C_CreateObject: Some(*library.get(b"C_CreateObject")?),
                C_DestroyObject: Some(*library.get(b"C_DestroyObject")?),
                C_GetAttributeValue: Some(*library.get(b"C_GetAttributeValue")?),
                // we need to keep the library alive
                _library: library,
            };
            Self::initialize(&hsm_lib)?;
            Ok(hsm_lib)
        }
    }

    fn initialize(hsm_lib: &Self) -> HResult<()> {
        let mut p_init_args = CK_C_INITIALIZE_ARGS {
            CreateMutex: None,
            DestroyMutex: None,
            LockMutex: None,
            UnlockMutex: None,
            flags: CKF_OS_LOCKING_OK,
            pReserved: ptr::null_mut(),
        };
        hsm_call!(
            hsm_lib,
            "Failed initializing the HSM",
            C_Initialize,
            (&raw mut p_init_args).cast::<std::ffi::c_void>()
        );
        Ok(())
    }

    fn finalize(&self) -> HResult<()> {
        hsm_call!(
            self,
            "Failed to finalize the HSM",
            C_Finalize,
            ptr::null_mut()
        );
        Ok(())
    }
}

impl Drop for HsmLib {
    fn drop(&mut self) {
        drop(self.finalize());
    }
}

impl AttributeDevice for HsmLib {
    /// Marshal the requests into a `CK_ATTRIBUTE` template, call
    /// `C_GetAttributeValue` and read back the reported lengths.
    fn get_attribute_values(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        requests: &[AttributeRequest],
    ) -> HResult<RoundResponse> {
        let mut buffers: Vec<Zeroizing<Vec<u8>>> = requests
            .iter()
            .map(|request| Zeroizing::new(vec![0_u8; request.capacity]))
            .collect();
        let mut template = requests
            .iter()
            .zip(buffers.iter_mut())
            .map(|(request, buffer)| {
                Ok(CK_ATTRIBUTE {
                    type_: request.attribute_type,
                    pValue: if request.is_length_only() {
                        ptr::null_mut()
                    } else {
                        buffer.as_mut_ptr().cast::<std::ffi::c_void>()
                    },
                    ulValueLen: CK_ULONG::try_from(request.capacity)?,
                })
            })
            .collect::<HResult<Vec<CK_ATTRIBUTE>>>()?;

        #[allow(unsafe_code)]
        let status = match self.C_GetAttributeValue {
            Some(func) => unsafe {
                func(
                    session,
                    object,
                    template.as_mut_ptr(),
                    CK_ULONG::try_from(template.len())?,
                )
            },
            None => {
                return Err(HError::Default(
                    "C_GetAttributeValue not available on library".to_owned(),
                ));
            }
        };

        let entries = template
            .iter()
            .zip(requests)
            .zip(buffers)
            .map(|((attribute, request), mut buffer)| {
                let reply = if attribute.ulValueLen == CK_UNAVAILABLE_INFORMATION {
                    AttributeReply::Unavailable
                } else {
                    let length = usize::try_from(attribute.ulValueLen)?;
                    if request.is_length_only() {
                        AttributeReply::Length(length)
                    } else if length <= request.capacity {
                        buffer.truncate(length);
                        AttributeReply::Value(buffer)
                    } else {
                        AttributeReply::Unavailable
                    }
                };
                Ok(AttributeResponse {
                    attribute_type: request.attribute_type,
                    reply,
                })
            })
            .collect::<HResult<Vec<_>>>()?;
        Ok(RoundResponse { status, entries })
    }
}
