use std::{
    num::NonZeroUsize,
    ptr,
    sync::{Arc, Mutex},
};

use lru::LruCache;
use pkcs11_sys::{
    CK_FLAGS, CK_OBJECT_HANDLE, CK_SESSION_HANDLE, CK_SLOT_ID, CK_ULONG, CK_UTF8CHAR_PTR,
    CKF_RW_SESSION, CKF_SERIAL_SESSION, CKR_OK, CKR_USER_ALREADY_LOGGED_IN, CKU_USER,
};
use tracing::{debug, warn};

use crate::{
    AttributeFetchConfig, HError, HResult, Session, hsm_lib::HsmLib,
    instrumented::InstrumentedDevice,
};

// 100 handles
const OBJECT_HANDLES_CACHE_SIZE: NonZeroUsize = NonZeroUsize::MIN.saturating_add(99);

/// An LRU cache of object handles, keyed by object label.
pub struct ObjectHandlesCache(Mutex<LruCache<Vec<u8>, CK_OBJECT_HANDLE>>);

impl Default for ObjectHandlesCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectHandlesCache {
    #[must_use]
    pub fn new() -> Self {
        Self(Mutex::new(LruCache::new(OBJECT_HANDLES_CACHE_SIZE)))
    }

    fn lock(&self) -> HResult<std::sync::MutexGuard<'_, LruCache<Vec<u8>, CK_OBJECT_HANDLE>>> {
        self.0
            .lock()
            .map_err(|e| HError::Default(format!("Failed to lock the handles cache: {e}")))
    }

    pub fn get(&self, label: &[u8]) -> HResult<Option<CK_OBJECT_HANDLE>> {
        Ok(self.lock()?.get(label).copied())
    }

    pub fn insert(&self, label: Vec<u8>, handle: CK_OBJECT_HANDLE) -> HResult<()> {
        self.lock()?.put(label, handle);
        Ok(())
    }

    pub fn remove_handle(&self, handle: CK_OBJECT_HANDLE) -> HResult<()> {
        let mut cache = self.lock()?;
        let labels: Vec<Vec<u8>> = cache
            .iter()
            .filter(|(_, h)| **h == handle)
            .map(|(label, _)| label.clone())
            .collect();
        for label in labels {
            cache.pop(&label);
        }
        Ok(())
    }

    pub fn clear(&self) -> HResult<()> {
        self.lock()?.clear();
        Ok(())
    }
}

/// A PKCS#11 slot of the HSM.
///
/// When a password is configured, a logged-in session is kept open for the
/// lifetime of the manager: PKCS#11 logins apply to every session of the slot.
pub struct SlotManager {
    hsm_lib: Arc<HsmLib>,
    device: Arc<InstrumentedDevice<Arc<HsmLib>>>,
    slot_id: usize,
    object_handles_cache: Arc<ObjectHandlesCache>,
    fetch_config: Arc<AttributeFetchConfig>,
    _login_session: Option<Session>,
}

impl SlotManager {
    /// Create a manager for `slot_id`, logging in when a password is provided.
    ///
    /// # Errors
    /// * If the login session cannot be opened or the login fails
    pub(crate) fn instantiate(
        hsm_lib: Arc<HsmLib>,
        device: Arc<InstrumentedDevice<Arc<HsmLib>>>,
        slot_id: usize,
        login_password: Option<String>,
        fetch_config: Arc<AttributeFetchConfig>,
    ) -> HResult<Self> {
        let object_handles_cache = Arc::new(ObjectHandlesCache::new());
        let mut slot = Self {
            hsm_lib,
            device,
            slot_id,
            object_handles_cache,
            fetch_config,
            _login_session: None,
        };
        if let Some(password) = login_password {
            slot._login_session = Some(slot.open_session_(false, Some(password))?);
        }
        Ok(slot)
    }

    #[must_use]
    pub const fn slot_id(&self) -> usize {
        self.slot_id
    }

    /// Open a new session on the slot.
    /// The session is closed when dropped.
    ///
    /// # Errors
    /// * If `C_OpenSession` is not available or fails
    pub fn open_session(&self, read_write: bool) -> HResult<Session> {
        self.open_session_(read_write, None)
    }

    #[allow(unsafe_code)]
    fn open_session_(&self, read_write: bool, login_password: Option<String>) -> HResult<Session> {
        let slot_id = CK_SLOT_ID::try_from(self.slot_id)?;
        let flags: CK_FLAGS = if read_write {
            CKF_RW_SESSION | CKF_SERIAL_SESSION
        } else {
            CKF_SERIAL_SESSION
        };
        let mut session_handle: CK_SESSION_HANDLE = 0;
        let rv = match self.hsm_lib.C_OpenSession {
            Some(func) => unsafe {
                func(
                    slot_id,
                    flags,
                    ptr::null_mut(),
                    None,
                    &raw mut session_handle,
                )
            },
            None => {
                return Err(HError::Default(
                    "C_OpenSession not available on library".to_owned(),
                ));
            }
        };
        if rv != CKR_OK {
            return Err(HError::Default(format!(
                "Failed opening a session on slot {}: {rv:#x}",
                self.slot_id
            )));
        }
        debug!("Opened session {session_handle} on slot {}", self.slot_id);
        // dropping the session closes it if the login fails
        let mut session = Session::new(
            self.device.clone(),
            session_handle,
            self.object_handles_cache.clone(),
            self.fetch_config.clone(),
        );
        if let Some(password) = login_password {
            let mut pwd_bytes = zeroize::Zeroizing::new(password.into_bytes());
            let rv = match self.hsm_lib.C_Login {
                Some(func) => unsafe {
                    func(
                        session_handle,
                        CKU_USER,
                        pwd_bytes.as_mut_ptr() as CK_UTF8CHAR_PTR,
                        CK_ULONG::try_from(pwd_bytes.len())?,
                    )
                },
                None => {
                    return Err(HError::Default(
                        "C_Login not available on library".to_owned(),
                    ));
                }
            };
            if rv == CKR_USER_ALREADY_LOGGED_IN {
                warn!("user already logged in, ignoring logging");
            } else if rv != CKR_OK {
                return Err(HError::Default(format!("Failed logging in: {rv:#x}")));
            } else {
                session.set_logged_in();
            }
        }
        Ok(session)
    }
}
