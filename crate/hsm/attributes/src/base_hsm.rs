use std::{
    collections::HashMap,
    fmt,
    fmt::{Display, Formatter},
    sync::{Arc, Mutex},
};

use pkcs11_sys::CK_INFO;
use tracing::debug;

use crate::{
    AttributeFetchConfig, HError, HResult, SlotManager,
    hsm_call,
    hsm_lib::HsmLib,
    instrumented::{CallStats, InstrumentedDevice},
};

struct SlotState {
    password: Option<String>,
    slot: Option<Arc<SlotManager>>,
}

/// A PKCS#11 HSM library and the slots it is allowed to use.
pub struct BaseHsm {
    hsm_lib: Arc<HsmLib>,
    device: Arc<InstrumentedDevice<Arc<HsmLib>>>,
    fetch_config: Arc<AttributeFetchConfig>,
    slots: Mutex<HashMap<usize, SlotState>>,
}

impl BaseHsm {
    /// Load and initialize the PKCS#11 library at `path`.
    ///
    /// `passwords` lists the slots that may be used, with the optional
    /// user password to log in with.
    pub fn instantiate<P: AsRef<std::ffi::OsStr>>(
        path: P,
        passwords: HashMap<usize, Option<String>>,
        fetch_config: AttributeFetchConfig,
    ) -> HResult<Self> {
        debug!("Loading PKCS#11 library with attribute fetch config {fetch_config:?}");
        let hsm_lib = Arc::new(HsmLib::instantiate(path)?);
        let device = Arc::new(InstrumentedDevice::new(hsm_lib.clone()));
        let slots = passwords
            .into_iter()
            .map(|(slot_id, password)| {
                (
                    slot_id,
                    SlotState {
                        password,
                        slot: None,
                    },
                )
            })
            .collect();
        Ok(Self {
            hsm_lib,
            device,
            fetch_config: Arc::new(fetch_config),
            slots: Mutex::new(slots),
        })
    }

    /// Get a slot
    /// If a slot has already been opened, returns the opened slot.
    /// To close a slot before re-opening it with another password, call `close_slot()` first
    pub fn get_slot(&self, slot_id: usize) -> HResult<Arc<SlotManager>> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| HError::Default("Failed to acquire lock on slots".to_owned()))?;
        let slot_state = slots
            .get_mut(&slot_id)
            .ok_or_else(|| HError::Default(format!("slot {slot_id} is not accessible")))?;
        if let Some(s) = &slot_state.slot {
            return Ok(s.clone());
        }
        let manager = Arc::new(SlotManager::instantiate(
            self.hsm_lib.clone(),
            self.device.clone(),
            slot_id,
            slot_state.password.clone(),
            self.fetch_config.clone(),
        )?);
        slot_state.slot = Some(manager.clone());
        Ok(manager)
    }

    /// Drop the opened slot manager, logging out of the slot once the last
    /// session referencing it is gone. The slot stays accessible.
    pub fn close_slot(&self, slot_id: usize) -> HResult<()> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| HError::Default("Failed to acquire lock on slots".to_owned()))?;
        if let Some(slot_state) = slots.get_mut(&slot_id) {
            slot_state.slot = None;
        }
        Ok(())
    }

    pub fn get_info(&self) -> HResult<Info> {
        let mut info = CK_INFO::default();
        hsm_call!(
            self.hsm_lib,
            "Failed getting HSM info",
            C_GetInfo,
            &raw mut info
        );
        Ok(info.into())
    }

    /// Statistics of the PKCS#11 calls made through this HSM, keyed by function name
    pub fn call_metrics(&self) -> HResult<HashMap<&'static str, CallStats>> {
        self.device.metrics()
    }
}

/// PKCS#11 strings are padded with blanks, not NUL terminated
fn blank_padded_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches([' ', '\0'])
        .to_owned()
}

pub struct Info {
    pub cryptokiVersion: (u8, u8),
    pub manufacturerID: String,
    pub flags: u64,
    pub libraryDescription: String,
    pub libraryVersion: (u8, u8),
}

impl From<CK_INFO> for Info {
    fn from(info: CK_INFO) -> Self {
        #[cfg(target_os = "windows")]
        let flags = u64::from(info.flags);
        #[cfg(not(target_os = "windows"))]
        let flags = info.flags;
        Self {
            cryptokiVersion: (info.cryptokiVersion.major, info.cryptokiVersion.minor),
            manufacturerID: blank_padded_string(&info.manufacturerID),
            flags,
            libraryDescription: blank_padded_string(&info.libraryDescription),
            libraryVersion: (info.libraryVersion.major, info.libraryVersion.minor),
        }
    }
}

impl Display for Info {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cryptoki Version: {}.{}\nManufacturer ID: {}\nLibrary Description: {}\nLibrary \
             Version: {}.{}",
            self.cryptokiVersion.0,
            self.cryptokiVersion.1,
            self.manufacturerID,
            self.libraryDescription,
            self.libraryVersion.0,
            self.libraryVersion.1
        )
    }
}
