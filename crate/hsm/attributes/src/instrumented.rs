//! Call counters around an [`AttributeDevice`].

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use pkcs11_sys::{CK_OBJECT_HANDLE, CK_RV, CK_SESSION_HANDLE, CKR_OK};
use tracing::trace;

use crate::{
    HError, HResult,
    device::{AttributeDevice, AttributeRequest, RoundResponse},
};

const GET_ATTRIBUTE_VALUE: &str = "C_GetAttributeValue";

/// Statistics of one PKCS#11 function
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallStats {
    /// Number of calls started
    pub attempts: u64,
    /// Number of calls that returned `CKR_OK`
    pub successes: u64,
    /// Non `CKR_OK` return codes, by code
    pub return_codes: HashMap<CK_RV, u64>,
    /// Number of calls that failed in the binding before returning a code
    pub errors: u64,
    pub total_duration: Duration,
}

/// Decorates a device with per function call statistics.
///
/// ```ignore
/// let device = InstrumentedDevice::new(hsm_lib);
/// let attributes = GetAttributeProcess::new(&device, session, object, &strategy, FetchMode::Batch)
///     .fetch(&[CKA_LABEL])?;
/// let stats = device.metrics();
/// ```
pub struct InstrumentedDevice<D> {
    inner: D,
    stats: Mutex<HashMap<&'static str, CallStats>>,
}

impl<D> InstrumentedDevice<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            stats: Mutex::new(HashMap::new()),
        }
    }

    pub const fn inner(&self) -> &D {
        &self.inner
    }

    /// A snapshot of the statistics, keyed by PKCS#11 function name
    pub fn metrics(&self) -> HResult<HashMap<&'static str, CallStats>> {
        Ok(self
            .stats
            .lock()
            .map_err(|e| HError::Default(format!("Failed to acquire call metrics lock: {e}")))?
            .clone())
    }

    fn record(&self, name: &'static str, update: impl FnOnce(&mut CallStats)) -> HResult<()> {
        let mut stats = self
            .stats
            .lock()
            .map_err(|e| HError::Default(format!("Failed to acquire call metrics lock: {e}")))?;
        update(stats.entry(name).or_default());
        Ok(())
    }
}

impl<D: AttributeDevice> AttributeDevice for InstrumentedDevice<D> {
    fn get_attribute_values(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        requests: &[AttributeRequest],
    ) -> HResult<RoundResponse> {
        self.record(GET_ATTRIBUTE_VALUE, |stats| stats.attempts += 1)?;
        let start = Instant::now();
        let result = self.inner.get_attribute_values(session, object, requests);
        let elapsed = start.elapsed();
        trace!("{GET_ATTRIBUTE_VALUE} on object {object} took {elapsed:?}");
        self.record(GET_ATTRIBUTE_VALUE, |stats| {
            stats.total_duration += elapsed;
            match &result {
                Ok(response) if response.status == CKR_OK => stats.successes += 1,
                Ok(response) => *stats.return_codes.entry(response.status).or_default() += 1,
                Err(_) => stats.errors += 1,
            }
        })?;
        result
    }
}
