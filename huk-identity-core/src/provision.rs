//! Hand-off of the issued device certificate between the CA response
//! handler and the threads waiting to connect.
//!
//! A single record is guarded by a mutex and a condition variable. The
//! record is replaced whole under the lock and the waiters are woken only
//! afterwards, so no reader can see a half-written record.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{IdentityError, IdentityResult};

/// Certificate and hub endpoint handed out by the CA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRecord {
    /// DER-encoded device certificate.
    pub cert_der: Vec<u8>,
    /// Hub host name.
    pub hubname: String,
    /// Hub port.
    pub hubport: u16,
}

impl ProvisionRecord {
    /// Number of bytes [`Provisioner::get`] writes for this record.
    #[must_use]
    pub fn serialized_len(&self) -> usize {
        self.cert_der.len() + self.hubname.len() + 1 + 2
    }
}

/// Provisioning synchronizer.
///
/// One producer calls [`Provisioner::store`]; any number of consumers block
/// in [`Provisioner::wait_until_provisioned`] and read the record with
/// [`Provisioner::get`] or [`Provisioner::record`].
#[derive(Debug, Default)]
pub struct Provisioner {
    record: Mutex<Option<ProvisionRecord>>,
    provisioned: Condvar,
}

impl Provisioner {
    /// Creates an empty synchronizer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // The record is only ever replaced as a whole, so a poisoned lock still
    // guards a consistent value.
    fn lock(&self) -> MutexGuard<'_, Option<ProvisionRecord>> {
        self.record
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Stores `record` and wakes every waiter.
    ///
    /// A later call overwrites the earlier record and wakes waiters again.
    pub fn store(&self, record: ProvisionRecord) {
        let mut guard = self.lock();
        log::info!(
            "device provisioned: {} bytes of certificate, hub {}:{}",
            record.cert_der.len(),
            record.hubname,
            record.hubport
        );
        *guard = Some(record);
        self.provisioned.notify_all();
    }

    /// Whether a record has been stored.
    #[must_use]
    pub fn is_provisioned(&self) -> bool {
        self.lock().is_some()
    }

    /// Blocks until a record has been stored.
    pub fn wait_until_provisioned(&self) {
        let guard = self.lock();
        let _guard = self
            .provisioned
            .wait_while(guard, |record| record.is_none())
            .unwrap_or_else(std::sync::PoisonError::into_inner);
    }

    /// Blocks until a record has been stored or `timeout` elapses.
    ///
    /// Returns `true` if the device is provisioned on return.
    #[must_use]
    pub fn wait_until_provisioned_timeout(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait_until_provisioned();
            return true;
        };
        let mut guard = self.lock();
        while guard.is_none() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                log::warn!("gave up waiting for provisioning after {timeout:?}");
                return false;
            }
            guard = self
                .provisioned
                .wait_timeout(guard, remaining)
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .0;
        }
        true
    }

    /// A copy of the stored record.
    ///
    /// # Errors
    ///
    /// Returns `NotProvisioned` if nothing has been stored yet.
    pub fn record(&self) -> IdentityResult<ProvisionRecord> {
        self.lock().clone().ok_or(IdentityError::NotProvisioned)
    }

    /// Copies the record into `buf` as `cert || hubname || 0x00 || port`,
    /// the port in network byte order.
    ///
    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// - `NotProvisioned` if nothing has been stored yet.
    /// - `BufferTooSmall` if any segment does not fit. Segments before the
    ///   failing one may already have been written.
    pub fn get(&self, buf: &mut [u8]) -> IdentityResult<usize> {
        let guard = self.lock();
        let record = guard.as_ref().ok_or(IdentityError::NotProvisioned)?;

        let mut pos = 0;
        let mut put = |bytes: &[u8]| -> IdentityResult<()> {
            let end = pos + bytes.len();
            let dest = buf.get_mut(pos..end).ok_or(IdentityError::BufferTooSmall)?;
            dest.copy_from_slice(bytes);
            pos = end;
            Ok(())
        };

        put(&record.cert_der)?;
        put(record.hubname.as_bytes())?;
        put(&[0])?;
        put(&record.hubport.to_be_bytes())?;
        Ok(pos)
    }
}
