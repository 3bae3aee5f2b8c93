// Copyright © 2026 The Viona Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
//! Revocable guest-memory lease.
//!
//! A [`Lease`] is a capability to translate guest-physical addresses to
//! host-virtual pointers. It is signed against a [`GuestHold`] (the
//! hypervisor-side object that owns the actual mapping) and can be
//! soft-expired (a notification that the mapping will go away) or hard-broken
//! (the mapping is actually gone). Translation only succeeds while the lease
//! is neither broken nor unsigned.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use thiserror::Error;
use vm_memory::{Bytes, GuestAddress, GuestMemory, GuestMemoryAtomic, GuestMemoryMmap};

/// The hypervisor-side collaborator that actually owns the guest mapping.
///
/// This is the out-of-scope hypervisor driver facility; `viona-lease` only
/// needs enough of its contract to sign and renew a lease against it.
pub trait GuestHold: Send + Sync {
    /// `true` once the hold has begun tearing down. `sign` must fail after
    /// this returns `true`.
    fn is_closing(&self) -> bool;

    /// A fresh snapshot of the guest's mapped memory, valid until the next
    /// `break` notification.
    fn memory(&self) -> GuestMemoryAtomic<GuestMemoryMmap>;
}

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("hypervisor hold is closing, cannot sign a new lease")]
    HoldClosing,
    #[error("lease is expired or broken")]
    Expired,
    #[error("translation of {len} bytes at {gpa:#x} crosses a region boundary or is unmapped")]
    OutOfRange { gpa: u64, len: usize },
}

struct Inner {
    memory: Mutex<Option<GuestMemoryAtomic<GuestMemoryMmap>>>,
    expired: AtomicBool,
    broken: AtomicBool,
    outstanding: AtomicU64,
    on_expire: Box<dyn Fn() + Send + Sync>,
}

/// A revocable, renewable capability to translate guest-physical addresses.
///
/// Cloning a `Lease` shares the same underlying state; this mirrors the
/// ring holding a single lease pointer that multiple call sites (the worker,
/// an RX callback, a control operation) may observe concurrently.
#[derive(Clone)]
pub struct Lease {
    inner: Arc<Inner>,
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("expired", &self.expired())
            .field("broken", &self.inner.broken.load(Ordering::Acquire))
            .field("outstanding", &self.inner.outstanding.load(Ordering::Acquire))
            .finish()
    }
}

impl Lease {
    /// Signs a new lease against `hold`. Fails if the hold is already
    /// tearing down.
    ///
    /// `on_expire` is invoked from [`Lease::notify_expired`], which may run
    /// in whatever context the hypervisor integration calls it from (e.g. a
    /// callback off an interrupt path); per the design notes it must do
    /// nothing more than wake a condition variable, so it is stored verbatim
    /// and never called from within a lock held by `Lease` itself.
    pub fn sign<F>(hold: &dyn GuestHold, on_expire: F) -> Result<Lease, LeaseError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if hold.is_closing() {
            return Err(LeaseError::HoldClosing);
        }
        Ok(Lease {
            inner: Arc::new(Inner {
                memory: Mutex::new(Some(hold.memory())),
                expired: AtomicBool::new(false),
                broken: AtomicBool::new(false),
                outstanding: AtomicU64::new(0),
                on_expire: Box::new(on_expire),
            }),
        })
    }

    /// Soft-expiry notification: the mapping is about to be revoked. Callers
    /// should drop cached pointers and quiesce outstanding users, then call
    /// [`Lease::renew`]. Does not itself invalidate `translate`; the actual
    /// teardown happens at [`Lease::break_lease`].
    pub fn notify_expired(&self) {
        self.inner.expired.store(true, Ordering::Release);
        (self.inner.on_expire)();
    }

    /// Whether `notify_expired` has fired since the last successful `renew`.
    pub fn expired(&self) -> bool {
        self.inner.expired.load(Ordering::Acquire)
    }

    /// Hard revocation: the mapping is gone. `translate` fails from this
    /// point on until `renew` succeeds.
    pub fn break_lease(&self) {
        debug!("lease broken");
        *self.inner.memory.lock().unwrap() = None;
        self.inner.broken.store(true, Ordering::Release);
    }

    /// Re-signs the lease against a (possibly new) guest memory snapshot.
    /// Callers must ensure there are no outstanding derived references (the
    /// ring's own outstanding-transfer counter, not this lease's internal
    /// reader count) before calling this, per §5's "resource lifetime" rule.
    pub fn renew(&self, hold: &dyn GuestHold) -> Result<(), LeaseError> {
        if hold.is_closing() {
            return Err(LeaseError::HoldClosing);
        }
        *self.inner.memory.lock().unwrap() = Some(hold.memory());
        self.inner.expired.store(false, Ordering::Release);
        self.inner.broken.store(false, Ordering::Release);
        debug!("lease renewed");
        Ok(())
    }

    /// Translates a guest-physical range to a host-virtual slice. Fails if
    /// the lease is broken/unsigned, or if the range is not entirely within
    /// one mapped guest region.
    pub fn translate(&self, gpa: u64, len: usize) -> Result<HostSlice, LeaseError> {
        if self.inner.broken.load(Ordering::Acquire) {
            return Err(LeaseError::Expired);
        }
        let guard = self.inner.memory.lock().unwrap();
        let atomic = guard.as_ref().ok_or(LeaseError::Expired)?;
        let mem = atomic.memory();
        if len == 0 {
            return Err(LeaseError::OutOfRange { gpa, len });
        }
        let addr = GuestAddress(gpa);
        // A successful get_slice proves `len` bytes at `addr` lie entirely
        // within one mapped region; the slice itself is discarded, reads and
        // writes go through Bytes::{read_slice,write_slice} on demand so a
        // HostSlice is a plain (address, length) pair rather than borrowing
        // from `mem`.
        match mem.memory().get_slice(addr, len) {
            Ok(_) => Ok(HostSlice { mem: atomic.memory(), addr, len }),
            Err(_) => Err(LeaseError::OutOfRange { gpa, len }),
        }
    }

    /// Returns the raw guest memory container backing this lease, for
    /// callers that need repeated volatile access (e.g. the descriptor
    /// table and avail/used rings) rather than one-shot [`translate`]
    /// lookups. Subject to the same validity rule as `translate`.
    ///
    /// [`translate`]: Lease::translate
    pub fn guest_memory(&self) -> Result<GuestMemoryAtomic<GuestMemoryMmap>, LeaseError> {
        if self.inner.broken.load(Ordering::Acquire) {
            return Err(LeaseError::Expired);
        }
        self.inner
            .memory
            .lock()
            .unwrap()
            .clone()
            .ok_or(LeaseError::Expired)
    }

    /// Takes a reader reference, preventing a concurrent `break_lease` from
    /// being logically "clean" until it is dropped. This models the design
    /// note that data-plane code caching pointers "takes a read-lock on the
    /// lease, relinquishes it before sleeping on the CV, and re-acquires
    /// after wake."
    pub fn hold_reader(&self) -> LeaseReader {
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        LeaseReader { inner: self.inner.clone() }
    }

    /// Number of live [`LeaseReader`] guards.
    pub fn outstanding_readers(&self) -> u64 {
        self.inner.outstanding.load(Ordering::Acquire)
    }
}

/// RAII guard returned by [`Lease::hold_reader`].
pub struct LeaseReader {
    inner: Arc<Inner>,
}

impl Drop for LeaseReader {
    fn drop(&mut self) {
        let prev = self.inner.outstanding.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            warn!("lease reader count underflowed, this is a bug");
        }
    }
}

/// A validated, in-bounds view into guest memory produced by
/// [`Lease::translate`].
pub struct HostSlice {
    mem: Arc<GuestMemoryMmap>,
    addr: GuestAddress,
    len: usize,
}

impl HostSlice {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies `dst.len()` bytes (capped at this slice's length) out of guest
    /// memory starting at the slice's base address.
    pub fn read(&self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.len);
        match self.mem.read_slice(&mut dst[..n], self.addr) {
            Ok(()) => n,
            Err(_) => 0,
        }
    }

    /// Copies `src` into guest memory starting at the slice's base address,
    /// capped at this slice's length.
    pub fn write(&self, src: &[u8]) -> usize {
        let n = src.len().min(self.len);
        match self.mem.write_slice(&src[..n], self.addr) {
            Ok(()) => n,
            Err(_) => 0,
        }
    }

    pub fn base_gpa(&self) -> u64 {
        self.addr.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use vm_memory::GuestMemoryMmap;

    struct TestHold {
        closing: AtomicBool,
        expire_count: AtomicUsize,
        mem: GuestMemoryAtomic<GuestMemoryMmap>,
    }

    impl TestHold {
        fn new() -> Self {
            let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x1_0000)]).unwrap();
            TestHold {
                closing: AtomicBool::new(false),
                expire_count: AtomicUsize::new(0),
                mem: GuestMemoryAtomic::new(mem),
            }
        }
    }

    impl GuestHold for TestHold {
        fn is_closing(&self) -> bool {
            self.closing.load(Ordering::Acquire)
        }
        fn memory(&self) -> GuestMemoryAtomic<GuestMemoryMmap> {
            self.mem.clone()
        }
    }

    #[test]
    fn sign_fails_when_closing() {
        let hold = TestHold::new();
        hold.closing.store(true, Ordering::Release);
        assert!(matches!(Lease::sign(&hold, || {}), Err(LeaseError::HoldClosing)));
    }

    #[test]
    fn translate_roundtrip() {
        let hold = TestHold::new();
        let lease = Lease::sign(&hold, || {}).unwrap();
        let slice = lease.translate(0x100, 16).unwrap();
        assert_eq!(slice.write(&[0xaa; 16]), 16);
        let mut buf = [0u8; 16];
        assert_eq!(slice.read(&mut buf), 16);
        assert_eq!(buf, [0xaa; 16]);
    }

    #[test]
    fn translate_out_of_range_fails() {
        let hold = TestHold::new();
        let lease = Lease::sign(&hold, || {}).unwrap();
        assert!(lease.translate(0xffff_0000, 16).is_err());
    }

    #[test]
    fn expire_then_renew() {
        let hold = TestHold::new();
        let notified = Arc::new(AtomicBool::new(false));
        let notified2 = notified.clone();
        let lease = Lease::sign(&hold, move || notified2.store(true, Ordering::Release)).unwrap();

        lease.notify_expired();
        assert!(lease.expired());
        assert!(notified.load(Ordering::Acquire));
        // translate still works until the lease is actually broken.
        assert!(lease.translate(0x0, 8).is_ok());

        lease.break_lease();
        assert!(lease.translate(0x0, 8).is_err());

        lease.renew(&hold).unwrap();
        assert!(!lease.expired());
        assert!(lease.translate(0x0, 8).is_ok());
    }

    #[test]
    fn reader_guard_tracks_outstanding() {
        let hold = TestHold::new();
        let lease = Lease::sign(&hold, || {}).unwrap();
        assert_eq!(lease.outstanding_readers(), 0);
        let r1 = lease.hold_reader();
        let r2 = lease.hold_reader();
        assert_eq!(lease.outstanding_readers(), 2);
        drop(r1);
        assert_eq!(lease.outstanding_readers(), 1);
        drop(r2);
        assert_eq!(lease.outstanding_readers(), 0);
    }
}
