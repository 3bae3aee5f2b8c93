// Copyright © 2026 The Viona Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! TX reclamation descriptors (§4.5, §9 "Reclamation descriptors").
//!
//! The zero-copy TX path wraps each guest-backed segment of a frame in a
//! block that shares a refcounted record with the other segments of the
//! same chain. The record is preallocated per ring slot (indexed by the
//! descriptor cookie, which is always `< ring size`), so claiming one on the
//! hot path never allocates. When the last live block drops its reference,
//! the chain's used-ring completion is pushed and the ring's
//! outstanding-transfer count is decremented.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Up to `sizeof(Ethernet) + VLAN + IPv4(max) + TCP(max)` bytes, always
/// copied out of guest memory before any hardware parsing (§4.5).
pub const VIONA_MAX_HDRS_LEN: usize = 138;

/// One per-ring-slot reclamation record.
pub struct ReclaimSlot {
    /// 0 when free; while claimed, counts the number of live zero-copy
    /// blocks (including the claiming TX engine's own initial hold) still
    /// referencing guest memory through this slot.
    refs: AtomicU32,
    cookie: Mutex<u16>,
    len: Mutex<u32>,
    header: Mutex<[u8; VIONA_MAX_HDRS_LEN]>,
}

impl Default for ReclaimSlot {
    fn default() -> Self {
        ReclaimSlot {
            refs: AtomicU32::new(0),
            cookie: Mutex::new(0),
            len: Mutex::new(0),
            header: Mutex::new([0u8; VIONA_MAX_HDRS_LEN]),
        }
    }
}

impl ReclaimSlot {
    /// Attempts to claim this slot for a fresh TX chain. Fails (returns
    /// `false`) if a prior chain reusing the same descriptor index has not
    /// yet been fully reclaimed -- per §4.5, that data is simply dropped.
    pub fn try_claim(&self, cookie: u16) -> bool {
        if self.refs.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire) != Ok(0) {
            return false;
        }
        *self.cookie.lock().unwrap() = cookie;
        true
    }

    /// Adds one reference, for each additional zero-copy block built from
    /// this chain (or the extra hold taken across a TX hook callout).
    pub fn add_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Releases one reference. Returns `true` if this was the final
    /// reference (the slot is now free and its completion is ready to be
    /// pushed to the used ring by the caller).
    pub fn release(&self) -> bool {
        self.refs.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub fn set_total_len(&self, len: u32) {
        *self.len.lock().unwrap() = len;
    }

    /// Takes the `(cookie, len)` pair and resets the slot to free. Callers
    /// must only do this once `release()` has reported the final reference.
    pub fn take_completion(&self) -> (u16, u32) {
        let cookie = *self.cookie.lock().unwrap();
        let len = *self.len.lock().unwrap();
        *self.len.lock().unwrap() = 0;
        *self.cookie.lock().unwrap() = 0;
        self.refs.store(0, Ordering::Release);
        (cookie, len)
    }

    /// Forcibly resets an abandoned claim (e.g. on an allocation failure
    /// before any block was built), without pushing a completion.
    pub fn abandon(&self) {
        *self.len.lock().unwrap() = 0;
        *self.cookie.lock().unwrap() = 0;
        self.refs.store(0, Ordering::Release);
    }

    pub fn write_header(&self, bytes: &[u8]) -> usize {
        let mut hdr = self.header.lock().unwrap();
        let n = bytes.len().min(hdr.len());
        hdr[..n].copy_from_slice(&bytes[..n]);
        n
    }

    pub fn header_byte(&self, index: usize) -> u8 {
        self.header.lock().unwrap()[index]
    }

    pub fn header_slice<T>(&self, f: impl FnOnce(&[u8]) -> T) -> T {
        f(&*self.header.lock().unwrap())
    }
}

/// Per-ring preallocated reclamation slots, one per descriptor index.
#[derive(Default)]
pub struct TxScratch {
    slots: Vec<ReclaimSlot>,
}

impl TxScratch {
    pub fn new(size: u16) -> Self {
        let mut slots = Vec::with_capacity(size as usize);
        slots.resize_with(size as usize, ReclaimSlot::default);
        TxScratch { slots }
    }

    pub fn slot(&self, cookie: u16) -> &ReclaimSlot {
        &self.slots[cookie as usize]
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
