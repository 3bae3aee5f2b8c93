// Copyright © 2026 The Viona Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! The per-virtqueue state machine and descriptor chain parser (§4.2, §4.3).
//!
//! A [`Ring`] owns exactly one virtqueue: its mapped geometry, its avail/used
//! cursors, the RESET/SETUP/INIT/RUN state machine, and -- for TX rings using
//! the zero-copy path -- the preallocated [`reclaim`] slots. The datapath
//! (`pop_chain`, `push`, `push_mrgrx`) never takes the state lock; callers
//! are expected to have already established (via the state machine) that the
//! ring is in `Run` and its lease is live.

use std::num::Wrapping;
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, RwLock};
use std::time::Duration;

use log::{debug, warn};
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

use viona_lease::{HostSlice, Lease};

use crate::desc::{Descriptor, UsedElem, VIRTQ_DESC_F_NEXT, VTNET_MAXSEGS};
use crate::errors::{PopError, RingMapError};
use crate::reclaim::{ReclaimSlot, TxScratch};
use crate::stats::RingStats;

const DESC_SIZE: u64 = 16;

/// Mapped, validated ring geometry. Rebuilt on every `RING_INIT`/renew.
struct Geometry {
    desc_table: GuestAddress,
    avail_ring: GuestAddress,
    used_ring: GuestAddress,
    size: u16,
    qmask: u16,
}

/// Coarse ring lifecycle (§4.3). Mirrors the four states a virtqueue can be
/// in between `RING_INIT` and the next `RING_RESET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingState {
    Reset,
    Setup,
    Init,
    Run,
}

/// Orthogonal request bits layered on top of [`RingState`] (§4.3).
pub const REQ_START: u8 = 0x1;
pub const REQ_STOP: u8 = 0x2;
pub const RENEW: u8 = 0x4;

struct LockState {
    state: RingState,
    flags: u8,
    outstanding: u64,
    msi: Option<(u32, u32)>,
}

/// One guest-controlled descriptor buffer, resolved through the ring's
/// lease. Readable segments carry guest-supplied frame data (TX); writable
/// segments are host-to-guest delivery buffers (RX).
pub struct ChainSegment {
    pub slice: HostSlice,
    pub writable: bool,
}

/// The result of a successful [`Ring::pop_chain`]: a head descriptor index
/// (used verbatim as the used-ring completion id) and its flattened list of
/// segments, direct and/or indirect.
pub struct PoppedChain {
    pub cookie: u16,
    pub segments: Vec<ChainSegment>,
}

impl PoppedChain {
    pub fn readable(&self) -> impl Iterator<Item = &ChainSegment> {
        self.segments.iter().filter(|s| !s.writable)
    }

    pub fn writable(&self) -> impl Iterator<Item = &ChainSegment> {
        self.segments.iter().filter(|s| s.writable)
    }

    pub fn total_readable_len(&self) -> u64 {
        self.readable().map(|s| s.slice.len() as u64).sum()
    }
}

/// A single virtqueue's geometry, cursors, and lifecycle state.
pub struct Ring {
    lease: Lease,
    geometry: RwLock<Option<Geometry>>,
    avail_idx: Mutex<Wrapping<u16>>,
    used_idx: Mutex<Wrapping<u16>>,
    lock: Mutex<LockState>,
    cv: Condvar,
    intr_enabled: AtomicBool,
    tx: RwLock<Option<TxScratch>>,
    pub stats: RingStats,
}

impl Ring {
    pub fn new(lease: Lease) -> Self {
        Ring {
            lease,
            geometry: RwLock::new(None),
            avail_idx: Mutex::new(Wrapping(0)),
            used_idx: Mutex::new(Wrapping(0)),
            lock: Mutex::new(LockState {
                state: RingState::Reset,
                flags: 0,
                outstanding: 0,
                msi: None,
            }),
            cv: Condvar::new(),
            intr_enabled: AtomicBool::new(false),
            tx: RwLock::new(None),
            stats: RingStats::default(),
        }
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Current queue size, or 0 if the ring has never been mapped. Used by
    /// the TX worker to bound how many chains it drains per pass before
    /// yielding (§4.5 step 2).
    pub fn size(&self) -> u16 {
        self.geometry.read().unwrap().as_ref().map_or(0, |g| g.size)
    }

    pub fn state(&self) -> RingState {
        self.lock.lock().unwrap().state
    }

    pub fn flags(&self) -> u8 {
        self.lock.lock().unwrap().flags
    }

    // ---- state machine (§4.3) -------------------------------------------

    /// Validates and records ring geometry, transitioning `Reset -> Setup`.
    /// `qsz` must be a power of two, per §6. `zero_copy_slots`, when `Some`,
    /// preallocates that many TX reclamation slots (the link decides this
    /// once, at `force_tx_copy` configuration time, not per ring).
    #[allow(clippy::too_many_arguments)]
    pub fn map(
        &self,
        desc_table: u64,
        avail_ring: u64,
        used_ring: u64,
        qsz: u16,
        zero_copy_slots: Option<u16>,
    ) -> Result<(), RingMapError> {
        if qsz == 0 || !qsz.is_power_of_two() {
            return Err(RingMapError::BadSize);
        }
        let desc_bytes = qsz as u64 * DESC_SIZE;
        let avail_bytes = (qsz as u64 + 3) * 2;
        let used_bytes = (qsz as u64 * 8) + 6;

        self.lease
            .translate(desc_table, desc_bytes as usize)
            .map_err(|_| RingMapError::BadDescTable)?;
        self.lease
            .translate(avail_ring, avail_bytes as usize)
            .map_err(|_| RingMapError::BadAvailRing)?;
        self.lease
            .translate(used_ring, used_bytes as usize)
            .map_err(|_| RingMapError::BadUsedRing)?;

        *self.geometry.write().unwrap() = Some(Geometry {
            desc_table: GuestAddress(desc_table),
            avail_ring: GuestAddress(avail_ring),
            used_ring: GuestAddress(used_ring),
            size: qsz,
            qmask: qsz - 1,
        });
        *self.avail_idx.lock().unwrap() = Wrapping(0);
        *self.used_idx.lock().unwrap() = Wrapping(0);

        if let Some(n) = zero_copy_slots {
            *self.tx.write().unwrap() = Some(TxScratch::new(n));
        } else {
            *self.tx.write().unwrap() = None;
        }

        let mut l = self.lock.lock().unwrap();
        l.state = RingState::Setup;
        l.flags = 0;
        l.outstanding = 0;
        drop(l);
        self.cv.notify_all();
        Ok(())
    }

    pub fn unmap(&self) {
        *self.geometry.write().unwrap() = None;
        *self.tx.write().unwrap() = None;
    }

    /// Transitions `Setup -> Init`, broadcasting waiters (the worker thread
    /// blocked waiting for either `RUN` or a stop request).
    pub fn mark_init(&self) {
        let mut l = self.lock.lock().unwrap();
        if l.state == RingState::Setup {
            l.state = RingState::Init;
        }
        drop(l);
        self.cv.notify_all();
    }

    /// Transitions to `Run`, clearing `REQ_START`. Called by the worker once
    /// it is ready to begin draining the ring.
    pub fn mark_run(&self) {
        let mut l = self.lock.lock().unwrap();
        l.state = RingState::Run;
        l.flags &= !REQ_START;
        drop(l);
        self.cv.notify_all();
    }

    /// Blocks the calling (worker) thread until `REQ_START`, `REQ_STOP`, or
    /// `RENEW` is set, returning the flags observed.
    pub fn wait_for_work(&self) -> u8 {
        let mut l = self.lock.lock().unwrap();
        while l.flags == 0 {
            l = self.cv.wait(l).unwrap();
        }
        l.flags
    }

    pub fn clear_renew(&self) {
        let mut l = self.lock.lock().unwrap();
        l.flags &= !RENEW;
    }

    pub fn mark_renew(&self) {
        let mut l = self.lock.lock().unwrap();
        l.flags |= RENEW;
        drop(l);
        self.cv.notify_all();
    }

    /// Kick dispatch (§4.6 `RING_KICK`, ported from `viona_ioc_ring_kick`):
    /// in `Setup`/`Init` this records a deferred start request; in `Run` it
    /// just wakes the worker. Any other state is a caller error.
    pub fn kick(&self) -> bool {
        let mut l = self.lock.lock().unwrap();
        match l.state {
            RingState::Setup | RingState::Init => {
                l.flags |= REQ_START;
                drop(l);
                self.cv.notify_all();
                true
            }
            RingState::Run => {
                drop(l);
                self.cv.notify_all();
                true
            }
            RingState::Reset => false,
        }
    }

    /// Requests a full stop and blocks until the worker has driven the ring
    /// back to `Reset`. When `honor_interrupt` is given, the wait is
    /// performed in short slices so the caller can observe cancellation
    /// (this crate has no POSIX-signal analogue of `cv_wait_sig`; a polled
    /// `AtomicBool` stands in for it) and bail out early, leaving the ring
    /// mid-teardown for a subsequent retry.
    pub fn reset(&self, honor_interrupt: Option<&AtomicBool>) -> bool {
        let mut l = self.lock.lock().unwrap();
        if l.state == RingState::Reset {
            return true;
        }
        l.flags |= REQ_STOP;
        drop(l);
        self.cv.notify_all();

        let mut l = self.lock.lock().unwrap();
        loop {
            if l.state == RingState::Reset {
                return true;
            }
            match honor_interrupt {
                Some(flag) => {
                    let (guard, _timeout) =
                        self.cv.wait_timeout(l, Duration::from_millis(50)).unwrap();
                    l = guard;
                    if flag.load(Ordering::Acquire) && l.state != RingState::Reset {
                        return false;
                    }
                }
                None => {
                    l = self.cv.wait(l).unwrap();
                }
            }
        }
    }

    /// Called by the worker on its way out, once teardown is complete.
    pub fn mark_reset(&self) {
        let mut l = self.lock.lock().unwrap();
        l.state = RingState::Reset;
        l.flags = 0;
        l.outstanding = 0;
        drop(l);
        self.cv.notify_all();
    }

    pub fn outstanding(&self) -> u64 {
        self.lock.lock().unwrap().outstanding
    }

    pub fn outstanding_add(&self, n: u64) {
        let mut l = self.lock.lock().unwrap();
        l.outstanding += n;
    }

    pub fn outstanding_sub(&self, n: u64) {
        let mut l = self.lock.lock().unwrap();
        l.outstanding = l.outstanding.saturating_sub(n);
        if l.outstanding == 0 {
            drop(l);
            self.cv.notify_all();
        }
    }

    /// Blocks (uninterruptibly, like `viona_tx_wait_outstanding`: "paying
    /// heed to signals is counterproductive here") until every zero-copy
    /// transfer handed to the NIC driver has completed.
    pub fn wait_outstanding(&self) {
        let mut l = self.lock.lock().unwrap();
        while l.outstanding != 0 {
            l = self.cv.wait(l).unwrap();
        }
    }

    pub fn set_msi(&self, addr: u32, data: u32) {
        let mut l = self.lock.lock().unwrap();
        l.msi = if addr == 0 { None } else { Some((addr, data)) };
    }

    pub fn msi(&self) -> Option<(u32, u32)> {
        self.lock.lock().unwrap().msi
    }

    /// Edge-triggered host->guest readiness signal, used when no MSI address
    /// is configured. Returns `true` on the 0->1 transition (the caller
    /// should wake pollers exactly once).
    pub fn signal_edge(&self) -> bool {
        self.intr_enabled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn clear_edge(&self) -> bool {
        self.intr_enabled.swap(false, Ordering::AcqRel)
    }

    /// Read-only peek at the edge-readiness bit, for `INTR_POLL` (§4.7):
    /// unlike `clear_edge`, observing this never consumes the signal.
    pub fn intr_enabled(&self) -> bool {
        self.intr_enabled.load(Ordering::Acquire)
    }

    // ---- zero-copy TX scratch --------------------------------------------

    pub fn tx_zero_copy_enabled(&self) -> bool {
        self.tx.read().unwrap().is_some()
    }

    pub fn tx_slot_count(&self) -> usize {
        self.tx.read().unwrap().as_ref().map_or(0, TxScratch::len)
    }

    pub fn try_claim_tx_slot(&self, cookie: u16) -> Option<TxSlotHandle<'_>> {
        let guard = self.tx.read().unwrap();
        let scratch = guard.as_ref()?;
        if cookie as usize >= scratch.len() {
            return None;
        }
        if !scratch.slot(cookie).try_claim(cookie) {
            return None;
        }
        drop(guard);
        Some(TxSlotHandle { ring: self, cookie })
    }

    fn tx_slot(&self, cookie: u16) -> Option<ReclaimRef<'_>> {
        let guard = self.tx.read().unwrap();
        if guard.is_none() {
            return None;
        }
        Some(ReclaimRef { guard, cookie })
    }

    /// Releases one reference on a claimed TX slot (called by a zero-copy
    /// block's free callback, or by the TX engine itself when a fully
    /// copied frame completes immediately). When this was the final
    /// reference, pushes the chain's used-ring entry and decrements the
    /// outstanding-transfer count.
    pub fn release_tx_slot(&self, cookie: u16) {
        let is_final = {
            let guard = self.tx.read().unwrap();
            let scratch = match guard.as_ref() {
                Some(s) => s,
                None => return,
            };
            scratch.slot(cookie).release()
        };
        if !is_final {
            return;
        }
        let (id, len) = {
            let guard = self.tx.read().unwrap();
            guard.as_ref().unwrap().slot(cookie).take_completion()
        };
        self.push(id as u16, len);
        self.outstanding_sub(1);
        if let Some(edge) = self.msi_or_edge_fire() {
            debug!("tx completion delivered via {}", edge);
        }
    }

    fn msi_or_edge_fire(&self) -> Option<&'static str> {
        if self.msi().is_some() {
            Some("msi")
        } else if self.signal_edge() {
            Some("edge")
        } else {
            None
        }
    }

    /// Reads the guest-owned `avail.flags` word and reports whether
    /// `NO_INTERRUPT` is set. Used by the RX/TX completion paths to decide
    /// whether a batch actually needs to raise an interrupt (§4.4 step 8,
    /// §4.6). Returns `false` (i.e. "do raise the interrupt") if the ring
    /// has no lease or geometry, since an unreadable ring cannot have
    /// legitimately asked for silence.
    pub fn avail_no_interrupt(&self) -> bool {
        let geom_guard = self.geometry.read().unwrap();
        let geom = match geom_guard.as_ref() {
            Some(g) => g,
            None => return false,
        };
        let mem_atomic = match self.lease.guest_memory() {
            Ok(m) => m,
            Err(_) => return false,
        };
        let mem = mem_atomic.memory();
        let flags: u16 = mem.read_obj(geom.avail_ring).unwrap_or(0);
        flags & crate::desc::VRING_AVAIL_F_NO_INTERRUPT != 0
    }

    // ---- descriptor chain parser (§4.2, ported from vq_popchain) ---------

    /// Pops the next available descriptor chain, if any. `Ok(None)` means
    /// the ring is simply empty. If the avail index has raced ahead of the
    /// ring's own size, that is logged as a statistic but does not halt
    /// progress (§4.2 step 2): the head descriptor is still read and walked
    /// normally. `Err` means a malformed chain was found and dropped; the
    /// corresponding stat has already been incremented.
    pub fn pop_chain(&self) -> Result<Option<PoppedChain>, PopError> {
        let geom_guard = self.geometry.read().unwrap();
        let geom = geom_guard.as_ref().ok_or(PopError::NoLease)?;
        let mem_atomic = self.lease.guest_memory().map_err(|_| PopError::NoLease)?;
        let mem = mem_atomic.memory();

        let mut aidx = self.avail_idx.lock().unwrap();
        let avail_idx = self.read_avail_idx(&mem, geom);
        let ndesc = (avail_idx.0.wrapping_sub(aidx.0)) as u32;
        if ndesc == 0 {
            return Ok(None);
        }
        if ndesc as usize > geom.size as usize {
            RingStats::incr(&self.stats.ndesc_too_high);
            warn!("avail index ahead of ring size by {} entries", ndesc);
        }

        let slot = aidx.0 & geom.qmask;
        let head = match self.read_avail_entry(&mem, geom, slot) {
            Ok(h) => h,
            Err(_) => {
                self.bump(PopError::BadAddress);
                return Err(PopError::BadAddress);
            }
        };

        match self.walk_chain(&mem, geom, head) {
            Ok(chain) => {
                *aidx = Wrapping(aidx.0.wrapping_add(1));
                Ok(Some(chain))
            }
            Err(e) => {
                // A malformed chain does not consume `cur_aidx`: the guest
                // is misbehaving and retrying the same head every call is
                // correct (the caller sees a steady stream of errors rather
                // than silently losing guest-visible entries).
                self.bump(e);
                Err(e)
            }
        }
    }

    fn read_avail_idx(&self, mem: &GuestMemoryMmap, geom: &Geometry) -> Wrapping<u16> {
        let addr = geom.avail_ring.unchecked_add(2);
        Wrapping(mem.read_obj::<u16>(addr).unwrap_or(0))
    }

    fn read_avail_entry(
        &self,
        mem: &GuestMemoryMmap,
        geom: &Geometry,
        slot: u16,
    ) -> Result<u16, ()> {
        let addr = geom.avail_ring.unchecked_add(4 + 2 * slot as u64);
        mem.read_obj::<u16>(addr).map_err(|_| ())
    }

    fn read_descriptor(
        &self,
        mem: &GuestMemoryMmap,
        table: GuestAddress,
        idx: u16,
    ) -> Result<Descriptor, ()> {
        let addr = table.unchecked_add(idx as u64 * DESC_SIZE);
        mem.read_obj::<Descriptor>(addr).map_err(|_| ())
    }

    fn walk_chain(
        &self,
        mem: &GuestMemoryMmap,
        geom: &Geometry,
        head: u16,
    ) -> Result<PoppedChain, PopError> {
        let mut segments = Vec::new();
        let mut idx = head;
        let mut steps = 0u32;
        loop {
            if idx >= geom.size {
                return Err(PopError::BadIndex(idx));
            }
            // Cycle guard: a chain can visit at most `size` distinct
            // descriptors even before accounting for indirect expansion.
            steps += 1;
            if steps as usize > geom.size as usize {
                return Err(PopError::BadIndex(idx));
            }
            let desc = self
                .read_descriptor(mem, geom.desc_table, idx)
                .map_err(|_| PopError::BadAddress)?;

            if desc.is_indirect() {
                self.walk_indirect(mem, &desc, &mut segments)?;
            } else {
                if desc.len() == 0 {
                    return Err(PopError::BadLength);
                }
                if segments.len() >= VTNET_MAXSEGS {
                    return Err(PopError::TooManySegments);
                }
                let slice = self
                    .lease
                    .translate(desc.addr(), desc.len() as usize)
                    .map_err(|_| PopError::BadAddress)?;
                segments.push(ChainSegment {
                    slice,
                    writable: desc.is_write_only(),
                });
            }

            if desc.flags() & VIRTQ_DESC_F_NEXT == 0 {
                break;
            }
            idx = desc.next();
        }
        Ok(PoppedChain {
            cookie: head,
            segments,
        })
    }

    fn walk_indirect(
        &self,
        mem: &GuestMemoryMmap,
        head: &Descriptor,
        segments: &mut Vec<ChainSegment>,
    ) -> Result<(), PopError> {
        if head.len() == 0 || head.len() % DESC_SIZE as u32 != 0 {
            return Err(PopError::IndirectBadLength);
        }
        // Bounds-check the whole indirect table up front; the per-entry
        // reads below go through `mem` directly (a fresh local copy every
        // time) rather than caching the translated slice, exactly so a
        // malicious guest cannot mutate an entry between validation and use.
        self.lease
            .translate(head.addr(), head.len() as usize)
            .map_err(|_| PopError::BadAddress)?;
        let nindir = head.len() / DESC_SIZE as u32;
        let table = GuestAddress(head.addr());

        let mut next = 0u32;
        loop {
            if next >= nindir {
                return Err(PopError::IndirectBadNext);
            }
            let vp = self
                .read_descriptor(mem, table, next as u16)
                .map_err(|_| PopError::BadAddress)?;
            if vp.is_indirect() {
                return Err(PopError::IndirectBadNesting);
            }
            if vp.len() == 0 {
                return Err(PopError::BadLength);
            }
            if segments.len() >= VTNET_MAXSEGS {
                return Err(PopError::TooManySegments);
            }
            let slice = self
                .lease
                .translate(vp.addr(), vp.len() as usize)
                .map_err(|_| PopError::BadAddress)?;
            segments.push(ChainSegment {
                slice,
                writable: vp.is_write_only(),
            });
            if vp.flags() & VIRTQ_DESC_F_NEXT == 0 {
                break;
            }
            next = vp.next() as u32;
        }
        Ok(())
    }

    fn bump(&self, e: PopError) {
        match e {
            PopError::BadIndex(_) => RingStats::incr(&self.stats.bad_idx),
            PopError::BadLength => RingStats::incr(&self.stats.desc_bad_len),
            PopError::BadAddress => RingStats::incr(&self.stats.bad_ring_addr),
            PopError::IndirectBadLength => RingStats::incr(&self.stats.indir_bad_len),
            PopError::IndirectBadNesting => RingStats::incr(&self.stats.indir_bad_nest),
            PopError::IndirectBadNext => RingStats::incr(&self.stats.indir_bad_next),
            PopError::TooManySegments => RingStats::incr(&self.stats.too_many_desc),
            PopError::NoLease => {}
        }
    }

    /// Sets or clears the used-ring's `NO_NOTIFY` flag, used by the TX
    /// worker to suppress guest kicks while it is actively draining the
    /// available ring (§4.5 steps 1-3).
    pub fn set_used_no_notify(&self, set: bool) {
        let geom_guard = self.geometry.read().unwrap();
        let geom = match geom_guard.as_ref() {
            Some(g) => g,
            None => return,
        };
        let mem_atomic = match self.lease.guest_memory() {
            Ok(m) => m,
            Err(_) => return,
        };
        let mem = mem_atomic.memory();
        let cur: u16 = mem.read_obj(geom.used_ring).unwrap_or(0);
        let new = if set {
            cur | crate::desc::VRING_USED_F_NO_NOTIFY
        } else {
            cur & !crate::desc::VRING_USED_F_NO_NOTIFY
        };
        let _ = mem.write_obj(new, geom.used_ring);
    }

    // ---- used ring producer (§4.2, ported from vq_pushchain*) ------------

    /// Publishes a single completion, per the `vq_pushchain` release-fence
    /// pattern: write the entry, advance the local cursor, fence, then
    /// publish the new `used.idx`.
    pub fn push(&self, id: u16, len: u32) {
        self.push_mrgrx(&[UsedElem {
            id: id as u32,
            len,
        }]);
    }

    /// Publishes one or more completions atomically (mergeable RX, §4.4.2),
    /// per `vq_pushchain_mrgrx`.
    pub fn push_mrgrx(&self, elems: &[UsedElem]) {
        if elems.is_empty() {
            return;
        }
        let geom_guard = self.geometry.read().unwrap();
        let geom = match geom_guard.as_ref() {
            Some(g) => g,
            None => return,
        };
        let mem_atomic = match self.lease.guest_memory() {
            Ok(m) => m,
            Err(_) => return,
        };
        let mem = mem_atomic.memory();

        let mut uidx = self.used_idx.lock().unwrap();
        for (i, e) in elems.iter().enumerate() {
            let slot = (uidx.0.wrapping_add(i as u16)) & geom.qmask;
            let entry_addr = geom.used_ring.unchecked_add(4 + 8 * slot as u64);
            let _ = mem.write_obj(*e, entry_addr);
        }
        *uidx = Wrapping(uidx.0.wrapping_add(elems.len() as u16));
        fence(Ordering::Release);
        let idx_addr = geom.used_ring.unchecked_add(2);
        let _ = mem.write_obj(uidx.0, idx_addr);
    }
}

/// Borrowed accessor for a claimed reclamation slot, kept alive only as long
/// as the TX-scratch read lock is held.
struct ReclaimRef<'a> {
    guard: std::sync::RwLockReadGuard<'a, Option<TxScratch>>,
    cookie: u16,
}

impl<'a> ReclaimRef<'a> {
    fn slot(&self) -> &ReclaimSlot {
        self.guard.as_ref().unwrap().slot(self.cookie)
    }
}

/// RAII handle to a freshly claimed TX reclamation slot. Dropping it without
/// calling [`TxSlotHandle::commit`] abandons the claim (no completion is
/// pushed), matching an allocation failure before any zero-copy block was
/// built.
pub struct TxSlotHandle<'a> {
    ring: &'a Ring,
    cookie: u16,
}

impl<'a> TxSlotHandle<'a> {
    pub fn cookie(&self) -> u16 {
        self.cookie
    }

    pub fn write_header(&self, bytes: &[u8]) -> usize {
        self.ring.tx_slot(self.cookie).unwrap().slot().write_header(bytes)
    }

    pub fn header_slice<T>(&self, f: impl FnOnce(&[u8]) -> T) -> T {
        self.ring.tx_slot(self.cookie).unwrap().slot().header_slice(f)
    }

    /// Takes an extra reference, for an additional zero-copy block (or the
    /// extra hold kept across a hook invocation). The caller is responsible
    /// for calling [`Ring::release_tx_slot`] once per `add_ref` (and once
    /// for the implicit initial reference from the claim).
    pub fn add_ref(&self) {
        self.ring.tx_slot(self.cookie).unwrap().slot().add_ref();
    }

    pub fn refs(&self) -> u32 {
        self.ring.tx_slot(self.cookie).unwrap().slot().refs()
    }

    /// Records the chain's total delivered length and marks the handle
    /// committed: dropping it now releases the initial reference (rather
    /// than abandoning the claim), completing the chain once every
    /// outstanding zero-copy block has also released.
    pub fn commit(self, total_len: u32) {
        {
            let guard = self.ring.tx_slot(self.cookie).unwrap();
            guard.slot().set_total_len(total_len);
        }
        let cookie = self.cookie;
        let ring = self.ring;
        std::mem::forget(self);
        ring.release_tx_slot(cookie);
    }

    /// Abandons the claim without pushing any completion (use when no
    /// guest-visible transfer happened, e.g. an early allocation failure).
    pub fn abandon(self) {
        let guard = self.ring.tx_slot(self.cookie).unwrap();
        guard.slot().abandon();
        std::mem::forget(self);
    }
}

impl<'a> Drop for TxSlotHandle<'a> {
    fn drop(&mut self) {
        // Reaching here means neither `commit` nor `abandon` ran: treat it
        // the same as `abandon` so a claimed slot is never leaked stuck.
        if let Some(guard) = self.ring.tx_slot(self.cookie) {
            guard.slot().abandon();
        }
    }
}
