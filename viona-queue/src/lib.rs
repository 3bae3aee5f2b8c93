// Copyright © 2026 The Viona Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Virtqueue descriptor parsing and per-ring lifecycle state (§4.2, §4.3).
//!
//! This crate owns exactly the parts of a virtqueue that do not care
//! whether the payload is a network frame: descriptor chain walking
//! (direct and one-level indirect), the avail/used ring cursors, the
//! RESET/SETUP/INIT/RUN state machine, and the TX zero-copy reclamation
//! slots. `viona-net` builds the RX/TX engines on top of [`Ring`].

pub mod desc;
pub mod errors;
pub mod reclaim;
pub mod ring;
pub mod stats;

pub use desc::{
    Descriptor, UsedElem, VIRTQ_DESC_F_INDIRECT, VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE,
    VRING_ALIGN, VRING_AVAIL_F_NO_INTERRUPT, VRING_USED_F_NO_NOTIFY, VTNET_MAXSEGS,
};
pub use errors::{PopError, RingMapError};
pub use reclaim::{ReclaimSlot, TxScratch, VIONA_MAX_HDRS_LEN};
pub use ring::{ChainSegment, PoppedChain, Ring, RingState, TxSlotHandle, RENEW, REQ_START, REQ_STOP};
pub use stats::{RingStats, RingStatsSnapshot};

/// A hand-rolled virtqueue layout builder for tests, mirroring the
/// geometry math in [`Ring::map`] (`desc_sz = qsz*16`, `avail_sz =
/// (qsz+3)*2`, `used_sz = qsz*8+6`) without needing a guest driver.
#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

    use crate::desc::{Descriptor, UsedElem};

    /// Base addresses and size of a queue built inside a flat test memory
    /// region, page-aligned the way `VRING_ALIGN` requires in practice.
    pub struct QueueLayout {
        pub desc_table: u64,
        pub avail_ring: u64,
        pub used_ring: u64,
        pub qsz: u16,
    }

    impl QueueLayout {
        /// Lays out a queue of `qsz` entries starting at `base`.
        pub fn new(base: u64, qsz: u16) -> Self {
            let desc_table = base;
            let desc_bytes = qsz as u64 * 16;
            let avail_ring = desc_table + desc_bytes;
            let avail_bytes = (qsz as u64 + 3) * 2;
            let used_ring = round_up(avail_ring + avail_bytes, 4096);
            QueueLayout {
                desc_table,
                avail_ring,
                used_ring,
                qsz,
            }
        }

        pub fn end(&self) -> u64 {
            self.used_ring + (self.qsz as u64 * 8) + 6
        }

        pub fn write_desc(&self, mem: &GuestMemoryMmap, idx: u16, d: RawDesc) {
            let addr = GuestAddress(self.desc_table + idx as u64 * 16);
            let desc = Descriptor::from(d);
            mem.write_obj(desc, addr).unwrap();
        }

        /// Appends `head` as the next available-ring entry and bumps
        /// `avail.idx`, exactly as a guest driver would after filling in a
        /// descriptor chain.
        pub fn publish_avail(&self, mem: &GuestMemoryMmap, head: u16) {
            let idx = self.avail_idx(mem);
            let slot_addr = GuestAddress(self.avail_ring + 4 + 2 * (idx as u64 % self.qsz as u64));
            mem.write_obj(head, slot_addr).unwrap();
            mem.write_obj(idx.wrapping_add(1), GuestAddress(self.avail_ring + 2))
                .unwrap();
        }

        pub fn avail_idx(&self, mem: &GuestMemoryMmap) -> u16 {
            mem.read_obj(GuestAddress(self.avail_ring + 2)).unwrap()
        }

        pub fn used_idx(&self, mem: &GuestMemoryMmap) -> u16 {
            mem.read_obj(GuestAddress(self.used_ring + 2)).unwrap()
        }

        pub fn used_entry(&self, mem: &GuestMemoryMmap, slot: u16) -> UsedElem {
            let addr = GuestAddress(self.used_ring + 4 + 8 * (slot as u64 % self.qsz as u64));
            mem.read_obj(addr).unwrap()
        }
    }

    fn round_up(v: u64, align: u64) -> u64 {
        (v + align - 1) & !(align - 1)
    }

    /// Plain-old-data mirror of [`Descriptor`] for test construction (the
    /// real type keeps its fields private to the crate).
    #[derive(Clone, Copy)]
    pub struct RawDesc {
        pub addr: u64,
        pub len: u32,
        pub flags: u16,
        pub next: u16,
    }

    impl From<RawDesc> for Descriptor {
        fn from(r: RawDesc) -> Descriptor {
            // `Descriptor` is `#[repr(C)]` with the identical field order,
            // so a transmute-free construction goes through its `Default`
            // plus direct memory write: build the raw bytes ourselves.
            let mut bytes = [0u8; 16];
            bytes[0..8].copy_from_slice(&r.addr.to_le_bytes());
            bytes[8..12].copy_from_slice(&r.len.to_le_bytes());
            bytes[12..14].copy_from_slice(&r.flags.to_le_bytes());
            bytes[14..16].copy_from_slice(&r.next.to_le_bytes());
            // Safety: `Descriptor` is `#[repr(C)]`, has no padding, and every
            // bit pattern of its fields is valid (it implements
            // `ByteValued`), so reinterpreting 16 validated bytes is sound.
            unsafe { std::mem::transmute(bytes) }
        }
    }
}
