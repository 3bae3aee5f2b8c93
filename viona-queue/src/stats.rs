// Copyright © 2026 The Viona Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Typed per-ring statistics (§7, §8).
//!
//! Every guest-caused failure mode is a steady-state condition, not an
//! exception: the parser and the RX/TX engines record it here and move on,
//! logging at `debug!` per §10.1 rather than `warn!`/`error!`, matching the
//! split `devices::Ioapic` makes between caller-recoverable conditions and
//! genuine failures.

use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! ring_stats {
    ($($name:ident),+ $(,)?) => {
        #[derive(Default)]
        pub struct RingStats {
            $(pub $name: AtomicU64),+
        }

        /// Point-in-time snapshot, for callers (e.g. a future control-surface
        /// stats command) that want a consistent-looking read without atomics.
        #[derive(Debug, Default, Clone, Copy)]
        pub struct RingStatsSnapshot {
            $(pub $name: u64),+
        }

        impl RingStats {
            pub fn snapshot(&self) -> RingStatsSnapshot {
                RingStatsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed)),+
                }
            }
        }
    };
}

ring_stats! {
    // Descriptor parser (C2) failures.
    bad_idx,
    desc_bad_len,
    bad_ring_addr,
    indir_bad_len,
    indir_bad_nest,
    indir_bad_next,
    too_many_desc,
    ndesc_too_high,
    // RX engine (C4).
    no_space,
    too_short,
    bad_rx_frame,
    rx_merge_underrun,
    rx_merge_overrun,
    rx_pad_short,
    rx_mcast_check,
    rx_hookdrop,
    // TX engine (C5).
    tx_absent,
    tx_hookdrop,
    fail_hcksum,
    fail_hcksum6,
    fail_hcksum_proto,
}

impl RingStats {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
