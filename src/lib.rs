// Copyright © 2026 The Viona Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! In-kernel data-plane of a paravirtualized virtio-net device for a type-2
//! hypervisor guest.
//!
//! This crate is a thin facade over the workspace's component crates:
//!
//! - [`viona_lease`] -- revocable guest-memory lease (C1).
//! - [`viona_queue`] -- descriptor parser and per-ring state machine (C2, C3).
//! - [`viona_net`] -- RX/TX engines: classification, offloads, buffer copy
//!   (C4, C5).
//! - [`viona_notify`] -- guest<->host kick/interrupt plumbing (C6).
//! - [`viona_link`] -- the [`Link`] container tying every ring together and
//!   exposing the control-surface operations (C7).
//! - [`viona_hook`] -- per-netstack packet-filter bridge (C8).
//!
//! A front-end (character device, vhost-user backend, or anything else that
//! owns the actual control channel to a guest) depends on this crate and
//! drives its one remaining external collaborator contracts: a
//! [`viona_lease::GuestHold`] for the hypervisor's guest-memory mapping, a
//! [`viona_net::MacSender`] for the host NIC, and a [`viona_notify::MsiSender`]
//! for interrupt injection.

pub use viona_hook::{Direction, HookContext, HookContextRef, HookError, HookRegistry, PacketHook};
pub use viona_lease::{GuestHold, HostSlice, Lease, LeaseError, LeaseReader};
pub use viona_link::{IntrStatus, Link, LinkError, RingBase, RX_QUEUE, TX_QUEUE};
pub use viona_net::{
    ChecksumOffload, DestClass, FrameBlock, InboundFrame, LinkConfig, LsoOffload,
    MacCapabilities, MacCapsReport, MacSender, NegotiatedFeatures, OutboundFrame, TxCompletion,
    TxOutcome, HOSTCAPS,
};
pub use viona_notify::{InterruptOutcome, MsiSender, NotifyError, NotifyIoport};
pub use viona_queue::{
    ChainSegment, PopError, PoppedChain, Ring, RingMapError, RingState, TxSlotHandle,
};

#[cfg(test)]
mod tests {
    //! Exercises the facade re-exports end to end, the way a front-end
    //! integrating this crate would: create a link against fake
    //! collaborators, negotiate features, bring both rings up, and tear it
    //! down again.

    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use vm_memory::{GuestAddress, GuestMemoryAtomic, GuestMemoryMmap};

    use super::*;

    struct FakeHold {
        mem: GuestMemoryAtomic<GuestMemoryMmap>,
        closing: AtomicBool,
    }

    impl GuestHold for FakeHold {
        fn is_closing(&self) -> bool {
            self.closing.load(Ordering::Acquire)
        }
        fn memory(&self) -> GuestMemoryAtomic<GuestMemoryMmap> {
            self.mem.clone()
        }
    }

    #[derive(Default)]
    struct FakeMac {
        sent: AtomicUsize,
    }

    impl MacSender for FakeMac {
        fn send(&self, frame: OutboundFrame) -> TxOutcome {
            self.sent.fetch_add(1, Ordering::Relaxed);
            let _ = frame.total_len();
            TxOutcome::Sent
        }
    }

    #[derive(Default)]
    struct FakeMsi {
        delivered: Mutex<Vec<(u32, u32)>>,
    }

    impl MsiSender for FakeMsi {
        fn signal_msi(&self, addr: u32, data: u32) -> io::Result<()> {
            self.delivered.lock().unwrap().push((addr, data));
            Ok(())
        }
    }

    #[test]
    fn full_link_lifecycle_through_the_facade() {
        let _ = env_logger::builder().is_test(true).try_init();

        let hooks = HookRegistry::new();
        hooks.create(1);

        let mmap = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 1 << 20)]).unwrap();
        let hold = Arc::new(FakeHold {
            mem: GuestMemoryAtomic::new(mmap),
            closing: AtomicBool::new(false),
        });

        let link = Link::create(
            42,
            hold,
            Arc::new(FakeMac::default()),
            MacCapsReport {
                csum_partial: true,
                csum_full_ipv4: true,
                csum_full_ipv6: false,
                lso_basic_tcp_ipv4: true,
                lso_max_mss: viona_net::IP_MAXPACKET,
            },
            Arc::new(FakeMsi::default()),
            &hooks,
            1,
            LinkConfig::default(),
        )
        .unwrap();

        let granted = link.set_features(HOSTCAPS | viona_net::VIRTIO_NET_F_HOST_TSO4).unwrap();
        assert_eq!(granted & viona_net::VIRTIO_NET_F_HOST_TSO4, viona_net::VIRTIO_NET_F_HOST_TSO4);

        let base = RingBase {
            desc_table: 0x1000,
            avail_ring: 0x2000,
            used_ring: 0x3000,
        };
        link.ring_init(RX_QUEUE, 16, base).unwrap();
        link.ring_init(
            TX_QUEUE,
            16,
            RingBase {
                desc_table: 0x10000,
                avail_ring: 0x20000,
                used_ring: 0x30000,
            },
        )
        .unwrap();

        link.ring_kick(TX_QUEUE).unwrap();
        link.ring_reset(TX_QUEUE, None).unwrap();
        link.ring_reset(RX_QUEUE, None).unwrap();

        link.delete().unwrap();
        assert!(matches!(link.get_features(), Err(LinkError::Gone)));
    }
}
