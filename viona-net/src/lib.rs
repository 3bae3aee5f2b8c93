// Copyright © 2026 The Viona Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Virtio-net RX/TX engines (§4.4, §4.5): frame classification, checksum
//! and LSO offload programming, and the guest-buffer copy loops that turn a
//! [`viona_queue::Ring`]'s descriptor chains into delivered or transmitted
//! Ethernet frames.
//!
//! This crate does not talk to a real NIC. It is built against two small
//! seam traits -- [`MacSender`] (outbound submission) and the
//! [`MacCapsReport`] a binding layer reports once at link creation -- so the
//! actual MAC client stays an external collaborator, per scope.

pub mod checksum;
pub mod header;
pub mod rx;
pub mod tx;

use std::sync::Arc;

use viona_lease::HostSlice;

/// Per-chain segment cap for mergeable RX (`VTNET_MAXSEGS` in the wire
/// constants), defaulted but overridable through [`LinkConfig`].
pub const VTNET_MAXSEGS: usize = 32;

/// Ethernet minimum delivered length (§6).
pub const MIN_FRAME_LEN: usize = 60;

/// TCP/IPv4 maximum datagram size; the LSO-MSS floor a MAC client's LSO
/// capability must clear before `HOST_TSO4` is derived (§4.7).
pub const IP_MAXPACKET: u32 = 65535;

pub const VIRTIO_NET_F_CSUM: u32 = 1 << 0;
pub const VIRTIO_NET_F_GUEST_CSUM: u32 = 1 << 1;
pub const VIRTIO_NET_F_MAC: u32 = 1 << 5;
pub const VIRTIO_NET_F_GUEST_TSO4: u32 = 1 << 7;
pub const VIRTIO_NET_F_HOST_TSO4: u32 = 1 << 11;
pub const VIRTIO_NET_F_MRG_RXBUF: u32 = 1 << 15;
pub const VIRTIO_NET_F_STATUS: u32 = 1 << 16;
pub const VIRTIO_NET_F_NOTIFY_ON_EMPTY: u32 = 1 << 24;
pub const VIRTIO_NET_F_INDIRECT_DESC: u32 = 1 << 28;
pub const VIRTIO_NET_F_EVENT_IDX: u32 = 1 << 29;

/// The statically-advertised host capability set (§4.7): every feature bit
/// except `HOST_TSO4`, which is derived per-link from the bound MAC's
/// reported hardware capabilities.
pub const HOSTCAPS: u32 = VIRTIO_NET_F_CSUM
    | VIRTIO_NET_F_GUEST_CSUM
    | VIRTIO_NET_F_MAC
    | VIRTIO_NET_F_GUEST_TSO4
    | VIRTIO_NET_F_MRG_RXBUF
    | VIRTIO_NET_F_STATUS
    | VIRTIO_NET_F_NOTIFY_ON_EMPTY
    | VIRTIO_NET_F_INDIRECT_DESC
    | VIRTIO_NET_F_EVENT_IDX;

/// What the bound MAC client reports about its hardware checksum/LSO
/// support, as of `create` time (§4.7's `viona_get_mac_capab` port).
#[derive(Debug, Clone, Copy, Default)]
pub struct MacCapsReport {
    pub csum_partial: bool,
    pub csum_full_ipv4: bool,
    pub csum_full_ipv6: bool,
    pub lso_basic_tcp_ipv4: bool,
    pub lso_max_mss: u32,
}

/// The derived host-hardware feature subset (§4.7), computed once from a
/// [`MacCapsReport`] and then frozen for the life of the link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MacCapabilities {
    pub csum: bool,
    pub host_tso4: bool,
}

impl MacCapabilities {
    pub fn derive(report: &MacCapsReport) -> MacCapabilities {
        let csum = report.csum_partial || report.csum_full_ipv4 || report.csum_full_ipv6;
        let host_tso4 =
            csum && report.lso_basic_tcp_ipv4 && report.lso_max_mss >= IP_MAXPACKET;
        MacCapabilities { csum, host_tso4 }
    }

    pub fn bits(&self) -> u32 {
        let mut b = 0;
        if self.csum {
            b |= VIRTIO_NET_F_CSUM;
        }
        if self.host_tso4 {
            b |= VIRTIO_NET_F_HOST_TSO4;
        }
        b
    }
}

/// Negotiated feature bitmap, as returned by `set_features` (§4.7). Provides
/// named accessors so the RX/TX engines never hand-mask bit numbers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NegotiatedFeatures(pub u32);

impl NegotiatedFeatures {
    pub fn csum(&self) -> bool {
        self.0 & VIRTIO_NET_F_CSUM != 0
    }
    pub fn guest_csum(&self) -> bool {
        self.0 & VIRTIO_NET_F_GUEST_CSUM != 0
    }
    pub fn guest_tso4(&self) -> bool {
        self.0 & VIRTIO_NET_F_GUEST_TSO4 != 0
    }
    pub fn host_tso4(&self) -> bool {
        self.0 & VIRTIO_NET_F_HOST_TSO4 != 0
    }
    pub fn mrg_rxbuf(&self) -> bool {
        self.0 & VIRTIO_NET_F_MRG_RXBUF != 0
    }
    pub fn notify_on_empty(&self) -> bool {
        self.0 & VIRTIO_NET_F_NOTIFY_ON_EMPTY != 0
    }
}

/// Per-link configuration knobs (§10.3), constructed once at `create` time.
#[derive(Debug, Clone, Copy)]
pub struct LinkConfig {
    /// Disables the zero-copy TX path unconditionally, the explicit
    /// replacement for the original's per-NIC-driver-name probe (§9 Open
    /// Question).
    pub force_tx_copy: bool,
    /// Per-frame descriptor-chain cap for mergeable RX.
    pub mrg_rxbuf_cap: usize,
}

impl Default for LinkConfig {
    fn default() -> LinkConfig {
        LinkConfig {
            force_tx_copy: false,
            mrg_rxbuf_cap: VTNET_MAXSEGS,
        }
    }
}

/// L2 destination classification (§4.4 step 2), by the low bit of the first
/// destination-MAC octet and the all-ones broadcast address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestClass {
    Unicast,
    Multicast,
    Broadcast,
}

pub fn classify_dest(dst_mac: &[u8; 6]) -> DestClass {
    if *dst_mac == [0xff; 6] {
        DestClass::Broadcast
    } else if dst_mac[0] & 0x1 != 0 {
        DestClass::Multicast
    } else {
        DestClass::Unicast
    }
}

/// A frame as delivered by the MAC layer's RX callback, before classification
/// or padding. `hw_local_mac` mirrors `HW_LOCAL_MAC`: the MAC could not
/// itself vouch for the checksum because the frame originated locally on
/// the host rather than arriving over the wire.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub data: Vec<u8>,
    pub csum_valid: bool,
    pub hw_local_mac: bool,
    pub lso_mss: Option<u32>,
}

/// One block of an outbound (TX) frame chain, either host-owned (copied) or
/// a zero-copy view into guest memory backed by a reclamation reference.
pub enum FrameBlock {
    Owned(Vec<u8>),
    ZeroCopy {
        slice: HostSlice,
        completion: Arc<dyn TxCompletion>,
    },
}

impl FrameBlock {
    pub fn len(&self) -> usize {
        match self {
            FrameBlock::Owned(v) => v.len(),
            FrameBlock::ZeroCopy { slice, .. } => slice.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases one zero-copy reference when a [`FrameBlock::ZeroCopy`] block is
/// done being read by the MAC layer. Implemented by a thin adapter over
/// `viona_queue::Ring::release_tx_slot` in `tx.rs`.
pub trait TxCompletion: Send + Sync {
    fn release(&self);
}

/// Checksum offload programming for one outbound frame (§4.5), derived from
/// the virtio-net header's `(csum_start, csum_offset)` pair.
#[derive(Debug, Clone, Copy)]
pub struct ChecksumOffload {
    pub csum_start: u16,
    pub csum_offset: u16,
}

/// LSO offload programming, present only when `gso_type == TCPV4`.
#[derive(Debug, Clone, Copy)]
pub struct LsoOffload {
    pub mss: u16,
}

/// A fully assembled outbound frame, ready for [`MacSender::send`].
pub struct OutboundFrame {
    pub blocks: Vec<FrameBlock>,
    pub checksum: Option<ChecksumOffload>,
    pub lso: Option<LsoOffload>,
}

impl OutboundFrame {
    pub fn total_len(&self) -> usize {
        self.blocks.iter().map(FrameBlock::len).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Sent,
    Dropped,
}

/// The bound host MAC client's submission surface, named by interface
/// contract only (§1): this crate never constructs one, it is handed in by
/// the link container.
pub trait MacSender: Send + Sync {
    fn send(&self, frame: OutboundFrame) -> TxOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_dest_recognizes_broadcast_and_multicast() {
        assert_eq!(classify_dest(&[0xff; 6]), DestClass::Broadcast);
        assert_eq!(
            classify_dest(&[0x01, 0, 0, 0, 0, 0]),
            DestClass::Multicast
        );
        assert_eq!(
            classify_dest(&[0x02, 0, 0, 0, 0, 1]),
            DestClass::Unicast
        );
    }

    #[test]
    fn mac_capability_derivation_requires_csum_before_tso() {
        let report = MacCapsReport {
            csum_partial: false,
            csum_full_ipv4: false,
            csum_full_ipv6: false,
            lso_basic_tcp_ipv4: true,
            lso_max_mss: IP_MAXPACKET,
        };
        let caps = MacCapabilities::derive(&report);
        assert!(!caps.csum);
        assert!(!caps.host_tso4);
    }

    #[test]
    fn mac_capability_derivation_requires_mss_floor() {
        let report = MacCapsReport {
            csum_partial: true,
            csum_full_ipv4: false,
            csum_full_ipv6: false,
            lso_basic_tcp_ipv4: true,
            lso_max_mss: IP_MAXPACKET - 1,
        };
        let caps = MacCapabilities::derive(&report);
        assert!(caps.csum);
        assert!(!caps.host_tso4);
    }

    #[test]
    fn mac_capability_derivation_full_support() {
        let report = MacCapsReport {
            csum_partial: true,
            csum_full_ipv4: true,
            csum_full_ipv6: false,
            lso_basic_tcp_ipv4: true,
            lso_max_mss: IP_MAXPACKET,
        };
        let caps = MacCapabilities::derive(&report);
        assert!(caps.csum);
        assert!(caps.host_tso4);
        assert_eq!(
            caps.bits(),
            VIRTIO_NET_F_CSUM | VIRTIO_NET_F_HOST_TSO4
        );
    }
}
