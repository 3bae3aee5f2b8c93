// Copyright © 2026 The Viona Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Virtio-net header layout (§6 wire constants), read/written directly
//! against the little-endian bytes of a guest buffer rather than through
//! `vm_memory::ByteValued`, since the header always lives inside a
//! [`viona_lease::HostSlice`] rather than a directly addressable
//! `GuestMemoryMmap` region (see `viona-queue::ring::ChainSegment`).

pub const VIRTIO_NET_HDR_LEN: usize = 10;
pub const VIRTIO_NET_MRG_HDR_LEN: usize = 12;

pub const VIRTIO_NET_HDR_F_NEEDS_CSUM: u8 = 1;
pub const VIRTIO_NET_HDR_F_DATA_VALID: u8 = 2;

pub const VIRTIO_NET_HDR_GSO_NONE: u8 = 0;
pub const VIRTIO_NET_HDR_GSO_TCPV4: u8 = 1;

/// The 10-byte plain virtio-net header (`MRG_RXBUF` not negotiated).
#[derive(Debug, Default, Clone, Copy)]
pub struct VirtioNetHdr {
    pub flags: u8,
    pub gso_type: u8,
    pub hdr_len: u16,
    pub gso_size: u16,
    pub csum_start: u16,
    pub csum_offset: u16,
}

impl VirtioNetHdr {
    pub fn to_bytes(self) -> [u8; VIRTIO_NET_HDR_LEN] {
        let mut b = [0u8; VIRTIO_NET_HDR_LEN];
        b[0] = self.flags;
        b[1] = self.gso_type;
        b[2..4].copy_from_slice(&self.hdr_len.to_le_bytes());
        b[4..6].copy_from_slice(&self.gso_size.to_le_bytes());
        b[6..8].copy_from_slice(&self.csum_start.to_le_bytes());
        b[8..10].copy_from_slice(&self.csum_offset.to_le_bytes());
        b
    }

    pub fn from_bytes(b: &[u8]) -> VirtioNetHdr {
        debug_assert!(b.len() >= VIRTIO_NET_HDR_LEN);
        VirtioNetHdr {
            flags: b[0],
            gso_type: b[1],
            hdr_len: u16::from_le_bytes([b[2], b[3]]),
            gso_size: u16::from_le_bytes([b[4], b[5]]),
            csum_start: u16::from_le_bytes([b[6], b[7]]),
            csum_offset: u16::from_le_bytes([b[8], b[9]]),
        }
    }

    pub fn needs_csum(&self) -> bool {
        self.flags & VIRTIO_NET_HDR_F_NEEDS_CSUM != 0
    }
}

/// The 12-byte mergeable-RX header: the plain header plus `num_buffers`.
#[derive(Debug, Default, Clone, Copy)]
pub struct VirtioNetMrgHdr {
    pub hdr: VirtioNetHdr,
    pub num_buffers: u16,
}

impl VirtioNetMrgHdr {
    pub fn to_bytes(self) -> [u8; VIRTIO_NET_MRG_HDR_LEN] {
        let mut b = [0u8; VIRTIO_NET_MRG_HDR_LEN];
        b[..VIRTIO_NET_HDR_LEN].copy_from_slice(&self.hdr.to_bytes());
        b[VIRTIO_NET_HDR_LEN..].copy_from_slice(&self.num_buffers.to_le_bytes());
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_header_roundtrip() {
        let hdr = VirtioNetHdr {
            flags: VIRTIO_NET_HDR_F_NEEDS_CSUM,
            gso_type: VIRTIO_NET_HDR_GSO_TCPV4,
            hdr_len: 0,
            gso_size: 1448,
            csum_start: 34,
            csum_offset: 16,
        };
        let bytes = hdr.to_bytes();
        let back = VirtioNetHdr::from_bytes(&bytes);
        assert_eq!(back.gso_size, 1448);
        assert_eq!(back.csum_start, 34);
        assert!(back.needs_csum());
    }

    #[test]
    fn mergeable_header_is_twelve_bytes() {
        let hdr = VirtioNetMrgHdr {
            hdr: VirtioNetHdr::default(),
            num_buffers: 3,
        };
        let bytes = hdr.to_bytes();
        assert_eq!(bytes.len(), VIRTIO_NET_MRG_HDR_LEN);
        assert_eq!(u16::from_le_bytes([bytes[10], bytes[11]]), 3);
    }
}
