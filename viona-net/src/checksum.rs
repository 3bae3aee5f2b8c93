// Copyright © 2026 The Viona Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Checksum and LSO offload helpers (§4.4 step 4, §4.5), ported from
//! `viona_tx_csum` and the IP/full-checksum emulation in `viona_recv_plain`
//! / `viona_rx_common`.

use thiserror::Error;

pub const ETHER_HDR_LEN: usize = 14;
pub const VLAN_TAG_LEN: usize = 4;
const ETHERTYPE_VLAN: u16 = 0x8100;

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// Offset of the checksum field within a TCP header.
pub const TCP_CSUM_OFFSET: u16 = 16;
/// Offset of the checksum field within a UDP header.
pub const UDP_CSUM_OFFSET: u16 = 6;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumError {
    #[error("checksum offsets fall outside the frame or copied header region")]
    OutOfBounds,
}

/// Length of the Ethernet header including one 802.1Q tag if present.
pub fn eth_header_len(frame: &[u8]) -> usize {
    if frame.len() >= ETHER_HDR_LEN
        && u16::from_be_bytes([frame[12], frame[13]]) == ETHERTYPE_VLAN
    {
        ETHER_HDR_LEN + VLAN_TAG_LEN
    } else {
        ETHER_HDR_LEN
    }
}

/// The standard one's-complement Internet checksum (RFC 1071) over `data`.
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for c in &mut chunks {
        sum += u16::from_be_bytes([c[0], c[1]]) as u32;
    }
    if let [last] = *chunks.remainder() {
        sum += (last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Validates `(csum_start, csum_offset)` against the frame length and the
/// length of the copied header region available for hardware parsing,
/// per §4.5's mandatory bounds check: `csum_start ∈ [eth_len, len)` and
/// `csum_start + csum_offset + 2 ≤ header_region_len`.
pub fn validate_bounds(
    eth_len: usize,
    frame_len: usize,
    header_region_len: usize,
    csum_start: u16,
    csum_offset: u16,
) -> Result<(), ChecksumError> {
    let start = csum_start as usize;
    let field = start + csum_offset as usize;
    if start < eth_len || start >= frame_len {
        return Err(ChecksumError::OutOfBounds);
    }
    if field + 2 > header_region_len {
        return Err(ChecksumError::OutOfBounds);
    }
    Ok(())
}

/// Computes and writes the checksum field at `csum_start + csum_offset`,
/// covering `buf[csum_start..]`. Callers must have already validated bounds
/// with [`validate_bounds`].
pub fn apply_checksum(buf: &mut [u8], csum_start: u16, csum_offset: u16) {
    let start = csum_start as usize;
    let field = start + csum_offset as usize;
    buf[field] = 0;
    buf[field + 1] = 0;
    let csum = internet_checksum(&buf[start..]);
    buf[field..field + 2].copy_from_slice(&csum.to_be_bytes());
}

/// IPv4 header length in bytes, from the low nibble of the first byte (IHL).
pub fn ipv4_header_len(ip_hdr: &[u8]) -> usize {
    (ip_hdr[0] & 0x0f) as usize * 4
}

/// Zeroes and recomputes the IPv4 header checksum in place (LSO programming
/// step of §4.5: "zero the IPv4 header checksum").
pub fn recompute_ipv4_header_checksum(buf: &mut [u8], ip_off: usize, ip_hdr_len: usize) {
    let ip_hdr = &mut buf[ip_off..ip_off + ip_hdr_len];
    ip_hdr[10] = 0;
    ip_hdr[11] = 0;
    let csum = internet_checksum(ip_hdr);
    ip_hdr[10..12].copy_from_slice(&csum.to_be_bytes());
}

/// Recomputes the TCP checksum field as a pseudo-header-only partial sum,
/// omitting the length term, per §4.5: "hardware expectation" for LSO is
/// that the driver precomputes `src+dst+protocol` and lets the NIC fold in
/// payload and length itself during segmentation.
pub fn recompute_tcp_pseudo_partial(
    buf: &mut [u8],
    ip_off: usize,
    tcp_off: usize,
    tcp_csum_field_off: usize,
) {
    let src = [
        buf[ip_off + 12],
        buf[ip_off + 13],
        buf[ip_off + 14],
        buf[ip_off + 15],
    ];
    let dst = [
        buf[ip_off + 16],
        buf[ip_off + 17],
        buf[ip_off + 18],
        buf[ip_off + 19],
    ];
    let proto = buf[ip_off + 9];
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src);
    pseudo[4..8].copy_from_slice(&dst);
    pseudo[9] = proto;
    let csum = internet_checksum(&pseudo);
    let field = tcp_off + tcp_csum_field_off;
    buf[field..field + 2].copy_from_slice(&csum.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internet_checksum_of_known_vector() {
        // RFC 1071 worked example: 0x0001 + 0xf203 + 0xf4f5 + 0xf6f7.
        let data = [0x00u8, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(internet_checksum(&data), 0x220d);
    }

    #[test]
    fn eth_header_len_detects_vlan_tag() {
        let mut plain = vec![0u8; 14];
        plain[12] = 0x08;
        plain[13] = 0x00;
        assert_eq!(eth_header_len(&plain), ETHER_HDR_LEN);

        let mut vlan = vec![0u8; 18];
        vlan[12] = 0x81;
        vlan[13] = 0x00;
        assert_eq!(eth_header_len(&vlan), ETHER_HDR_LEN + VLAN_TAG_LEN);
    }

    #[test]
    fn validate_bounds_rejects_start_before_eth_header() {
        assert_eq!(
            validate_bounds(14, 100, 64, 10, 0),
            Err(ChecksumError::OutOfBounds)
        );
    }

    #[test]
    fn validate_bounds_rejects_field_past_header_region() {
        assert_eq!(
            validate_bounds(14, 100, 40, 34, 16),
            Err(ChecksumError::OutOfBounds)
        );
    }

    #[test]
    fn validate_bounds_accepts_well_formed_tcp_offsets() {
        assert!(validate_bounds(14, 100, 54, 34, 16).is_ok());
    }

    #[test]
    fn apply_checksum_zeroes_field_before_computing() {
        let mut buf = vec![0u8; 40];
        buf[20] = 0xaa;
        buf[21] = 0xbb;
        apply_checksum(&mut buf, 14, 6);
        // Field itself must not influence the computed value; recomputing
        // over the now-zeroed field and comparing is the simplest check.
        let field = 14 + 6;
        let c1 = u16::from_be_bytes([buf[field], buf[field + 1]]);
        buf[field] = 0;
        buf[field + 1] = 0;
        let c2 = internet_checksum(&buf[14..]);
        assert_eq!(c1, c2);
    }
}
