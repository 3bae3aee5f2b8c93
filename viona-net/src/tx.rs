// Copyright © 2026 The Viona Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! The transmit engine (§4.5), ported from `viona_tx` and `viona_tx_csum`.
//!
//! A TX chain's first descriptor always carries the fixed 10-byte
//! virtio-net header (mergeable RX buffers do not apply to this
//! direction); everything after it is the Ethernet frame. Up to
//! [`viona_queue::VIONA_MAX_HDRS_LEN`] bytes of that frame are always
//! copied into a local buffer before any checksum/LSO field is parsed out
//! of it, so a guest mutating its own descriptor memory mid-transmit can
//! never race the host's view of the header it is about to program into
//! hardware. Whatever is left over is handed to the MAC client either as
//! another copy or, when zero-copy is enabled, as a deferred-completion
//! view straight into guest memory.

use std::sync::Arc;

use log::debug;

use viona_hook::{Direction, HookContext};
use viona_queue::{ChainSegment, Ring, VIONA_MAX_HDRS_LEN};

use crate::checksum;
use crate::header::{VirtioNetHdr, VIRTIO_NET_HDR_GSO_TCPV4, VIRTIO_NET_HDR_LEN};
use crate::{ChecksumOffload, FrameBlock, LsoOffload, MacSender, NegotiatedFeatures, OutboundFrame, TxCompletion, TxOutcome};

const ETHERTYPE_IP: u16 = 0x0800;
const TCP_CSUM_FIELD_OFFSET: usize = 16;

pub struct TxEngine {
    ring: Arc<Ring>,
    features: NegotiatedFeatures,
    hook: Arc<HookContext>,
    force_copy: bool,
    mac: Arc<dyn MacSender>,
}

impl TxEngine {
    pub fn new(
        ring: Arc<Ring>,
        features: NegotiatedFeatures,
        hook: Arc<HookContext>,
        force_copy: bool,
        mac: Arc<dyn MacSender>,
    ) -> Self {
        TxEngine {
            ring,
            features,
            hook,
            force_copy,
            mac,
        }
    }

    /// Drains and transmits one descriptor chain. `None` means the ring had
    /// nothing available; a worker loop keeps calling this until it sees
    /// that.
    pub fn tx_one(&self) -> Option<TxOutcome> {
        let chain = match self.ring.pop_chain() {
            Ok(Some(c)) => c,
            Ok(None) => return None,
            Err(_) => return None,
        };
        let cookie = chain.cookie;
        let mut segments = chain.segments.into_iter();

        let hdr_seg = match segments.next() {
            Some(s) if s.slice.len() >= VIRTIO_NET_HDR_LEN => s,
            Some(s) => {
                debug!("tx header descriptor too short ({} bytes)", s.slice.len());
                self.ring.push(cookie, s.slice.len() as u32);
                return Some(TxOutcome::Dropped);
            }
            None => {
                self.ring.push(cookie, 0);
                return Some(TxOutcome::Dropped);
            }
        };
        let mut hdr_bytes = [0u8; VIRTIO_NET_HDR_LEN];
        hdr_seg.slice.read(&mut hdr_bytes);
        let hdr = VirtioNetHdr::from_bytes(&hdr_bytes);

        let frame_segments: Vec<ChainSegment> = segments.collect();
        let frame_len: usize = frame_segments.iter().map(|s| s.slice.len()).sum();
        let total_len = hdr_seg.slice.len() + frame_len;

        if frame_segments.is_empty() {
            debug!("tx chain carried no payload beyond its header descriptor");
            self.ring.push(cookie, total_len as u32);
            return Some(TxOutcome::Dropped);
        }

        if self.hook.is_active() {
            let full = read_all(&frame_segments, frame_len);
            let frame = match self.hook.run(Direction::Out, full) {
                Some(f) => f,
                None => {
                    self.ring.push(cookie, total_len as u32);
                    return Some(TxOutcome::Dropped);
                }
            };
            // Whether or not the hook rewrote the data, treat the result as
            // a single fully copied block from here on -- once a hook
            // consumer has seen (and potentially pulled up) the frame,
            // there is no remaining guest-memory view worth preserving.
            return Some(self.send_copied(cookie, &hdr, frame, total_len));
        }

        if self.force_copy || !self.ring.tx_zero_copy_enabled() {
            let frame = read_all(&frame_segments, frame_len);
            return Some(self.send_copied(cookie, &hdr, frame, total_len));
        }

        Some(self.send_zero_copy(cookie, &hdr, frame_segments, frame_len, total_len))
    }

    fn send_copied(
        &self,
        cookie: u16,
        hdr: &VirtioNetHdr,
        mut frame: Vec<u8>,
        total_len: usize,
    ) -> TxOutcome {
        let frame_len = frame.len();
        let (checksum, lso) = match self.program_offload(hdr, &mut frame, frame_len) {
            Ok(v) => v,
            Err(()) => {
                self.ring.push(cookie, total_len as u32);
                return TxOutcome::Dropped;
            }
        };
        let outbound = OutboundFrame {
            blocks: vec![FrameBlock::Owned(frame)],
            checksum,
            lso,
        };
        let outcome = self.mac.send(outbound);
        // A fully copied frame no longer references guest memory, so the
        // descriptor can go back to the guest immediately rather than
        // waiting on the MAC client's own completion (§4.5's "the
        // descriptors can be marked as used now" case).
        self.ring.push(cookie, total_len as u32);
        outcome
    }

    fn send_zero_copy(
        &self,
        cookie: u16,
        hdr: &VirtioNetHdr,
        frame_segments: Vec<ChainSegment>,
        frame_len: usize,
        total_len: usize,
    ) -> TxOutcome {
        let cap = frame_len.min(VIONA_MAX_HDRS_LEN);
        let mut header_buf = vec![0u8; cap];
        let mut filled = 0usize;
        let mut split_index = frame_segments.len();
        let mut split_offset = 0usize;

        for (i, seg) in frame_segments.iter().enumerate() {
            if filled >= header_buf.len() {
                split_index = i;
                split_offset = 0;
                break;
            }
            let room = header_buf.len() - filled;
            let seg_len = seg.slice.len();
            let take = room.min(seg_len);
            let mut tmp = vec![0u8; take];
            seg.slice.read(&mut tmp);
            header_buf[filled..filled + take].copy_from_slice(&tmp);
            filled += take;
            if take < seg_len {
                split_index = i;
                split_offset = take;
                break;
            }
        }

        let (checksum, lso) = match self.program_offload(hdr, &mut header_buf, frame_len) {
            Ok(v) => v,
            Err(()) => {
                self.ring.push(cookie, total_len as u32);
                return TxOutcome::Dropped;
            }
        };

        let claim = match self.ring.try_claim_tx_slot(cookie) {
            Some(h) => h,
            None => {
                // A guest reusing a descriptor index before its prior
                // transfer was reclaimed; the data is simply dropped.
                debug!("tx reclamation slot for cookie {} still in use", cookie);
                self.ring.push(cookie, total_len as u32);
                return TxOutcome::Dropped;
            }
        };
        claim.write_header(&header_buf);

        let mut blocks = vec![FrameBlock::Owned(header_buf)];
        let completion: Arc<dyn TxCompletion> = Arc::new(RingTxCompletion {
            ring: self.ring.clone(),
            cookie,
        });

        for (i, seg) in frame_segments.into_iter().enumerate() {
            if i < split_index {
                continue;
            }
            if i == split_index {
                let remaining = seg.slice.len().saturating_sub(split_offset);
                if remaining == 0 {
                    continue;
                }
                let sub_gpa = seg.slice.base_gpa() + split_offset as u64;
                match self.ring.lease().translate(sub_gpa, remaining) {
                    Ok(slice) => {
                        claim.add_ref();
                        blocks.push(FrameBlock::ZeroCopy {
                            slice,
                            completion: completion.clone(),
                        });
                    }
                    Err(_) => debug!("tx zero-copy re-translate failed, truncating frame"),
                }
                continue;
            }
            claim.add_ref();
            blocks.push(FrameBlock::ZeroCopy {
                slice: seg.slice,
                completion: completion.clone(),
            });
        }

        self.ring.outstanding_add(1);
        let outbound = OutboundFrame { blocks, checksum, lso };
        let outcome = self.mac.send(outbound);
        claim.commit(total_len as u32);
        outcome
    }

    /// Validates and programs checksum/LSO offload fields (§4.5, ported
    /// from `viona_tx_csum`). Operates on `header` -- either the full
    /// frame (copied paths) or just the leading `VIONA_MAX_HDRS_LEN` bytes
    /// (zero-copy path) -- while `frame_len` is always the true total
    /// frame length, since the offset bounds check must hold against the
    /// whole frame even when only a prefix of it is in hand.
    fn program_offload(
        &self,
        hdr: &VirtioNetHdr,
        header: &mut [u8],
        frame_len: usize,
    ) -> Result<(Option<ChecksumOffload>, Option<LsoOffload>), ()> {
        if !self.features.csum() || !hdr.needs_csum() {
            return Ok((None, None));
        }

        let eth_len = checksum::eth_header_len(header);
        checksum::validate_bounds(eth_len, frame_len, header.len(), hdr.csum_start, hdr.csum_offset)
            .map_err(|_| ())?;

        let mut lso = None;
        if hdr.gso_type == VIRTIO_NET_HDR_GSO_TCPV4 && self.features.guest_tso4() {
            if header.len() < eth_len + 2 {
                return Err(());
            }
            let ethertype = u16::from_be_bytes([header[eth_len - 2], header[eth_len - 1]]);
            if ethertype == ETHERTYPE_IP {
                if header.len() < eth_len + 20 {
                    return Err(());
                }
                let ip_hdr_len = checksum::ipv4_header_len(&header[eth_len..]);
                let tcp_off = eth_len + ip_hdr_len;
                if header.len() < tcp_off + 20 {
                    return Err(());
                }
                // Guests cannot be trusted to have left the pseudo-header
                // length term out of their partial checksum the way this
                // hardware path expects, so it is always recomputed here.
                checksum::recompute_tcp_pseudo_partial(
                    header,
                    eth_len,
                    tcp_off,
                    TCP_CSUM_FIELD_OFFSET,
                );
                header[eth_len + 10] = 0;
                header[eth_len + 11] = 0;
                lso = Some(LsoOffload { mss: hdr.gso_size });
            }
        }

        Ok((
            Some(ChecksumOffload {
                csum_start: hdr.csum_start,
                csum_offset: hdr.csum_offset,
            }),
            lso,
        ))
    }
}

fn read_all(segments: &[ChainSegment], total: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(total);
    for seg in segments {
        let mut buf = vec![0u8; seg.slice.len()];
        seg.slice.read(&mut buf);
        out.extend_from_slice(&buf);
    }
    out
}

/// Bridges a zero-copy [`FrameBlock`]'s release back to the ring's TX
/// reclamation slot, the Rust-side stand-in for `viona_desb_release`.
struct RingTxCompletion {
    ring: Arc<Ring>,
    cookie: u16,
}

impl TxCompletion for RingTxCompletion {
    fn release(&self) {
        self.ring.release_tx_slot(self.cookie);
    }
}
