// Copyright © 2026 The Viona Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Guest->host kick dispatch and host->guest interrupt delivery (§4.6).
//!
//! Two independent directions live here: [`dispatch_kick`] routes a guest
//! notification (an ioport write, or a direct call from a higher-level
//! control surface) to the right [`Ring`] by queue index; [`notify_guest`]
//! delivers a completion back to the guest, either as an MSI message or as
//! a one-shot edge-triggered readiness signal when no MSI address has been
//! configured for the ring.

use std::io;
use std::sync::Arc;

use log::{debug, warn};
use thiserror::Error;

use viona_queue::Ring;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum NotifyError {
    #[error("queue index {0} out of range")]
    BadQueueIndex(u16),
    #[error("ioport write did not match the registered kick port (addr={addr:#x} size={size})")]
    BadIoport { addr: u64, size: u8 },
}

/// Routes a kick to `rings[queue_idx]`, per §4.6 `RING_KICK`. Returns
/// `Ok(())` whether or not the ring actually had work to do -- `Ring::kick`
/// itself decides whether a wakeup was needed.
pub fn dispatch_kick(rings: &[Arc<Ring>], queue_idx: u16) -> Result<(), NotifyError> {
    let ring = rings
        .get(queue_idx as usize)
        .ok_or(NotifyError::BadQueueIndex(queue_idx))?;
    if !ring.kick() {
        debug!("kick on queue {} ignored, ring is not active", queue_idx);
    }
    Ok(())
}

/// A registered guest->host kick ioport (§6 `SET_NOTIFY_IOPORT`). The
/// written value is the target queue index, per the virtio notify-ioport
/// convention.
pub struct NotifyIoport {
    addr: u64,
    size: u8,
}

impl NotifyIoport {
    pub fn new(addr: u64, size: u8) -> Self {
        NotifyIoport { addr, size }
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn size(&self) -> u8 {
        self.size
    }

    /// Validates that a bus write actually targets this port (mirroring
    /// `viona_notify_wcb`'s address/size match before falling through to
    /// `viona_ioc_ring_kick`) and, if so, dispatches the kick.
    pub fn handle_write(
        &self,
        addr: u64,
        size: u8,
        queue_idx: u16,
        rings: &[Arc<Ring>],
    ) -> Result<(), NotifyError> {
        if addr != self.addr || size != self.size {
            return Err(NotifyError::BadIoport {
                addr: self.addr,
                size: self.size,
            });
        }
        dispatch_kick(rings, queue_idx)
    }
}

/// A host-side sink for MSI messages. `Link` supplies the real hypervisor
/// binding; tests and any software-only delivery path can use a closure or
/// channel-backed stand-in.
pub trait MsiSender: Send + Sync {
    fn signal_msi(&self, addr: u32, data: u32) -> io::Result<()>;
}

/// Outcome of a single [`notify_guest`] call, for callers that want to log
/// or count delivery attempts distinctly from suppressed ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptOutcome {
    /// Delivered via MSI.
    Delivered,
    /// No MSI configured; the edge-readiness flag made the 0->1 transition
    /// and the caller should wake any waiting pollers.
    EdgeSignaled,
    /// No MSI configured and the edge-readiness flag was already set; a
    /// prior completion has not yet been consumed, so no extra wakeup is
    /// needed.
    Suppressed,
    /// MSI delivery was attempted but the sender reported failure.
    Failed,
}

/// Delivers one ring's pending completion to the guest (§4.6, ported from
/// `viona_intr_ring`): MSI if configured, otherwise the one-shot edge
/// signal.
pub fn notify_guest(ring: &Ring, sender: &dyn MsiSender) -> InterruptOutcome {
    if let Some((addr, data)) = ring.msi() {
        return match sender.signal_msi(addr, data) {
            Ok(()) => InterruptOutcome::Delivered,
            Err(e) => {
                warn!("MSI delivery failed: {}", e);
                InterruptOutcome::Failed
            }
        };
    }
    if ring.signal_edge() {
        InterruptOutcome::EdgeSignaled
    } else {
        InterruptOutcome::Suppressed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use vm_memory::{GuestAddress, GuestMemoryAtomic, GuestMemoryMmap};
    use viona_lease::{GuestHold, Lease};

    use super::*;

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

    fn make_ring() -> Arc<Ring> {
        let mmap = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 1 << 16)]).unwrap();
        let mem = GuestMemoryAtomic::new(mmap);
        let hold = Arc::new(TestHold {
            mem,
            closing: AtomicBool::new(false),
        });
        let lease = Lease::sign(hold.as_ref(), || {}).unwrap();
        let ring = Arc::new(Ring::new(lease));
        ring.map(0, 4096, 8192, 4, None).unwrap();
        ring
    }

    #[derive(Default)]
    struct RecordingSender {
        calls: Mutex<Vec<(u32, u32)>>,
        fail: AtomicBool,
    }

    impl MsiSender for RecordingSender {
        fn signal_msi(&self, addr: u32, data: u32) -> io::Result<()> {
            if self.fail.load(Ordering::Acquire) {
                return Err(io::Error::new(io::ErrorKind::Other, "nope"));
            }
            self.calls.lock().unwrap().push((addr, data));
            Ok(())
        }
    }

    #[test]
    fn dispatch_kick_rejects_out_of_range_index() {
        let rings = vec![make_ring()];
        assert_eq!(
            dispatch_kick(&rings, 1),
            Err(NotifyError::BadQueueIndex(1))
        );
    }

    #[test]
    fn dispatch_kick_routes_to_correct_ring() {
        let rings = vec![make_ring(), make_ring()];
        rings[1].mark_init();
        dispatch_kick(&rings, 1).unwrap();
        assert_eq!(rings[1].flags() & viona_queue::REQ_START, viona_queue::REQ_START);
    }

    #[test]
    fn ioport_write_validates_addr_and_size() {
        let rings = vec![make_ring()];
        let port = NotifyIoport::new(0xc000, 2);
        assert_eq!(
            port.handle_write(0xc002, 2, 0, &rings),
            Err(NotifyError::BadIoport {
                addr: 0xc000,
                size: 2
            })
        );
        assert!(port.handle_write(0xc000, 2, 0, &rings).is_ok());
    }

    #[test]
    fn notify_guest_prefers_msi_when_configured() {
        let ring = make_ring();
        ring.set_msi(0x1234, 0x56);
        let sender = RecordingSender::default();
        assert_eq!(notify_guest(&ring, &sender), InterruptOutcome::Delivered);
        assert_eq!(*sender.calls.lock().unwrap(), vec![(0x1234, 0x56)]);
    }

    #[test]
    fn notify_guest_falls_back_to_edge_signal() {
        let ring = make_ring();
        let sender = RecordingSender::default();
        assert_eq!(notify_guest(&ring, &sender), InterruptOutcome::EdgeSignaled);
        assert_eq!(notify_guest(&ring, &sender), InterruptOutcome::Suppressed);
        assert!(ring.clear_edge());
        assert_eq!(notify_guest(&ring, &sender), InterruptOutcome::EdgeSignaled);
    }

    #[test]
    fn notify_guest_reports_msi_failure() {
        let ring = make_ring();
        ring.set_msi(1, 1);
        let sender = RecordingSender::default();
        sender.fail.store(true, Ordering::Release);
        assert_eq!(notify_guest(&ring, &sender), InterruptOutcome::Failed);
    }
}
