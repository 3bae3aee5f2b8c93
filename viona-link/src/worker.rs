// Copyright © 2026 The Viona Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Per-ring worker thread loops (§4.3 state machine, §4.5, §5 RX/TX
//! asymmetry), parented to the link rather than to a hypervisor host
//! process: `Link::delete` plays the role of "host process exiting" here.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, warn};

use viona_lease::GuestHold;
use viona_net::tx::TxEngine;
use viona_notify::{notify_guest, MsiSender};
use viona_queue::{Ring, RENEW, REQ_STOP};

/// Blocks until either a start or a stop request arrives while the ring is
/// still in SETUP/INIT. Returns `true` to proceed into the run loop, `false`
/// if the ring should tear down without ever having run (§4.3: "A `REQ_STOP`
/// observed in SETUP must still pass through INIT/cleanup").
fn await_start_or_stop(ring: &Ring) -> bool {
    ring.mark_init();
    loop {
        let flags = ring.wait_for_work();
        if flags & REQ_STOP != 0 {
            return false;
        }
        if flags & viona_queue::REQ_START != 0 {
            ring.mark_run();
            return true;
        }
    }
}

fn teardown(ring: &Ring) {
    ring.wait_outstanding();
    ring.unmap();
    ring.mark_reset();
}

/// The RX worker (§5, §9): it never touches the datapath. RX delivery is
/// driven directly off the bound MAC client's callback thread, into
/// `Link::deliver_rx_classified`/`deliver_rx_multicast`. This loop exists
/// only to renew the ring's lease on expiry and to notice a stop request, so
/// a ring with no inbound traffic still tears down promptly.
pub fn run_rx_monitor(ring: Arc<Ring>, hold: Arc<dyn GuestHold>) {
    if !await_start_or_stop(&ring) {
        teardown(&ring);
        return;
    }
    loop {
        let flags = ring.wait_for_work();
        if flags & REQ_STOP != 0 {
            teardown(&ring);
            return;
        }
        if flags & RENEW != 0 {
            ring.wait_outstanding();
            match ring.lease().renew(hold.as_ref()) {
                Ok(()) => {
                    debug!("rx lease renewed");
                    ring.clear_renew();
                }
                Err(e) => {
                    warn!("rx lease renewal failed, tearing down ring: {}", e);
                    teardown(&ring);
                    return;
                }
            }
        }
    }
}

/// The TX worker (§4.5): the sole driver of the transmit datapath.
pub fn run_tx_worker(
    ring: Arc<Ring>,
    hold: Arc<dyn GuestHold>,
    engine: TxEngine,
    msi: Arc<dyn MsiSender>,
    notify_on_empty: bool,
) {
    if !await_start_or_stop(&ring) {
        teardown(&ring);
        return;
    }
    ring.set_used_no_notify(false);

    'drain: loop {
        ring.set_used_no_notify(true);
        for _ in 0..ring.size().max(1) {
            if engine.tx_one().is_none() {
                break;
            }
        }
        ring.set_used_no_notify(false);
        std::sync::atomic::fence(Ordering::Acquire);
        if engine.tx_one().is_some() {
            continue 'drain;
        }

        if notify_on_empty {
            notify_guest(&ring, msi.as_ref());
        }

        let flags = ring.wait_for_work();
        if flags & REQ_STOP != 0 {
            teardown(&ring);
            return;
        }
        if flags & RENEW != 0 {
            ring.wait_outstanding();
            match ring.lease().renew(hold.as_ref()) {
                Ok(()) => {
                    debug!("tx lease renewed");
                    ring.clear_renew();
                }
                Err(e) => {
                    warn!("tx lease renewal failed, tearing down ring: {}", e);
                    teardown(&ring);
                    return;
                }
            }
        }
    }
}
