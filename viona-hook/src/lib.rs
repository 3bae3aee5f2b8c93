// Copyright © 2026 The Viona Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Per-zone packet hook bridge (§4.8), ported from the netstack-instance
//! bookkeeping in `viona_neti_create`/`_shutdown`/`_destroy` and the
//! inline filtering call in `viona_hook`.
//!
//! Every link belongs to exactly one zone's [`HookContext`]. Contexts are
//! shared, refcounted, and created lazily the first time a link in a given
//! zone registers; a zone's teardown path runs in two phases -- `shutdown`
//! unhooks new registrations and removes the context from the registry,
//! while `destroy` blocks until every link still holding a reference has
//! released it, then frees the context. This mirrors the two-callback
//! netstack destructor contract rather than a single free-on-last-drop,
//! since the underlying nethook framework it bridges to has the same split.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use log::debug;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HookError {
    #[error("no hook context registered for zone {0}")]
    NoSuchZone(u64),
    #[error("hook context for zone {0} is shutting down")]
    ShuttingDown(u64),
}

/// Direction a frame is travelling relative to the guest, matching the
/// `out` boolean of `viona_hook`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Guest -> network (TX).
    Out,
    /// Network -> guest (RX).
    In,
}

/// A packet filter callout. `filter` receives ownership of the frame and
/// returns it back (possibly mutated) if it passes, or `None` to drop it --
/// mirroring `hook_run`'s in-place `mblk_t **` mutate-or-consume contract
/// without needing raw mblk plumbing.
pub trait PacketHook: Send + Sync {
    fn filter(&self, dir: Direction, frame: Vec<u8>) -> Option<Vec<u8>>;
}

struct NoopHook;

impl PacketHook for NoopHook {
    fn filter(&self, _dir: Direction, frame: Vec<u8>) -> Option<Vec<u8>> {
        Some(frame)
    }
}

struct State {
    hooked: bool,
    refs: u64,
    shutdown: bool,
}

/// The per-zone (netstack) hook context. One is created the first time a
/// zone's first link registers, shared by every subsequent link in the same
/// zone (`viona_neti_lookup_by_zid` bumps a refcount rather than allocating
/// again).
pub struct HookContext {
    zone_id: u64,
    hook: Mutex<Arc<dyn PacketHook>>,
    state: Mutex<State>,
    cv: Condvar,
}

impl HookContext {
    fn new(zone_id: u64) -> Arc<Self> {
        Arc::new(HookContext {
            zone_id,
            hook: Mutex::new(Arc::new(NoopHook)),
            state: Mutex::new(State {
                hooked: true,
                refs: 0,
                shutdown: false,
            }),
            cv: Condvar::new(),
        })
    }

    pub fn zone_id(&self) -> u64 {
        self.zone_id
    }

    /// Installs the filter callout used for every subsequent [`run`] call
    /// (the nethook framework's registration step, collapsed to a single
    /// swap since this crate has only one consumer per context rather than
    /// a chain of registered hook functions).
    ///
    /// [`run`]: HookContext::run
    pub fn set_hook(&self, hook: Arc<dyn PacketHook>) {
        *self.hook.lock().unwrap() = hook;
    }

    /// Runs the installed hook over `frame`, per `viona_hook`: a context
    /// that has already begun shutdown, or was never successfully hooked
    /// at creation, passes every frame through untouched.
    pub fn run(&self, dir: Direction, frame: Vec<u8>) -> Option<Vec<u8>> {
        let s = self.state.lock().unwrap();
        if !s.hooked || s.shutdown {
            return Some(frame);
        }
        drop(s);
        self.hook.lock().unwrap().filter(dir, frame)
    }

    /// Cheap predicate mirroring `VNETHOOK_INTERESTED_OUT`/`_IN`: lets a
    /// caller skip building a frame it would only hand to [`run`] to get
    /// back untouched, without taking the hook lock on every packet.
    pub fn is_active(&self) -> bool {
        let s = self.state.lock().unwrap();
        s.hooked && !s.shutdown
    }

    fn add_ref(&self) {
        self.state.lock().unwrap().refs += 1;
    }

    fn release(&self) {
        let mut s = self.state.lock().unwrap();
        assert!(s.refs > 0, "hook context refcount underflow");
        s.refs -= 1;
        drop(s);
        self.cv.notify_all();
    }

    fn begin_shutdown(&self) {
        let mut s = self.state.lock().unwrap();
        s.shutdown = true;
        s.hooked = false;
        debug!("hook context for zone {} unhooked", self.zone_id);
    }

    fn wait_for_quiescence(&self) {
        let mut s = self.state.lock().unwrap();
        while s.refs != 0 {
            s = self.cv.wait(s).unwrap();
        }
    }
}

/// RAII handle returned by [`HookRegistry::lookup`]. Mirrors the
/// `viona_neti_lookup_by_zid` / `viona_neti_rele` pairing: holding one keeps
/// the context's `destroy` phase blocked until the link releases it.
pub struct HookContextRef {
    ctx: Arc<HookContext>,
}

impl std::ops::Deref for HookContextRef {
    type Target = HookContext;
    fn deref(&self) -> &HookContext {
        &self.ctx
    }
}

impl HookContextRef {
    /// Clones the inner context handle for use by long-lived datapath
    /// objects (the RX/TX engines), independent of the zone-teardown
    /// refcount this guard itself holds -- a plain `Arc` clone, not an
    /// additional [`HookRegistry::lookup`].
    pub fn context(&self) -> Arc<HookContext> {
        self.ctx.clone()
    }
}

impl Drop for HookContextRef {
    fn drop(&mut self) {
        self.ctx.release();
    }
}

/// Process-wide registry of per-zone hook contexts, ported from the
/// `viona_neti_list` global list plus its guarding mutex.
#[derive(Default)]
pub struct HookRegistry {
    contexts: Mutex<HashMap<u64, Arc<HookContext>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        HookRegistry {
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// Creates and registers a context for `zone_id` (`viona_neti_create`).
    /// Idempotent: re-creating for a zone that is already registered just
    /// returns the existing context, matching the fact that the real driver
    /// calls this once per already-running netstack at attach time and
    /// again only for genuinely new netstacks.
    pub fn create(&self, zone_id: u64) -> Arc<HookContext> {
        let mut contexts = self.contexts.lock().unwrap();
        contexts
            .entry(zone_id)
            .or_insert_with(|| HookContext::new(zone_id))
            .clone()
    }

    /// Looks up a live context by zone id, taking a reference
    /// (`viona_neti_lookup_by_zid`). Fails if the zone was never created or
    /// has already begun shutdown -- a link creation racing a zone halt
    /// must not resurrect a context mid-teardown.
    pub fn lookup(&self, zone_id: u64) -> Result<HookContextRef, HookError> {
        let contexts = self.contexts.lock().unwrap();
        let ctx = contexts
            .get(&zone_id)
            .ok_or(HookError::NoSuchZone(zone_id))?
            .clone();
        drop(contexts);
        {
            let s = ctx.state.lock().unwrap();
            if s.shutdown {
                return Err(HookError::ShuttingDown(zone_id));
            }
        }
        ctx.add_ref();
        Ok(HookContextRef { ctx })
    }

    /// Phase one of netstack teardown (`viona_neti_shutdown`): removes the
    /// context from the registry and unhooks it, but does not free it --
    /// links already holding a [`HookContextRef`] keep working until they
    /// release it.
    pub fn shutdown(&self, zone_id: u64) {
        let ctx = self.contexts.lock().unwrap().remove(&zone_id);
        if let Some(ctx) = ctx {
            ctx.begin_shutdown();
        }
    }

    /// Phase two (`viona_neti_destroy`): blocks until every outstanding
    /// reference has been released. Callers must have already called
    /// [`shutdown`] for this zone.
    ///
    /// [`shutdown`]: HookRegistry::shutdown
    pub fn destroy(&self, ctx: Arc<HookContext>) {
        ctx.wait_for_quiescence();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    struct DropEveryOther {
        count: AtomicUsize,
    }

    impl PacketHook for DropEveryOther {
        fn filter(&self, _dir: Direction, frame: Vec<u8>) -> Option<Vec<u8>> {
            let n = self.count.fetch_add(1, Ordering::Relaxed);
            if n % 2 == 0 {
                Some(frame)
            } else {
                None
            }
        }
    }

    #[test]
    fn create_is_idempotent_per_zone() {
        let reg = HookRegistry::new();
        let a = reg.create(7);
        let b = reg.create(7);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn lookup_fails_for_unknown_zone() {
        let reg = HookRegistry::new();
        assert!(matches!(reg.lookup(1), Err(HookError::NoSuchZone(1))));
    }

    #[test]
    fn untouched_context_passes_frames_through() {
        let reg = HookRegistry::new();
        reg.create(1);
        let r = reg.lookup(1).unwrap();
        let frame = vec![1, 2, 3];
        assert_eq!(r.run(Direction::Out, frame.clone()), Some(frame));
    }

    #[test]
    fn installed_hook_filters_frames() {
        let reg = HookRegistry::new();
        let ctx = reg.create(1);
        ctx.set_hook(Arc::new(DropEveryOther {
            count: AtomicUsize::new(0),
        }));
        let r = reg.lookup(1).unwrap();
        assert!(r.run(Direction::In, vec![0]).is_some());
        assert!(r.run(Direction::In, vec![1]).is_none());
    }

    #[test]
    fn shutdown_unhooks_and_removes_from_registry() {
        let reg = HookRegistry::new();
        reg.create(5);
        let held = reg.lookup(5).unwrap();
        reg.shutdown(5);

        // A reference taken before shutdown still runs, but now passes
        // every frame through untouched.
        assert_eq!(held.run(Direction::Out, vec![9]), Some(vec![9]));
        // A new lookup after shutdown fails outright.
        assert!(matches!(reg.lookup(5), Err(HookError::ShuttingDown(5))));
    }

    #[test]
    fn destroy_blocks_until_refs_drop_to_zero() {
        let reg = Arc::new(HookRegistry::new());
        let ctx = reg.create(3);
        let held = reg.lookup(3).unwrap();
        reg.shutdown(3);

        let reg2 = reg.clone();
        let ctx2 = ctx.clone();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(held);
            let _ = &reg2;
            let _ = &ctx2;
        });
        reg.destroy(ctx);
        releaser.join().unwrap();
    }
}
