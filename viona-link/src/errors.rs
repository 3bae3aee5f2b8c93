// Copyright © 2026 The Viona Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use thiserror::Error;

use viona_hook::HookError;
use viona_lease::LeaseError;
use viona_queue::{PopError, RingMapError};

/// Link-level error hierarchy (§10.2), aggregating the narrower per-module
/// enums plus the control-surface-shaped conditions of §6's command table.
/// Each variant is documented against the errno it historically corresponds
/// to, for a front-end that needs to translate this into one.
#[derive(Debug, Error)]
pub enum LinkError {
    /// CREATE: the bound MAC client or VMM handle was not valid (EBADF).
    #[error("bad handle: {0}")]
    BadHandle(String),
    /// CREATE: a link with this id already exists (EEXIST).
    #[error("link already exists")]
    AlreadyExists,
    /// CREATE: the link's netstack has no registered hook context (EIO).
    #[error("no hook context for this zone")]
    NoHookContext(#[from] HookError),
    /// DELETE: teardown already in progress on another thread (EAGAIN).
    #[error("link teardown already in progress")]
    TeardownInProgress,
    /// RING_INIT / RING_KICK / RING_SET_MSI / RING_INTR_CLR: a bad ring
    /// index, queue size, or guest address (EINVAL).
    #[error("invalid argument: {0}")]
    Invalid(String),
    /// RING_INIT: the ring was not in RESET (EBUSY).
    /// RING_KICK: the ring was not in a kickable state (EBUSY).
    #[error("ring is busy")]
    Busy,
    /// RING_RESET (signal-honoring variant): interrupted before reaching
    /// RESET (EINTR).
    #[error("interrupted before reset completed")]
    Interrupted,
    /// All operations: the link has already been (or is being) destroyed
    /// (ENXIO).
    #[error("link is gone")]
    Gone,
    /// Lease-level failures surfaced during ring setup or renewal.
    #[error("lease error: {0}")]
    Lease(#[from] LeaseError),
}

impl From<RingMapError> for LinkError {
    fn from(e: RingMapError) -> LinkError {
        LinkError::Invalid(e.to_string())
    }
}

impl From<PopError> for LinkError {
    fn from(e: PopError) -> LinkError {
        LinkError::Invalid(e.to_string())
    }
}
