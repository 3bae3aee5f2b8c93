// Copyright © 2026 The Viona Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use thiserror::Error;

/// Reasons [`crate::Ring::pop_chain`] can fail to produce a chain.
///
/// Per §10.2 these are steady-state, guest-caused conditions recorded into
/// [`crate::RingStats`] rather than propagated as exceptional `Result`s on
/// the hot path; this enum exists so internal bookkeeping (incrementing the
/// right counter, logging at the right level) stays exhaustive and so tests
/// can assert on the exact failure mode without re-deriving it from stats.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    #[error("descriptor index {0} out of bounds")]
    BadIndex(u16),
    #[error("descriptor has zero length")]
    BadLength,
    #[error("descriptor address/length failed lease translation")]
    BadAddress,
    #[error("indirect table length is not a positive multiple of 16")]
    IndirectBadLength,
    #[error("indirect descriptor nested inside another indirect table")]
    IndirectBadNesting,
    #[error("indirect descriptor next index out of bounds")]
    IndirectBadNext,
    #[error("descriptor chain exceeds the per-chain segment cap")]
    TooManySegments,
    #[error("ring lease is not held")]
    NoLease,
}

/// Errors that can prevent a ring from being initialized (§6 RING_INIT).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RingMapError {
    #[error("queue size must be a power of two in 1..=32768")]
    BadSize,
    #[error("descriptor table address failed lease translation")]
    BadDescTable,
    #[error("available ring address failed lease translation")]
    BadAvailRing,
    #[error("used ring address failed lease translation")]
    BadUsedRing,
    #[error("lease could not be signed or renewed")]
    LeaseUnavailable,
}
