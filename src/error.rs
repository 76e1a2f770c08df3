//! Error and outcome types returned across the public API.

/// Error type for every fallible [`crate::Engine`] operation.
///
/// Generic over the embedder's [`crate::Flash::Error`] so a caller that
/// matches on `FlashFailure` still gets their own driver's error type
/// back, rather than a string or an opaque code.
#[derive(Debug, thiserror::Error)]
pub enum MfsError<E: core::fmt::Debug> {
    /// No record with this identifier exists (or it was erased).
    #[error("record id not found")]
    IdNotFound,

    /// A record's payload failed its CRC check. Only surfaced for the
    /// single record being read; it does not imply the rest of the
    /// store is compromised.
    #[error("payload CRC mismatch")]
    CrcError,

    /// The caller's buffer is smaller than the record being read.
    #[error("output buffer too small: need {needed}, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// A record is too large to ever fit in a bank's data region, even
    /// immediately after compaction.
    #[error("record of {size} bytes cannot fit in a bank of this geometry")]
    RecordTooLarge { size: usize },

    /// The underlying flash driver reported a failure. `None` when the
    /// failure was detected via readback/verify rather than a
    /// driver-reported error.
    #[error("flash program/verify failure: {0:?}")]
    FlashFailure(#[source] Option<E>),

    /// Both banks were unrecoverable, or repair did not converge within
    /// the configured attempt budget.
    #[error("mount did not converge within the repair attempt budget")]
    InternalError,

    /// A record operation was attempted before `start()`/`mount()`, or
    /// `mount()`/`start()` was called out of sequence. ChibiOS's MFS
    /// leaves this undefined behavior under `NDEBUG`; this
    /// implementation turns it into a recoverable error instead.
    #[error("engine used before start()/mount(), or called out of sequence")]
    NotReady,

    /// `start()` was given a [`crate::Config`] that can never be mounted:
    /// the two banks' byte capacities differ, or `max_repair_attempts`
    /// falls outside `1..=10`. Mirrors `mfs.h`'s `#error` preprocessor
    /// checks on `MFS_CFG_MAX_REPAIR_ATTEMPTS`, done at `start()` time
    /// instead since this crate's tunable is a runtime config field.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Result of a successful [`crate::Engine::mount`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountOutcome {
    /// Both banks agreed and no repair was necessary.
    Clean,
    /// A repair pass (compaction, reclaiming a partial or mismatched
    /// bank) ran before the store reached a consistent state.
    Repaired,
}

/// Result of a successful [`crate::Engine::update_record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The new version was appended without needing to reclaim space.
    Written,
    /// The active bank was full; a compaction ran before the new
    /// version was appended.
    WrittenAfterCompaction,
}
