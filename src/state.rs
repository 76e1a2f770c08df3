//! C7: driver state machine.
//!
//! Mirrors ChibiOS's `MFS_UNINIT -> MFS_STOP -> MFS_READY -> MFS_MOUNTED`
//! progression. `MFS_ACTIVE` (a record operation in flight) is not
//! represented as a stored state here: it would never be observable
//! between two calls on a single-threaded, non-reentrant engine, so it
//! only exists as a `debug_assert!`-checked invariant at the top of
//! each record operation (see [`crate::Engine`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No flash device attached yet.
    Stop,
    /// Flash attached via `start()`, but not yet mounted.
    Ready,
    /// Mounted: exactly one bank is authoritative and record operations
    /// are permitted.
    Mounted,
}
