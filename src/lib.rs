//! Managed Flash Storage: a log-structured, dual-bank record store for
//! raw NOR-like flash.
//!
//! The store keeps every record as an identifier plus an opaque byte
//! payload, appended to one of two banks in strict chronological order.
//! A bank header carries a monotonic wear counter so that after a
//! power loss, mounting can always tell which of the two banks (if
//! either) is authoritative, and repair the other by compacting live
//! records across. See [`Engine`] for the operations this provides.
#![no_std]

mod error;
mod flash;
mod index;
mod layout;
mod mount;
mod record;
mod scanner;
mod state;

pub use error::{MfsError, MountOutcome, UpdateOutcome};
pub use flash::Flash;
pub use mount::DEFAULT_MAX_REPAIR_ATTEMPTS;

use log::debug;

use index::IndexCache;
use mount::{BankGeometry, MountState};
use state::State;

/// Configuration supplied to [`Engine::start`]: the flash device plus
/// the two banks' geometry, expressed in sector indices so that
/// devices with non-uniform sector sizes are handled correctly.
pub struct Config<F: Flash> {
    pub flash: F,
    pub bank0_start: u32,
    pub bank0_sectors: u32,
    pub bank1_start: u32,
    pub bank1_sectors: u32,
    /// Upper bound on repair attempts during [`Engine::mount`] before
    /// giving up with [`MfsError::InternalError`]. Must be in `1..=10`;
    /// [`Engine::start`] rejects anything outside that range with
    /// [`MfsError::InvalidConfig`].
    pub max_repair_attempts: u8,
    /// Whether every `program()` call (bank headers, record headers,
    /// payloads) is read back and compared before the engine trusts it.
    /// A mismatch surfaces as [`MfsError::FlashFailure`]. Defaults to
    /// `true`; disable only if the embedder's own `Flash` impl already
    /// verifies internally and the extra reads are unaffordable.
    pub write_verify: bool,
}

impl<F: Flash> Config<F> {
    /// A config with [`DEFAULT_MAX_REPAIR_ATTEMPTS`], write-verify
    /// enabled, and the given flash and bank geometry.
    pub fn new(flash: F, bank0_start: u32, bank0_sectors: u32, bank1_start: u32, bank1_sectors: u32) -> Self {
        Config {
            flash,
            bank0_start,
            bank0_sectors,
            bank1_start,
            bank1_sectors,
            max_repair_attempts: DEFAULT_MAX_REPAIR_ATTEMPTS,
            write_verify: true,
        }
    }
}

fn resolve_geometry<F: Flash>(flash: &F, start: u32, sectors: u32) -> BankGeometry {
    let (base, _) = flash.sector_bounds(start);
    let mut len = 0usize;
    for s in 0..sectors {
        let (_, sector_len) = flash.sector_bounds(start + s);
        len += sector_len;
    }
    BankGeometry {
        base,
        len,
        sector_start: start,
        sector_count: sectors,
    }
}

/// The store itself.
///
/// `ID_CACHE_SIZE` bounds the number of identifiers whose most recent
/// location is cached in RAM; a miss costs an extra backward scan of
/// the active bank's log rather than correctness, so tuning this is a
/// pure performance knob. `0` disables the cache.
pub struct Engine<F: Flash, const ID_CACHE_SIZE: usize = 16> {
    inner: Inner<F>,
    cache: IndexCache<ID_CACHE_SIZE>,
    state: State,
}

struct Inner<F: Flash> {
    flash: Option<F>,
    bank0: Option<BankGeometry>,
    bank1: Option<BankGeometry>,
    max_repair_attempts: u8,
    write_verify: bool,
    mount: Option<MountState>,
}

impl<F: Flash, const N: usize> Default for Engine<F, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Flash, const N: usize> Engine<F, N> {
    /// A fresh, unattached engine. Call [`Engine::start`] before doing
    /// anything else.
    pub fn new() -> Self {
        Engine {
            inner: Inner {
                flash: None,
                bank0: None,
                bank1: None,
                max_repair_attempts: DEFAULT_MAX_REPAIR_ATTEMPTS,
                write_verify: true,
                mount: None,
            },
            cache: IndexCache::new(),
            state: State::Stop,
        }
    }

    /// Attach a flash device and its bank geometry. Does not scan or
    /// mount; call [`Engine::mount`] next.
    pub fn start(&mut self, config: Config<F>) -> Result<(), MfsError<F::Error>> {
        if self.state != State::Stop {
            return Err(MfsError::NotReady);
        }
        if !(1..=10).contains(&config.max_repair_attempts) {
            return Err(MfsError::InvalidConfig("max_repair_attempts must be in 1..=10"));
        }
        let bank0 = resolve_geometry(&config.flash, config.bank0_start, config.bank0_sectors);
        let bank1 = resolve_geometry(&config.flash, config.bank1_start, config.bank1_sectors);
        if bank0.len != bank1.len {
            return Err(MfsError::InvalidConfig("bank0 and bank1 must have equal byte capacity"));
        }
        self.inner.flash = Some(config.flash);
        self.inner.bank0 = Some(bank0);
        self.inner.bank1 = Some(bank1);
        self.inner.max_repair_attempts = config.max_repair_attempts;
        self.inner.write_verify = config.write_verify;
        self.state = State::Ready;
        Ok(())
    }

    /// Detach the flash device, returning it and its geometry as a
    /// [`Config`] so it can be reused (e.g. to `start()` a different
    /// engine instance, common in tests).
    pub fn stop(&mut self) -> Config<F> {
        debug_assert!(self.state != State::Stop, "stop() called on an already-stopped engine");
        let flash = self.inner.flash.take().expect("stop() requires start() first");
        let bank0 = self.inner.bank0.take().expect("stop() requires start() first");
        let bank1 = self.inner.bank1.take().expect("stop() requires start() first");
        self.inner.mount = None;
        self.cache.clear();
        self.state = State::Stop;
        Config {
            flash,
            bank0_start: bank0.sector_start,
            bank0_sectors: bank0.sector_count,
            bank1_start: bank1.sector_start,
            bank1_sectors: bank1.sector_count,
            max_repair_attempts: self.inner.max_repair_attempts,
            write_verify: self.inner.write_verify,
        }
    }

    /// Scan both banks and bring the store to a mounted, usable state,
    /// repairing (compacting) as needed. Idempotent: calling this on an
    /// already-mounted engine is a no-op that returns `Ok(Clean)`
    /// without re-scanning.
    pub fn mount(&mut self) -> Result<MountOutcome, MfsError<F::Error>> {
        if self.state == State::Stop {
            return Err(MfsError::NotReady);
        }
        if self.state == State::Mounted {
            // Already mounted: spec.md §7 asks for this to be a no-op
            // rather than a re-scan, so the cache and in-RAM offsets a
            // caller may be mid-sequence with are left untouched.
            return Ok(MountOutcome::Clean);
        }
        let flash = self.inner.flash.as_mut().expect("checked by state");
        let bank0 = self.inner.bank0.expect("checked by state");
        let bank1 = self.inner.bank1.expect("checked by state");

        let result = mount::mount(flash, bank0, bank1, self.inner.max_repair_attempts, self.inner.write_verify)?;
        debug!(
            "mounted bank {:?}, counter {}, used {} bytes",
            result.active, result.counter, result.used_space
        );
        let outcome = if result.repaired {
            MountOutcome::Repaired
        } else {
            MountOutcome::Clean
        };
        self.cache.clear();
        let active_geo = mount::geometry(result.active, bank0, bank1);
        scanner::walk_forward(
            flash,
            active_geo.base,
            result.data_start,
            result.next_offset,
            F::PROGRAM_GRANULARITY,
            |offset, header| {
                // Oldest to newest, per spec.md §4.5: a tombstone
                // (`size == 0`) removes the id again via `insert`'s own
                // handling of it, so whichever header is encountered
                // last for an id is the one left cached.
                self.cache.insert(header.id, offset, header.size);
                true
            },
        )
        .map_err(|e| MfsError::FlashFailure(Some(e)))?;
        self.inner.mount = Some(result);
        self.state = State::Mounted;
        Ok(outcome)
    }

    /// Drop back to `Ready`, discarding the in-RAM mount state and
    /// index cache (nothing on flash changes).
    pub fn unmount(&mut self) {
        self.inner.mount = None;
        self.cache.clear();
        if self.state == State::Mounted {
            self.state = State::Ready;
        }
    }

    /// Read the current value of `id` into `out`, returning the number
    /// of bytes written.
    pub fn read_record(&mut self, id: u32, out: &mut [u8]) -> Result<usize, MfsError<F::Error>> {
        self.with_mounted(|flash, bank0, bank1, mount, cache| {
            record::read_record(flash, bank0, bank1, mount, cache, id, out)
        })
    }

    /// Write a new version of `id`, appending to the log. May trigger a
    /// compaction internally if the active bank is full.
    pub fn update_record(&mut self, id: u32, data: &[u8]) -> Result<UpdateOutcome, MfsError<F::Error>> {
        let verify = self.inner.write_verify;
        self.with_mounted_mut(|flash, bank0, bank1, mount, cache| {
            record::update_record(flash, bank0, bank1, mount, cache, id, data, verify)
        })
    }

    /// Append a tombstone for `id`. Returns [`MfsError::IdNotFound`] if
    /// `id` does not currently exist.
    pub fn erase_record(&mut self, id: u32) -> Result<(), MfsError<F::Error>> {
        let verify = self.inner.write_verify;
        self.with_mounted_mut(|flash, bank0, bank1, mount, cache| {
            record::erase_record(flash, bank0, bank1, mount, cache, id, verify)
        })
    }

    fn with_mounted<R>(
        &mut self,
        f: impl FnOnce(&mut F, BankGeometry, BankGeometry, &MountState, &mut IndexCache<N>) -> Result<R, MfsError<F::Error>>,
    ) -> Result<R, MfsError<F::Error>> {
        debug_assert!(self.state == State::Mounted, "record operation before mount()");
        if self.state != State::Mounted {
            return Err(MfsError::NotReady);
        }
        let flash = self.inner.flash.as_mut().expect("checked by state");
        let bank0 = self.inner.bank0.expect("checked by state");
        let bank1 = self.inner.bank1.expect("checked by state");
        let mount = self.inner.mount.as_ref().expect("checked by state");
        f(flash, bank0, bank1, mount, &mut self.cache)
    }

    fn with_mounted_mut<R>(
        &mut self,
        f: impl FnOnce(&mut F, BankGeometry, BankGeometry, &mut MountState, &mut IndexCache<N>) -> Result<R, MfsError<F::Error>>,
    ) -> Result<R, MfsError<F::Error>> {
        debug_assert!(self.state == State::Mounted, "record operation before mount()");
        if self.state != State::Mounted {
            return Err(MfsError::NotReady);
        }
        let flash = self.inner.flash.as_mut().expect("checked by state");
        let bank0 = self.inner.bank0.expect("checked by state");
        let bank1 = self.inner.bank1.expect("checked by state");
        let mount = self.inner.mount.as_mut().expect("checked by state");
        f(flash, bank0, bank1, mount, &mut self.cache)
    }
}

/// Bank identifier, exposed so callers inspecting [`MountOutcome`] in
/// logs or diagnostics can name which bank is active.
pub use mount::Bank as ActiveBank;
