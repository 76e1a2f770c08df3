//! Shared black-box test double for the integration suite: an in-memory
//! flash simulator modeled on
//! `other_examples/7b5e2c8a_Sympatron-embedded-storage-sim`'s
//! `SimulatedNorFlash`, plus the sector-geometry helper from the
//! `flash-layout` workspace member (the same crate the teacher repo
//! ships for describing erase-block layouts) so bank geometry in tests
//! is expressed the same way an embedder would describe a real device.

use flash_layout::{FlashLayout, Region};
use mfs::Flash;

/// Route the crate's `log` output through `env_logger` for this test
/// binary, so a failing test can be re-run with `RUST_LOG=mfs=trace`
/// to see every mount/repair/compaction decision. Modeled on
/// `vectordotdev-vector`'s `k8s-runtime` test harness, which does the
/// same `is_test(true)` + `try_init` dance so repeated calls across
/// tests in one binary don't panic on double-init.
pub fn trace_init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimError {
    /// A `program()` call was interrupted partway through, simulating a
    /// power loss. The bytes that made it out before the cut are still
    /// on "flash" (this is the whole point: a real device does not roll
    /// a torn write back).
    Torn,
}

/// In-memory NOR flash double. `sector_size` bytes per sector,
/// `PROGRAM_GRANULARITY` fixed at 4. Optionally trips a simulated power
/// loss after a fixed number of bytes have been programmed in total,
/// truncating whichever `program()` call crosses that budget.
pub struct SimFlash {
    data: Vec<u8>,
    sector_size: usize,
    budget: Option<usize>,
}

impl SimFlash {
    /// A healthy device with no torn writes, `total_bytes` spread over
    /// equally sized `sector_size`-byte sectors.
    pub fn new(total_bytes: usize, sector_size: usize) -> Self {
        assert_eq!(total_bytes % sector_size, 0);
        SimFlash {
            data: vec![0xFFu8; total_bytes],
            sector_size,
            budget: None,
        }
    }

    /// Like [`SimFlash::new`], but the `budget`-th byte programmed
    /// across every `program()` call trips [`SimError::Torn`], with
    /// only the bytes up to that point actually landing on "flash".
    pub fn with_torn_write(total_bytes: usize, sector_size: usize, budget: usize) -> Self {
        let mut f = Self::new(total_bytes, sector_size);
        f.budget = Some(budget);
        f
    }

    /// Rebuild a device from raw bytes captured mid-operation (e.g.
    /// right after a simulated power loss), with torn-write injection
    /// disabled — models the power coming back on.
    pub fn power_cycle(bytes: Vec<u8>, sector_size: usize) -> Self {
        SimFlash {
            data: bytes,
            sector_size,
            budget: None,
        }
    }

    /// Rebuild a device from bytes captured from a previously healthy
    /// session, but with a torn-write budget armed for what comes next
    /// — models a device that was fine until this point, then lost
    /// power partway through the next `program()` call.
    pub fn with_torn_write_from(bytes: Vec<u8>, sector_size: usize, budget: usize) -> Self {
        SimFlash {
            data: bytes,
            sector_size,
            budget: Some(budget),
        }
    }

    /// Snapshot the raw bytes, e.g. to feed into [`SimFlash::power_cycle`].
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.clone()
    }

    fn layout(&self) -> FlashLayout<'static> {
        // `Region` must outlive the call; leak a tiny one-shot
        // descriptor rather than threading a lifetime through every
        // test (this is test-only code, not part of the crate).
        let region: &'static [Region] = Box::leak(Box::new([Region {
            addr: 0,
            eb_bytes: self.sector_size as u32,
            eb_count: (self.data.len() / self.sector_size) as u32,
        }]));
        FlashLayout::new(region)
    }
}

impl Flash for SimFlash {
    type Error = SimError;
    const PROGRAM_GRANULARITY: usize = 4;

    fn sector_bounds(&self, sector: u32) -> (usize, usize) {
        let eb = self
            .layout()
            .find_eb_by_eb_num(sector)
            .expect("sector out of range");
        (eb.addr_start() as usize, eb.len() as usize)
    }

    fn erase_sector(&mut self, sector: u32) -> Result<(), Self::Error> {
        let (start, len) = self.sector_bounds(sector);
        self.data[start..start + len].fill(0xFF);
        Ok(())
    }

    fn program(&mut self, offset: usize, bytes: &[u8]) -> Result<(), Self::Error> {
        match &mut self.budget {
            None => {
                self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
                Ok(())
            }
            Some(remaining) => {
                let n = bytes.len().min(*remaining);
                self.data[offset..offset + n].copy_from_slice(&bytes[..n]);
                *remaining -= n;
                if n < bytes.len() {
                    Err(SimError::Torn)
                } else {
                    Ok(())
                }
            }
        }
    }

    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), Self::Error> {
        buf.copy_from_slice(&self.data[offset..offset + buf.len()]);
        Ok(())
    }
}

/// Shorthand for a two-bank geometry: `sectors_per_bank` sectors of
/// `sector_size` bytes each, banks back to back.
pub fn config(flash: SimFlash, sectors_per_bank: u32) -> mfs::Config<SimFlash> {
    mfs::Config::new(flash, 0, sectors_per_bank, sectors_per_bank, sectors_per_bank)
}
