//! C1: flash adapter.
//!
//! `Flash` is the one external collaborator this crate cannot provide
//! itself: translating sector indices to byte offsets, erasing, and
//! programming bytes onto the physical medium. Everything above this
//! trait assumes the one-way-writable property of NOR flash: an erased
//! byte (0xFF) can be programmed to any value, but a byte already
//! programmed to something other than 0xFF cannot be programmed again
//! until the containing sector is erased.

use crc::{Crc, CRC_16_IBM_3740};

use crate::layout::RecordHeader;

/// CRC-16/IBM-3740 (widely known as "CCITT-FALSE"): poly 0x1021, init
/// 0xFFFF, no reflection, no output xor. Chosen because it is the most
/// common CRC-16 used over small embedded headers, and ships as a named
/// catalog entry in the `crc` crate rather than requiring a hand-rolled
/// table.
static CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Abstract NOR-like flash device, supplied by the embedder.
///
/// Implementations own the physical medium exclusively for the lifetime
/// of the [`crate::Engine`] that holds them. Every method is synchronous
/// and runs to completion; the engine never re-enters a `Flash` call
/// while another is outstanding.
pub trait Flash {
    /// Error type returned by the underlying driver.
    type Error: core::fmt::Debug;

    /// Minimum number of bytes the device can program atomically.
    /// Record and bank headers, and the payloads that follow them, are
    /// padded out to this granularity.
    const PROGRAM_GRANULARITY: usize;

    /// Byte offset and length of the given sector index, relative to the
    /// start of the flash device.
    fn sector_bounds(&self, sector: u32) -> (usize, usize);

    /// Erase one sector. Every byte in the sector reads as 0xFF
    /// afterwards.
    fn erase_sector(&mut self, sector: u32) -> Result<(), Self::Error>;

    /// Program `bytes` starting at `offset`. Readback verification, when
    /// wanted, is the caller's responsibility (see
    /// [`crate::Config::write_verify`]) rather than an obligation on
    /// this method.
    fn program(&mut self, offset: usize, bytes: &[u8]) -> Result<(), Self::Error>;

    /// Read `buf.len()` bytes starting at `offset`.
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), Self::Error>;

    /// CRC-16 helper used for header and payload checksums. Devices with
    /// a hardware CRC unit may override this; the default is a pure
    /// software table-driven implementation.
    fn crc16(&self, bytes: &[u8], seed: u16) -> u16 {
        CRC16.digest_with_initial(seed).finalize()
    }
}

/// Program `bytes` at `offset` and, when `verify` is set, read them back
/// and compare. A verify mismatch is reported as
/// [`crate::error::MfsError::FlashFailure`] with no source error, since
/// the driver call itself succeeded — only the readback disagreed.
/// `Config::write_verify` controls whether this crate asks for the
/// readback at all; a `Flash` impl may additionally verify internally,
/// but this crate does not rely on that.
pub(crate) fn program_verified<F: Flash>(
    flash: &mut F,
    offset: usize,
    bytes: &[u8],
    verify: bool,
) -> Result<(), crate::error::MfsError<F::Error>> {
    flash
        .program(offset, bytes)
        .map_err(|e| crate::error::MfsError::FlashFailure(Some(e)))?;
    if !verify {
        return Ok(());
    }
    const CHUNK: usize = 64;
    let mut check = [0u8; CHUNK];
    let mut pos = 0;
    while pos < bytes.len() {
        let n = (bytes.len() - pos).min(CHUNK);
        flash
            .read(offset + pos, &mut check[..n])
            .map_err(|e| crate::error::MfsError::FlashFailure(Some(e)))?;
        if check[..n] != bytes[pos..pos + n] {
            return Err(crate::error::MfsError::FlashFailure(None));
        }
        pos += n;
    }
    Ok(())
}

/// Program a record header at `offset` with `magic` landing last.
///
/// A record header carries no CRC of its own (the `crc` field covers
/// only the payload), so the write order is the only defense against a
/// torn write leaving a header whose `magic` reads as valid but whose
/// tail (`id`/`size`/`prev_header`) is garbage — per spec.md §9, "the
/// magic value [must be] the last field programmed". Writing the tail
/// first means a write torn partway through it leaves `magic` still
/// erased (0xFFFF), which `scanner::scan` rejects outright rather than
/// accepting a record with a corrupt `prev_header`.
pub(crate) fn program_record_header<F: Flash>(
    flash: &mut F,
    offset: usize,
    header: &RecordHeader,
    verify: bool,
) -> Result<(), crate::error::MfsError<F::Error>> {
    let encoded = header.encode();
    program_verified(flash, offset + 2, &encoded[2..], verify)?;
    program_verified(flash, offset, &encoded[..2], verify)?;
    Ok(())
}
