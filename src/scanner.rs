//! C3: bank scanner.
//!
//! The scanner never writes to flash — it is the single source of truth
//! for what state a bank is in, used both by mount (to pick the
//! authoritative bank) and, via [`walk_forward`] and [`is_latest`], by
//! garbage collection.

use crate::flash::Flash;
use crate::layout::{align_up, record_span, BankHeader, RecordHeader, BANK_HEADER_RAW_LEN, RECORD_HEADER_LEN};

/// Result of classifying a bank, per spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankState {
    /// Every byte of the header region reads as 0xFF.
    Erased,
    /// Header valid, chain walks cleanly to a clean end.
    Ok,
    /// Header valid, but the chain ends in a corrupted or torn record; a
    /// prefix of the log is recoverable.
    Partial,
    /// Header invalid and the bank is not fully erased.
    Garbage,
}

/// Outcome of scanning one bank.
#[derive(Debug, Clone, Copy)]
pub struct ScanResult {
    pub state: BankState,
    /// Wear counter from the bank header. Zero for `Erased`/`Garbage`.
    pub counter: u32,
    /// Offset (relative to the bank's own base) where the data region
    /// begins, i.e. the bank header's `next` field.
    pub data_start: u32,
    /// Offset of the first free byte after the last valid record.
    pub next_offset: u32,
    /// Offset of the most recent valid record header, or 0 if none.
    pub last_offset: u32,
    /// Total bytes consumed between `data_start` and `next_offset`,
    /// counting live and stale records alike (spec.md invariant 6).
    pub used_space: u32,
}

/// Walk a bank and classify it. `bank_len` is the bank's total byte
/// capacity; all offsets returned are relative to the bank's base.
pub fn scan<F: Flash>(
    flash: &mut F,
    bank_base: usize,
    bank_len: usize,
    granularity: usize,
) -> Result<ScanResult, F::Error> {
    let mut header_bytes = [0u8; BANK_HEADER_RAW_LEN];
    flash.read(bank_base, &mut header_bytes)?;

    if BankHeader::is_erased(&header_bytes) {
        return Ok(ScanResult {
            state: BankState::Erased,
            counter: 0,
            data_start: align_up(BANK_HEADER_RAW_LEN, granularity) as u32,
            next_offset: 0,
            last_offset: 0,
            used_space: 0,
        });
    }

    let header = match BankHeader::decode(&header_bytes) {
        Some(h) => h,
        None => {
            return Ok(ScanResult {
                state: BankState::Garbage,
                counter: 0,
                data_start: 0,
                next_offset: 0,
                last_offset: 0,
                used_space: 0,
            })
        }
    };

    if !header.magics_valid() || !header.crc_valid(flash) {
        return Ok(ScanResult {
            state: BankState::Garbage,
            counter: 0,
            data_start: 0,
            next_offset: 0,
            last_offset: 0,
            used_space: 0,
        });
    }

    let data_start = header.next as usize;
    let mut offset = data_start;
    let mut last_offset = 0u32;
    let mut state = BankState::Ok;

    loop {
        if offset + RECORD_HEADER_LEN > bank_len {
            state = BankState::Partial;
            break;
        }

        let mut hdr_bytes = [0u8; RECORD_HEADER_LEN];
        flash.read(bank_base + offset, &mut hdr_bytes)?;

        if hdr_bytes.iter().all(|&b| b == 0xFF) {
            // Clean end of log: nothing written past here yet.
            break;
        }

        let record = match RecordHeader::decode(&hdr_bytes) {
            Some(r) if r.magic_valid() => r,
            _ => {
                state = BankState::Partial;
                break;
            }
        };

        let span = record_span(record.size as usize, granularity);
        if offset + span > bank_len {
            state = BankState::Partial;
            break;
        }

        let payload_ok = if record.size == 0 {
            record.payload_crc_valid(flash, &[])
        } else {
            read_payload_and_check_crc(flash, bank_base + offset, &record, granularity)?
        };
        if !payload_ok {
            state = BankState::Partial;
            break;
        }

        last_offset = offset as u32;
        offset += span;
    }

    Ok(ScanResult {
        state,
        counter: header.counter,
        data_start: data_start as u32,
        next_offset: offset as u32,
        last_offset,
        used_space: (offset - data_start) as u32,
    })
}

/// Read a record's payload in bounded chunks and verify its CRC, without
/// requiring a caller-provided buffer sized to the largest possible
/// record (there is no heap to allocate one dynamically here).
fn read_payload_and_check_crc<F: Flash>(
    flash: &mut F,
    record_offset: usize,
    header: &RecordHeader,
    _granularity: usize,
) -> Result<bool, F::Error> {
    const CHUNK: usize = 64;
    let mut remaining = header.size as usize;
    let mut pos = record_offset + RECORD_HEADER_LEN;
    let mut digest = DigestAccumulator::new();
    let mut buf = [0u8; CHUNK];
    while remaining > 0 {
        let n = remaining.min(CHUNK);
        flash.read(pos, &mut buf[..n])?;
        digest.feed(flash, &buf[..n]);
        pos += n;
        remaining -= n;
    }
    Ok(digest.finish(flash) == header.crc)
}

/// Accumulates a CRC-16 across repeated `Flash::crc16` calls by feeding
/// each chunk with the previous chunk's running value as the seed.
struct DigestAccumulator {
    running: u16,
}

impl DigestAccumulator {
    fn new() -> Self {
        Self { running: 0xFFFF }
    }

    fn feed<F: Flash>(&mut self, flash: &F, chunk: &[u8]) {
        self.running = flash.crc16(chunk, self.running);
    }

    fn finish<F: Flash>(&self, _flash: &F) -> u16 {
        self.running
    }
}

/// Visit every live-or-stale record header between `data_start` and
/// `next_offset`, forward (chronological) order, calling `visitor` with
/// `(offset, header)` for each one. Stops early if `visitor` returns
/// `false`.
pub fn walk_forward<F: Flash>(
    flash: &mut F,
    bank_base: usize,
    data_start: u32,
    next_offset: u32,
    granularity: usize,
    mut visitor: impl FnMut(u32, RecordHeader) -> bool,
) -> Result<(), F::Error> {
    let mut offset = data_start;
    while offset < next_offset {
        let mut hdr_bytes = [0u8; RECORD_HEADER_LEN];
        flash.read(bank_base + offset as usize, &mut hdr_bytes)?;
        let header = RecordHeader::decode(&hdr_bytes).expect("scan already validated this bank");
        if !visitor(offset, header) {
            break;
        }
        offset += record_span(header.size as usize, granularity) as u32;
    }
    Ok(())
}

/// Walk the `prev_header` chain backward from `from`, calling `visitor`
/// with `(offset, header)` for each record, starting with the most
/// recent. Stops when `prev_header` reaches 0 or `visitor` returns
/// `false`.
pub fn walk_backward<F: Flash>(
    flash: &mut F,
    bank_base: usize,
    from: u32,
    mut visitor: impl FnMut(u32, RecordHeader) -> bool,
) -> Result<(), F::Error> {
    let mut offset = from;
    while offset != 0 {
        let mut hdr_bytes = [0u8; RECORD_HEADER_LEN];
        flash.read(bank_base + offset as usize, &mut hdr_bytes)?;
        let header = RecordHeader::decode(&hdr_bytes).expect("chain already validated by scan");
        if !visitor(offset, header) {
            break;
        }
        offset = header.prev_header;
    }
    Ok(())
}

/// Whether the record at `offset` (with the given `id`) is the most
/// recent entry for that identifier, i.e. no later header between
/// `offset` (exclusive) and `last_offset` (inclusive) shares the same
/// id. Used by compaction to decide, in forward order, which records
/// are still live without needing unbounded RAM to track "seen"
/// identifiers: the check walks the chain backward from `last_offset`
/// down to `offset` on demand.
pub fn is_latest<F: Flash>(
    flash: &mut F,
    bank_base: usize,
    id: u32,
    offset: u32,
    last_offset: u32,
) -> Result<bool, F::Error> {
    let mut found_later = false;
    walk_backward(flash, bank_base, last_offset, |o, header| {
        if o == offset {
            // Reached the record itself without finding a later
            // duplicate.
            return false;
        }
        if header.id == id {
            found_later = true;
            return false;
        }
        true
    })?;
    Ok(!found_later)
}

#[cfg(test)]
extern crate std;
