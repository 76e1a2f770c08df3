//! C6: record read/update/erase.
//!
//! These are free functions rather than inherent `Engine` methods so
//! `mount.rs` and `index.rs` stay decoupled from the `Engine` type
//! itself; `lib.rs` wires them together.

use log::trace;

use crate::error::{MfsError, UpdateOutcome};
use crate::flash::{program_record_header, program_verified, Flash};
use crate::index::IndexCache;
use crate::layout::{record_span, RecordHeader, RECORD_HEADER_LEN};
use crate::mount::{reclaim, Bank, BankGeometry, MountState};
use crate::scanner::walk_backward;

fn bank_geo(bank: Bank, bank0: BankGeometry, bank1: BankGeometry) -> BankGeometry {
    match bank {
        Bank::Zero => bank0,
        Bank::One => bank1,
    }
}

/// Find the most recent header for `id`, walking the active bank's
/// general backward chain if the cache has no (or a stale) answer.
/// Returns `None` if the id has never been written, or its most recent
/// entry is a tombstone.
fn locate<F: Flash, const N: usize>(
    flash: &mut F,
    active_geo: BankGeometry,
    mount: &MountState,
    cache: &mut IndexCache<N>,
    id: u32,
) -> Result<Option<(u32, RecordHeader)>, F::Error> {
    if let Some(hit) = cache.get(id) {
        let mut hdr_bytes = [0u8; RECORD_HEADER_LEN];
        flash.read(active_geo.base + hit.offset as usize, &mut hdr_bytes)?;
        if let Some(header) = RecordHeader::decode(&hdr_bytes) {
            if header.magic_valid() && header.id == id && !header.is_tombstone() {
                return Ok(Some((hit.offset, header)));
            }
        }
        // Stale hit; fall through to a full backward search.
    }

    let mut found = None;
    walk_backward(flash, active_geo.base, mount.last_offset, |offset, header| {
        if header.id == id {
            found = Some((offset, header));
            return false;
        }
        true
    })?;

    Ok(found.filter(|(_, h)| !h.is_tombstone()))
}

/// Read the current value of `id` into `out`, returning the number of
/// bytes written.
pub fn read_record<F: Flash, const N: usize>(
    flash: &mut F,
    bank0: BankGeometry,
    bank1: BankGeometry,
    mount: &MountState,
    cache: &mut IndexCache<N>,
    id: u32,
    out: &mut [u8],
) -> Result<usize, MfsError<F::Error>> {
    let active_geo = bank_geo(mount.active, bank0, bank1);
    let found = locate(flash, active_geo, mount, cache, id)
        .map_err(|e| MfsError::FlashFailure(Some(e)))?;
    let (offset, header) = found.ok_or(MfsError::IdNotFound)?;

    let size = header.size as usize;
    if out.len() < size {
        return Err(MfsError::BufferTooSmall {
            needed: size,
            available: out.len(),
        });
    }

    flash
        .read(
            active_geo.base + offset as usize + RECORD_HEADER_LEN,
            &mut out[..size],
        )
        .map_err(|e| MfsError::FlashFailure(Some(e)))?;

    if !header.payload_crc_valid(flash, &out[..size]) {
        return Err(MfsError::CrcError);
    }

    cache.insert(id, offset, header.size);
    Ok(size)
}

/// Write a new version of `id`, appending to the active bank's log.
/// Triggers a compaction first if the new record would not otherwise
/// fit.
pub fn update_record<F: Flash, const N: usize>(
    flash: &mut F,
    bank0: BankGeometry,
    bank1: BankGeometry,
    mount: &mut MountState,
    cache: &mut IndexCache<N>,
    id: u32,
    data: &[u8],
    verify: bool,
) -> Result<UpdateOutcome, MfsError<F::Error>> {
    write_entry(flash, bank0, bank1, mount, cache, id, data, false, verify)
}

/// Append a tombstone for `id`, logically erasing it.
pub fn erase_record<F: Flash, const N: usize>(
    flash: &mut F,
    bank0: BankGeometry,
    bank1: BankGeometry,
    mount: &mut MountState,
    cache: &mut IndexCache<N>,
    id: u32,
    verify: bool,
) -> Result<(), MfsError<F::Error>> {
    let active_geo = bank_geo(mount.active, bank0, bank1);
    let exists = locate(flash, active_geo, mount, cache, id)
        .map_err(|e| MfsError::FlashFailure(Some(e)))?
        .is_some();
    if !exists {
        return Err(MfsError::IdNotFound);
    }
    write_entry(flash, bank0, bank1, mount, cache, id, &[], true, verify)?;
    cache.remove(id);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn write_entry<F: Flash, const N: usize>(
    flash: &mut F,
    bank0: BankGeometry,
    bank1: BankGeometry,
    mount: &mut MountState,
    cache: &mut IndexCache<N>,
    id: u32,
    data: &[u8],
    tombstone: bool,
    verify: bool,
) -> Result<UpdateOutcome, MfsError<F::Error>> {
    let active_geo = bank_geo(mount.active, bank0, bank1);
    let span = record_span(data.len(), F::PROGRAM_GRANULARITY);

    if span > active_geo.len - mount.data_start as usize {
        return Err(MfsError::RecordTooLarge { size: data.len() });
    }

    let mut outcome = UpdateOutcome::Written;
    if mount.next_offset as usize + span > active_geo.len {
        trace!("active bank full, reclaiming before write");
        *mount = reclaim(flash, mount.active, bank0, bank1, &scan_of(mount), verify)?;
        cache.clear();
        outcome = UpdateOutcome::WrittenAfterCompaction;

        let active_geo = bank_geo(mount.active, bank0, bank1);
        if mount.next_offset as usize + span > active_geo.len {
            // Compaction ran but didn't free enough room (other live
            // ids still fill the bank); spec.md §4.6 step 2 and §7's
            // propagation rule both call for `FlashFailure` here, not
            // `InternalError` (that variant is reserved for mount
            // exceeding its repair-attempt budget).
            return Err(MfsError::FlashFailure(None));
        }
    }

    let active_geo = bank_geo(mount.active, bank0, bank1);
    let header = RecordHeader::new(flash, id, data, mount.last_offset);
    let write_offset = active_geo.base + mount.next_offset as usize;

    program_record_header(flash, write_offset, &header, verify)?;
    if !data.is_empty() {
        program_verified(flash, write_offset + RECORD_HEADER_LEN, data, verify)?;
    }

    let new_offset = mount.next_offset;
    mount.last_offset = new_offset;
    mount.next_offset += span as u32;
    mount.used_space += span as u32;

    if tombstone {
        cache.remove(id);
    } else {
        cache.insert(id, new_offset, data.len() as u32);
    }

    Ok(outcome)
}

/// Re-derive a [`crate::scanner::ScanResult`]-shaped view from the
/// current in-memory `MountState`, for handing to `reclaim`, which
/// wants the same shape `scan()` produces.
fn scan_of(mount: &MountState) -> crate::scanner::ScanResult {
    crate::scanner::ScanResult {
        state: crate::scanner::BankState::Ok,
        counter: mount.counter,
        data_start: mount.data_start,
        next_offset: mount.next_offset,
        last_offset: mount.last_offset,
        used_space: mount.used_space,
    }
}
