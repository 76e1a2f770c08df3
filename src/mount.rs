//! C4: mount, repair, and compaction.
//!
//! This module owns the only logic in the crate allowed to erase a bank
//! or pick a winner between the two. It never touches the index cache;
//! callers repopulate that separately after a successful mount.

use log::{debug, info, warn};

use crate::error::MfsError;
use crate::flash::{program_record_header, program_verified, Flash};
use crate::layout::{align_up, record_span, BankHeader, RecordHeader, BANK_HEADER_RAW_LEN};
use crate::scanner::{is_latest, scan, BankState, ScanResult};

/// Default ceiling on repair attempts during [`mount`], per spec.md §4.4.
pub const DEFAULT_MAX_REPAIR_ATTEMPTS: u8 = 3;

/// Which bank is authoritative after a successful mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bank {
    Zero,
    One,
}

impl Bank {
    fn other(self) -> Bank {
        match self {
            Bank::Zero => Bank::One,
            Bank::One => Bank::Zero,
        }
    }
}

/// Geometry of one bank, resolved from [`crate::Config`] into absolute
/// flash offsets plus the sector range backing it (sectors need not be
/// uniformly sized, so the range is kept alongside the byte span rather
/// than derived from it).
#[derive(Debug, Clone, Copy)]
pub struct BankGeometry {
    pub base: usize,
    pub len: usize,
    pub sector_start: u32,
    pub sector_count: u32,
}

/// Outcome of a successful [`mount`]: which bank is live, and where its
/// log currently ends.
#[derive(Debug, Clone, Copy)]
pub struct MountState {
    pub active: Bank,
    pub counter: u32,
    pub data_start: u32,
    pub next_offset: u32,
    pub last_offset: u32,
    pub used_space: u32,
    /// Whether a repair pass ran to reach this state (bank0 and bank1
    /// disagreed, or one was found to need reclaiming).
    pub repaired: bool,
}

/// Resolve which bank geometry `bank` refers to. Exposed crate-wide so
/// callers outside this module (e.g. `lib.rs`, repopulating the index
/// cache right after a successful mount) don't have to re-derive it.
pub(crate) fn geometry(bank: Bank, bank0: BankGeometry, bank1: BankGeometry) -> BankGeometry {
    match bank {
        Bank::Zero => bank0,
        Bank::One => bank1,
    }
}

/// Erase every sector in a bank and write a fresh header with `counter`
/// and a data region starting right after the (granularity-padded)
/// header.
fn format<F: Flash>(
    flash: &mut F,
    geo: BankGeometry,
    counter: u32,
    verify: bool,
) -> Result<u32, MfsError<F::Error>> {
    for s in 0..geo.sector_count {
        flash
            .erase_sector(geo.sector_start + s)
            .map_err(|e| MfsError::FlashFailure(Some(e)))?;
    }
    let data_start = align_up(BANK_HEADER_RAW_LEN, F::PROGRAM_GRANULARITY) as u32;
    let header = BankHeader::new(flash, counter, data_start);
    program_verified(flash, geo.base, &header.encode(), verify)?;
    Ok(data_start)
}

/// Copy every still-live record from `src` into a freshly formatted
/// `dst`, in chronological order, skipping tombstones and superseded
/// entries. `src_scan` must have `state` of `Ok` or `Partial`.
///
/// Writes the destination's bank header before any record is copied:
/// if this step is interrupted, the next mount finds a `Partial`
/// (empty) destination bank and an intact source bank, and simply
/// restarts the compaction rather than losing data (spec.md §5).
fn compact<F: Flash>(
    flash: &mut F,
    src_geo: BankGeometry,
    src_scan: &ScanResult,
    dst_geo: BankGeometry,
    new_counter: u32,
    verify: bool,
) -> Result<u32, MfsError<F::Error>> {
    let dst_data_start = format(flash, dst_geo, new_counter, verify)?;
    let mut dst_offset = dst_data_start;
    let mut dst_prev = 0u32;

    let mut offset = src_scan.data_start;
    while offset < src_scan.next_offset {
        let mut hdr_bytes = [0u8; crate::layout::RECORD_HEADER_LEN];
        flash
            .read(src_geo.base + offset as usize, &mut hdr_bytes)
            .map_err(|e| MfsError::FlashFailure(Some(e)))?;
        let header = match RecordHeader::decode(&hdr_bytes) {
            Some(h) if h.magic_valid() => h,
            _ => break,
        };
        let span = record_span(header.size as usize, F::PROGRAM_GRANULARITY) as u32;

        let keep = !header.is_tombstone()
            && is_latest(flash, src_geo.base, header.id, offset, src_scan.last_offset)
                .map_err(|e| MfsError::FlashFailure(Some(e)))?;

        if keep {
            let mut payload = [0u8; 64];
            let read_base = src_geo.base + offset as usize + crate::layout::RECORD_HEADER_LEN;

            let mut running = 0xFFFFu16;
            let mut pos = read_base;
            let mut remaining = header.size as usize;
            while remaining > 0 {
                let n = remaining.min(payload.len());
                flash
                    .read(pos, &mut payload[..n])
                    .map_err(|e| MfsError::FlashFailure(Some(e)))?;
                running = flash.crc16(&payload[..n], running);
                pos += n;
                remaining -= n;
            }
            let new_header = RecordHeader {
                magic: crate::layout::RECORD_MAGIC,
                crc: running,
                id: header.id,
                size: header.size,
                prev_header: dst_prev,
            };

            let write_offset = dst_geo.base + dst_offset as usize;
            program_record_header(flash, write_offset, &new_header, verify)?;

            let mut read_pos = read_base;
            let mut write_pos = write_offset + crate::layout::RECORD_HEADER_LEN;
            let mut remaining = header.size as usize;
            while remaining > 0 {
                let n = remaining.min(payload.len());
                flash
                    .read(read_pos, &mut payload[..n])
                    .map_err(|e| MfsError::FlashFailure(Some(e)))?;
                program_verified(flash, write_pos, &payload[..n], verify)?;
                read_pos += n;
                write_pos += n;
                remaining -= n;
            }

            dst_prev = dst_offset;
            dst_offset += span;
        }

        offset += span;
    }

    Ok(dst_offset)
}

/// Mount the store: scan both banks, pick (or repair to reach) a single
/// authoritative bank, and return its live state. Never leaves the
/// flash in a state with zero valid banks unless both were
/// unrecoverable on entry.
pub fn mount<F: Flash>(
    flash: &mut F,
    bank0: BankGeometry,
    bank1: BankGeometry,
    max_repair_attempts: u8,
    verify: bool,
) -> Result<MountState, MfsError<F::Error>> {
    let mut repaired = false;

    for attempt in 0..max_repair_attempts.max(1) {
        let s0 = scan(flash, bank0.base, bank0.len, F::PROGRAM_GRANULARITY)
            .map_err(|e| MfsError::FlashFailure(Some(e)))?;
        let s1 = scan(flash, bank1.base, bank1.len, F::PROGRAM_GRANULARITY)
            .map_err(|e| MfsError::FlashFailure(Some(e)))?;

        debug!(
            "mount attempt {}: bank0={:?}(ctr {}) bank1={:?}(ctr {})",
            attempt, s0.state, s0.counter, s1.state, s1.counter
        );

        match (s0.state, s1.state) {
            (BankState::Ok, BankState::Erased) => {
                return Ok(finish(Bank::Zero, s0, repaired));
            }
            (BankState::Erased, BankState::Ok) => {
                return Ok(finish(Bank::One, s1, repaired));
            }
            (BankState::Ok, BankState::Garbage) | (BankState::Ok, BankState::Partial) => {
                // bank0 is already complete and authoritative; bank1 is
                // either noise or the abandoned destination of a
                // previously interrupted compaction. It carries nothing
                // bank0 doesn't already have, so it is simply erased
                // rather than used as a compaction source (spec.md §5).
                warn!("bank0 ok, bank1 {:?}: erasing bank1", s1.state);
                erase_bank(flash, bank1).map_err(|e| MfsError::FlashFailure(Some(e)))?;
                return Ok(finish(Bank::Zero, s0, true));
            }
            (BankState::Garbage, BankState::Ok) | (BankState::Partial, BankState::Ok) => {
                warn!("bank1 ok, bank0 {:?}: erasing bank0", s0.state);
                erase_bank(flash, bank0).map_err(|e| MfsError::FlashFailure(Some(e)))?;
                return Ok(finish(Bank::One, s1, true));
            }
            (BankState::Ok, BankState::Ok) => {
                // Both valid: the one with the higher counter (mod
                // wraparound via wrapping_sub) is authoritative; the
                // loser is erased immediately per spec.md §4.4.
                let (winner, winner_scan, loser_geo) =
                    if s0.counter.wrapping_sub(s1.counter) < u32::MAX / 2 && s0.counter != s1.counter {
                        (Bank::Zero, s0, bank1)
                    } else if s1.counter != s0.counter {
                        (Bank::One, s1, bank0)
                    } else {
                        // Identical counters should never happen in a
                        // healthy store; prefer bank0 deterministically.
                        (Bank::Zero, s0, bank1)
                    };
                warn!("both banks ok: bank0 ctr {} bank1 ctr {}, keeping {:?}", s0.counter, s1.counter, winner);
                erase_bank(flash, loser_geo).map_err(|e| MfsError::FlashFailure(Some(e)))?;
                return Ok(finish(winner, winner_scan, true));
            }
            (BankState::Erased, BankState::Erased) => {
                info!("both banks erased, formatting bank0 fresh");
                let data_start = format(flash, bank0, 1, verify)?;
                return Ok(MountState {
                    active: Bank::Zero,
                    counter: 1,
                    data_start,
                    next_offset: data_start,
                    last_offset: 0,
                    used_space: 0,
                    repaired: true,
                });
            }
            (BankState::Garbage, BankState::Garbage) => {
                return Err(MfsError::InternalError);
            }
            (BankState::Garbage, BankState::Erased) | (BankState::Erased, BankState::Garbage) => {
                info!("one bank garbage, one erased: formatting the erased one fresh");
                repaired = true;
                let (geo, which) = if s0.state == BankState::Erased {
                    (bank0, Bank::Zero)
                } else {
                    (bank1, Bank::One)
                };
                let data_start = format(flash, geo, 1, verify)?;
                return Ok(MountState {
                    active: which,
                    counter: 1,
                    data_start,
                    next_offset: data_start,
                    last_offset: 0,
                    used_space: 0,
                    repaired: true,
                });
            }
            // Only remaining combinations: at least one Partial bank and
            // neither bank is Ok (Partial+Erased, Partial+Garbage,
            // Partial+Partial). Recover the most complete bank into the
            // other by compaction; the "any" row of spec.md §4.4's table.
            (BankState::Partial, _) | (_, BankState::Partial) => {
                warn!("partial bank detected, compacting to recover");
                repaired = true;
                let bank0_is_src = match (s0.state, s1.state) {
                    (BankState::Partial, BankState::Partial) => s0.used_space >= s1.used_space,
                    (BankState::Partial, _) => true,
                    _ => false,
                };
                let (src_geo, src_scan, dst_geo) = if bank0_is_src {
                    (bank0, s0, bank1)
                } else {
                    (bank1, s1, bank0)
                };
                let other_counter = if bank0_is_src { s1.counter } else { s0.counter };
                let new_counter = src_scan.counter.max(other_counter) + 1;
                compact(flash, src_geo, &src_scan, dst_geo, new_counter, verify)?;
                // Loop again: the freshly compacted bank should now
                // scan as Ok.
                continue;
            }
        }
    }

    Err(MfsError::InternalError)
}

/// Erase every sector of a bank without writing a fresh header, used to
/// reclaim a bank that has been superseded but isn't being targeted by a
/// compaction right now (it will be formatted the next time it's needed
/// as a compaction destination).
fn erase_bank<F: Flash>(flash: &mut F, geo: BankGeometry) -> Result<(), F::Error> {
    for s in 0..geo.sector_count {
        flash.erase_sector(geo.sector_start + s)?;
    }
    Ok(())
}

fn finish(active: Bank, scan: ScanResult, repaired: bool) -> MountState {
    MountState {
        active,
        counter: scan.counter,
        data_start: scan.data_start,
        next_offset: scan.next_offset,
        last_offset: scan.last_offset,
        used_space: scan.used_space,
        repaired,
    }
}

/// Reclaim space by compacting the active bank into its counterpart.
/// Returns the new [`MountState`] for the (now newly active) bank.
pub fn reclaim<F: Flash>(
    flash: &mut F,
    active: Bank,
    bank0: BankGeometry,
    bank1: BankGeometry,
    active_scan: &ScanResult,
    verify: bool,
) -> Result<MountState, MfsError<F::Error>> {
    let src_geo = geometry(active, bank0, bank1);
    let dst_geo = geometry(active.other(), bank0, bank1);
    let new_counter = active_scan.counter + 1;
    let next_offset = compact(flash, src_geo, active_scan, dst_geo, new_counter, verify)?;

    let dst_scan = scan(flash, dst_geo.base, dst_geo.len, F::PROGRAM_GRANULARITY)
        .map_err(|e| MfsError::FlashFailure(Some(e)))?;
    let _ = next_offset;
    Ok(finish(active.other(), dst_scan, true))
}
