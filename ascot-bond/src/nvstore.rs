//! Flash-backed persistent record store
//!
//! The record store is an append log over two equally sized regions of a NOR flash. Writing a
//! record appends a new entry to the active region; reading a record returns the newest sealed
//! entry for its identifier. When the active region runs out of room the newest value of every
//! live identifier is copied into the other (erased) region and the old region is erased, which
//! levels wear across the whole area and reclaims the space of superseded entries.
//!
//! # Layout
//! Each region starts with an eight byte header of two words. The first word is programmed when
//! the region becomes the compaction destination and carries a sequence number, the second word is
//! programmed once the copy has finished and the region is authoritative. Power loss between the
//! two is recognized at [`mount`](RecordStore::new) and the interrupted compaction is redone from
//! the intact region.
//!
//! An entry is `header (4) | data (padded to 4) | seal (4)`. The header holds the record
//! identifier, the data length and a checksum byte; the seal word is programmed to all zeros after
//! the data has been verified. An entry without a valid seal is ignored by reads and dropped by
//! compaction.
//!
//! # Failure latch
//! The store is fail-stop. If a write does not verify or an erase leaves any bit cleared, the
//! store latches into a failed state and refuses every further mutation until it is mounted again.
//! A failed write never harms the previously persisted value of the record, as the old entry is
//! only superseded by a fully sealed new one.

use alloc::vec;
use alloc::vec::Vec;
use embedded_storage::nor_flash::NorFlash;

/// Identifier of a record within the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RecordId(pub u16);

/// Error within the record store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvError {
    /// A parameter is outside of its valid range
    InvalidParameter,
    /// The record was never written, or its last value was dropped by compaction
    NotFound,
    /// The record exists but with a different length than requested
    BadLength,
    /// There is no room for the record even after compaction
    NoResources,
    /// The flash failed, or the store has latched into its failed state
    OperationFailed,
}

impl core::fmt::Display for NvError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            NvError::InvalidParameter => f.write_str("invalid parameter"),
            NvError::NotFound => f.write_str("record not found"),
            NvError::BadLength => f.write_str("record length mismatch"),
            NvError::NoResources => f.write_str("record store is full"),
            NvError::OperationFailed => f.write_str("flash operation failed"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for NvError {}

const REGION_HEADER_LEN: u32 = 8;

const ENTRY_HEADER_LEN: u32 = 4;

const SEAL_LEN: u32 = 4;

/// Magic of the first header word, programmed when a region becomes the compaction destination
const RECEIVING_MAGIC: u8 = 0x52;

/// Magic of the second header word, programmed when a region becomes authoritative
const ACTIVE_MAGIC: u8 = 0x41;

const HEADER_TAG: [u8; 2] = [0xA5, 0x5A];

/// The maximum data length of a single record
pub const MAX_RECORD_LEN: usize = 255;

/// Valid range for the voluntary compaction threshold, in percent
pub const COMPACTION_THRESHOLD_RANGE: core::ops::RangeInclusive<u8> = 70..=95;

#[derive(Debug, Clone, Copy, PartialEq)]
enum RegionState {
    Erased,
    Receiving(u8),
    Active(u8),
    Corrupt,
}

fn entry_checksum(hdr: &[u8; 4]) -> u8 {
    hdr[0] ^ hdr[1] ^ hdr[2] ^ 0xA5
}

fn padded_len(len: u32) -> u32 {
    (len + 3) & !3
}

/// Wear-leveling record store over a NOR flash
///
/// See the [module](self) documentation.
pub struct RecordStore<F: NorFlash> {
    flash: F,
    region_len: u32,
    active: u8,
    seq: u8,
    write_offset: u32,
    failed: bool,
}

impl<F: NorFlash> RecordStore<F> {
    /// Mount the record store over `flash`
    ///
    /// The whole capacity of `flash` is used; it is split into two regions aligned to the erase
    /// size. Mounting recovers from an interrupted compaction and rebuilds the write position, and
    /// clears a previously latched failure.
    pub fn new(flash: F) -> Result<Self, NvError> {
        let capacity = flash.capacity() as u32;

        let region_len = (capacity / 2) / (F::ERASE_SIZE as u32) * (F::ERASE_SIZE as u32);

        if region_len < REGION_HEADER_LEN + ENTRY_HEADER_LEN + SEAL_LEN {
            return Err(NvError::InvalidParameter);
        }

        let mut store = RecordStore {
            flash,
            region_len,
            active: 0,
            seq: 0,
            write_offset: 0,
            failed: false,
        };

        store.mount()?;

        Ok(store)
    }

    /// Give back the flash the store was mounted over
    pub fn into_flash(self) -> F {
        self.flash
    }

    /// Check if the store has latched into its failed state
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Check whether `id` currently has a stored value
    pub fn contains(&mut self, id: RecordId) -> Result<bool, NvError> {
        Ok(self.find_latest(self.active, id)?.is_some())
    }

    /// Read the current value of `id` into `buf`
    ///
    /// `buf` must have the exact length the record was written with.
    pub fn read(&mut self, id: RecordId, buf: &mut [u8]) -> Result<(), NvError> {
        match self.find_latest(self.active, id)? {
            None => Err(NvError::NotFound),
            Some((_, len)) if len as usize != buf.len() => Err(NvError::BadLength),
            Some((data_offset, _)) => {
                self.flash
                    .read(data_offset, buf)
                    .map_err(|_| NvError::OperationFailed)?;

                Ok(())
            }
        }
    }

    /// Write a new value for `id`
    ///
    /// The write is elided when `data` is byte-identical to the current value of the record. When
    /// the active region has no room for the entry a compaction is run first.
    pub fn write(&mut self, id: RecordId, data: &[u8]) -> Result<(), NvError> {
        if self.failed {
            return Err(NvError::OperationFailed);
        }

        if data.is_empty() || data.len() > MAX_RECORD_LEN {
            return Err(NvError::InvalidParameter);
        }

        if let Some((data_offset, len)) = self.find_latest(self.active, id)? {
            if len as usize == data.len() {
                let mut current = vec![0u8; data.len()];

                self.flash
                    .read(data_offset, &mut current)
                    .map_err(|_| NvError::OperationFailed)?;

                if current == data {
                    return Ok(());
                }
            }
        }

        let needed = ENTRY_HEADER_LEN + padded_len(data.len() as u32) + SEAL_LEN;

        if self.write_offset + needed > self.region_end(self.active) {
            self.run_compaction()?;

            if self.write_offset + needed > self.region_end(self.active) {
                return Err(NvError::NoResources);
            }
        }

        self.append_entry(id, data)?;

        Ok(())
    }

    /// Write the all-ones erased marker for `id`
    ///
    /// The marker remains readable like any other value, but compaction drops it, after which the
    /// record reads as [`NotFound`](NvError::NotFound).
    pub fn erase(&mut self, id: RecordId, len: usize) -> Result<(), NvError> {
        if len == 0 || len > MAX_RECORD_LEN {
            return Err(NvError::InvalidParameter);
        }

        let marker = vec![0xFFu8; len];

        self.write(id, &marker)
    }

    /// Voluntarily compact when the active region utilization reaches `threshold_percent`
    ///
    /// The threshold must be within [`COMPACTION_THRESHOLD_RANGE`].
    pub fn compact(&mut self, threshold_percent: u8) -> Result<(), NvError> {
        if !COMPACTION_THRESHOLD_RANGE.contains(&threshold_percent) {
            return Err(NvError::InvalidParameter);
        }

        if self.failed {
            return Err(NvError::OperationFailed);
        }

        if self.utilization_percent() >= threshold_percent {
            self.run_compaction()?;
        }

        Ok(())
    }

    /// The used part of the active region, in percent of its entry space
    pub fn utilization_percent(&self) -> u8 {
        let data_start = self.region_base(self.active) + REGION_HEADER_LEN;

        let used = self.write_offset - data_start;

        let total = self.region_len - REGION_HEADER_LEN;

        (used * 100 / total) as u8
    }

    fn region_base(&self, region: u8) -> u32 {
        <u32>::from(region) * self.region_len
    }

    fn region_end(&self, region: u8) -> u32 {
        self.region_base(region) + self.region_len
    }

    fn region_state(&mut self, region: u8) -> Result<RegionState, NvError> {
        let mut header = [0u8; REGION_HEADER_LEN as usize];

        self.flash
            .read(self.region_base(region), &mut header)
            .map_err(|_| NvError::OperationFailed)?;

        let word0 = [header[0], header[1], header[2], header[3]];
        let word1 = [header[4], header[5], header[6], header[7]];

        if word0 == [0xFF; 4] {
            return if word1 == [0xFF; 4] {
                Ok(RegionState::Erased)
            } else {
                Ok(RegionState::Corrupt)
            };
        }

        if word0[0] != RECEIVING_MAGIC || word0[2..4] != HEADER_TAG {
            return Ok(RegionState::Corrupt);
        }

        let seq = word0[1];

        if word1 == [0xFF; 4] {
            Ok(RegionState::Receiving(seq))
        } else if word1[0] == ACTIVE_MAGIC && word1[1] == seq && word1[2..4] == HEADER_TAG {
            Ok(RegionState::Active(seq))
        } else {
            Ok(RegionState::Corrupt)
        }
    }

    fn mount(&mut self) -> Result<(), NvError> {
        self.failed = false;

        let states = (self.region_state(0)?, self.region_state(1)?);

        match states {
            (RegionState::Active(s0), RegionState::Active(s1)) => {
                // power was lost after the destination became authoritative but before the old
                // region was erased; the newer sequence number wins
                let keep = if s1 == s0.wrapping_add(1) { 1 } else { 0 };

                log::warn!("(NV) two authoritative regions found, keeping region {}", keep);

                self.erase_region(1 - keep)?;

                self.activate(keep)?;
            }
            (RegionState::Active(_), RegionState::Receiving(_)) => {
                log::info!("(NV) resuming interrupted compaction into region 1");

                self.erase_region(1)?;

                self.activate(0)?;

                self.run_compaction()?;
            }
            (RegionState::Receiving(_), RegionState::Active(_)) => {
                log::info!("(NV) resuming interrupted compaction into region 0");

                self.erase_region(0)?;

                self.activate(1)?;

                self.run_compaction()?;
            }
            (RegionState::Active(_), RegionState::Erased) => self.activate(0)?,
            (RegionState::Erased, RegionState::Active(_)) => self.activate(1)?,
            (RegionState::Erased, RegionState::Erased) => self.format(0, 0)?,
            _ => {
                // an unrecognized header cannot be trusted on either side
                log::warn!("(NV) unrecognized region headers, formatting the store");

                self.erase_region(0)?;
                self.erase_region(1)?;

                self.format(0, 0)?;
            }
        }

        Ok(())
    }

    /// Make `region` the active region, rebuilding the write position from its entries
    fn activate(&mut self, region: u8) -> Result<(), NvError> {
        let seq = match self.region_state(region)? {
            RegionState::Active(seq) => seq,
            _ => return Err(NvError::OperationFailed),
        };

        self.active = region;
        self.seq = seq;
        self.write_offset = self.scan_end(region)?;

        Ok(())
    }

    /// Turn the erased `region` into an empty active region
    fn format(&mut self, region: u8, seq: u8) -> Result<(), NvError> {
        let base = self.region_base(region);

        self.program(base, &[RECEIVING_MAGIC, seq, HEADER_TAG[0], HEADER_TAG[1]])?;

        self.program(base + 4, &[ACTIVE_MAGIC, seq, HEADER_TAG[0], HEADER_TAG[1]])?;

        self.active = region;
        self.seq = seq;
        self.write_offset = base + REGION_HEADER_LEN;

        Ok(())
    }

    /// Find the newest sealed entry for `id`, returning its data offset and length
    fn find_latest(&mut self, region: u8, id: RecordId) -> Result<Option<(u32, u8)>, NvError> {
        let mut found = None;

        let mut offset = self.region_base(region) + REGION_HEADER_LEN;

        let end = self.region_end(region);

        while let Some(entry) = self.entry_at(offset, end)? {
            if entry.sealed && entry.id == id.0 {
                found = Some((entry.data_offset, entry.len));
            }

            offset = entry.next_offset;
        }

        Ok(found)
    }

    /// Find the offset of the free space of `region`
    fn scan_end(&mut self, region: u8) -> Result<u32, NvError> {
        let mut offset = self.region_base(region) + REGION_HEADER_LEN;

        let end = self.region_end(region);

        while let Some(entry) = self.entry_at(offset, end)? {
            offset = entry.next_offset;
        }

        Ok(offset)
    }

    /// Decode the entry at `offset`
    ///
    /// Returns `None` at the free space of the region. A header that fails its checksum poisons
    /// the remainder of the region: the scan treats everything up to `end` as used, which forces
    /// the next overflowing write to compact away the damage.
    fn entry_at(&mut self, offset: u32, end: u32) -> Result<Option<Entry>, NvError> {
        if offset + ENTRY_HEADER_LEN + SEAL_LEN > end {
            return Ok(None);
        }

        let mut header = [0u8; 4];

        self.flash
            .read(offset, &mut header)
            .map_err(|_| NvError::OperationFailed)?;

        if header == [0xFF; 4] {
            return Ok(None);
        }

        if header[3] != entry_checksum(&header) {
            log::warn!("(NV) torn entry header at offset {:#x}", offset);

            return Ok(Some(Entry {
                id: 0,
                len: 0,
                data_offset: offset,
                next_offset: end,
                sealed: false,
            }));
        }

        let len = header[2];

        let data_offset = offset + ENTRY_HEADER_LEN;

        let seal_offset = data_offset + padded_len(<u32>::from(len));

        if seal_offset + SEAL_LEN > end {
            // length field runs past the region, same poisoned-tail handling as a bad checksum
            return Ok(Some(Entry {
                id: 0,
                len: 0,
                data_offset: offset,
                next_offset: end,
                sealed: false,
            }));
        }

        let mut seal = [0u8; 4];

        self.flash
            .read(seal_offset, &mut seal)
            .map_err(|_| NvError::OperationFailed)?;

        Ok(Some(Entry {
            id: <u16>::from_le_bytes([header[0], header[1]]),
            len,
            data_offset,
            next_offset: seal_offset + SEAL_LEN,
            sealed: seal == [0; 4],
        }))
    }

    /// Append a new entry for `id` at the write position
    ///
    /// The caller has already checked that the entry fits. The data is verified by reading it
    /// back before the seal word is programmed; a verification failure latches the store and
    /// leaves the entry unsealed (and thereby inert).
    fn append_entry(&mut self, id: RecordId, data: &[u8]) -> Result<(), NvError> {
        let offset = self.write_offset;

        let mut header = [id.0 as u8, (id.0 >> 8) as u8, data.len() as u8, 0];

        header[3] = entry_checksum(&header);

        let padded = padded_len(data.len() as u32) as usize;

        let mut image = Vec::with_capacity(4 + padded);

        image.extend_from_slice(&header);
        image.extend_from_slice(data);
        image.resize(4 + padded, 0xFF);

        self.program(offset, &image)?;

        let mut verify = vec![0u8; image.len()];

        self.flash
            .read(offset, &mut verify)
            .map_err(|_| NvError::OperationFailed)?;

        if verify != image {
            log::error!("(NV) write verification failed at offset {:#x}, latching", offset);

            self.failed = true;

            return Err(NvError::OperationFailed);
        }

        let seal_offset = offset + 4 + padded as u32;

        self.program(seal_offset, &[0; 4])?;

        self.write_offset = seal_offset + SEAL_LEN;

        Ok(())
    }

    /// Copy every live record into the erased region and erase the old one
    fn run_compaction(&mut self) -> Result<(), NvError> {
        if self.failed {
            return Err(NvError::OperationFailed);
        }

        let src = self.active;
        let dst = 1 - src;

        log::info!("(NV) compacting region {} into region {}", src, dst);

        if self.region_state(dst)? != RegionState::Erased {
            self.erase_region(dst)?;
        }

        let new_seq = self.seq.wrapping_add(1);

        let dst_base = self.region_base(dst);

        self.program(dst_base, &[RECEIVING_MAGIC, new_seq, HEADER_TAG[0], HEADER_TAG[1]])?;

        let mut out = dst_base + REGION_HEADER_LEN;

        let mut offset = self.region_base(src) + REGION_HEADER_LEN;

        let src_end = self.region_end(src);

        while let Some(entry) = self.entry_at(offset, src_end)? {
            offset = entry.next_offset;

            if !entry.sealed {
                continue;
            }

            // only the newest entry of the identifier is carried over
            match self.find_latest(src, RecordId(entry.id))? {
                Some((data_offset, _)) if data_offset == entry.data_offset => (),
                _ => continue,
            }

            let mut data = vec![0u8; entry.len as usize];

            self.flash
                .read(entry.data_offset, &mut data)
                .map_err(|_| NvError::OperationFailed)?;

            // the all-ones marker means the record was erased; it is dropped here
            if data.iter().all(|b| *b == 0xFF) {
                continue;
            }

            let mut header = [entry.id as u8, (entry.id >> 8) as u8, entry.len, 0];

            header[3] = entry_checksum(&header);

            let padded = padded_len(<u32>::from(entry.len)) as usize;

            let mut image = Vec::with_capacity(4 + padded);

            image.extend_from_slice(&header);
            image.extend_from_slice(&data);
            image.resize(4 + padded, 0xFF);

            self.program(out, &image)?;

            self.program(out + 4 + padded as u32, &[0; 4])?;

            out = out + 4 + padded as u32 + SEAL_LEN;
        }

        self.program(dst_base + 4, &[ACTIVE_MAGIC, new_seq, HEADER_TAG[0], HEADER_TAG[1]])?;

        self.erase_region(src)?;

        self.active = dst;
        self.seq = new_seq;
        self.write_offset = out;

        Ok(())
    }

    /// Erase `region` and verify it reads back blank
    ///
    /// A bit that fails to clear latches the store.
    fn erase_region(&mut self, region: u8) -> Result<(), NvError> {
        let base = self.region_base(region);

        let end = self.region_end(region);

        self.flash.erase(base, end).map_err(|_| {
            self.failed = true;
            NvError::OperationFailed
        })?;

        let mut buf = [0u8; 64];

        let mut offset = base;

        while offset < end {
            let chunk = core::cmp::min(64, (end - offset) as usize);

            self.flash
                .read(offset, &mut buf[..chunk])
                .map_err(|_| NvError::OperationFailed)?;

            if buf[..chunk].iter().any(|b| *b != 0xFF) {
                log::error!("(NV) region {} failed to erase, latching", region);

                self.failed = true;

                return Err(NvError::OperationFailed);
            }

            offset += chunk as u32;
        }

        Ok(())
    }

    /// Program `data` at `offset`, latching the store on a flash error
    fn program(&mut self, offset: u32, data: &[u8]) -> Result<(), NvError> {
        self.flash.write(offset, data).map_err(|_| {
            self.failed = true;
            NvError::OperationFailed
        })
    }
}

struct Entry {
    id: u16,
    len: u8,
    data_offset: u32,
    next_offset: u32,
    sealed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemFlash;

    fn new_store() -> RecordStore<MemFlash> {
        RecordStore::new(MemFlash::new(4096)).unwrap()
    }

    #[test]
    fn read_of_never_written_record() {
        let mut store = new_store();

        let mut buf = [0u8; 4];

        assert_eq!(store.read(RecordId(1), &mut buf), Err(NvError::NotFound));
    }

    #[test]
    fn write_read_round_trip() {
        let mut store = new_store();

        store.write(RecordId(7), &[1, 2, 3, 4, 5]).unwrap();

        let mut buf = [0u8; 5];

        store.read(RecordId(7), &mut buf).unwrap();

        assert_eq!(buf, [1, 2, 3, 4, 5]);
    }

    #[test]
    fn newest_value_wins() {
        let mut store = new_store();

        store.write(RecordId(7), &[1, 1, 1]).unwrap();
        store.write(RecordId(7), &[2, 2, 2]).unwrap();

        let mut buf = [0u8; 3];

        store.read(RecordId(7), &mut buf).unwrap();

        assert_eq!(buf, [2, 2, 2]);
    }

    #[test]
    fn length_mismatch_is_reported() {
        let mut store = new_store();

        store.write(RecordId(7), &[1, 2, 3]).unwrap();

        let mut buf = [0u8; 4];

        assert_eq!(store.read(RecordId(7), &mut buf), Err(NvError::BadLength));
    }

    #[test]
    fn identical_rewrite_is_elided() {
        let mut store = new_store();

        store.write(RecordId(7), &[9, 9, 9, 9]).unwrap();

        let used = store.write_offset;

        store.write(RecordId(7), &[9, 9, 9, 9]).unwrap();

        assert_eq!(store.write_offset, used);
    }

    #[test]
    fn compaction_preserves_every_live_record() {
        let mut store = new_store();

        // a 16 byte record occupies 24 bytes; a 2040 byte region overflows well within the loop
        for round in 0u8..30 {
            for id in 0u16..10 {
                store.write(RecordId(id), &[round ^ id as u8; 16]).unwrap();
            }
        }

        for id in 0u16..10 {
            let mut buf = [0u8; 16];

            store.read(RecordId(id), &mut buf).unwrap();

            assert_eq!(buf, [29 ^ id as u8; 16], "record {} lost its value", id);
        }
    }

    #[test]
    fn erased_marker_is_dropped_by_compaction() {
        let mut store = new_store();

        store.write(RecordId(1), &[0xAB; 8]).unwrap();
        store.write(RecordId(2), &[0xCD; 8]).unwrap();

        store.erase(RecordId(1), 8).unwrap();

        // still readable as the marker before compaction
        let mut buf = [0u8; 8];

        store.read(RecordId(1), &mut buf).unwrap();

        assert_eq!(buf, [0xFF; 8]);

        store.run_compaction().unwrap();

        assert_eq!(store.read(RecordId(1), &mut buf), Err(NvError::NotFound));

        store.read(RecordId(2), &mut buf).unwrap();

        assert_eq!(buf, [0xCD; 8]);
    }

    #[test]
    fn compact_threshold_range_is_checked() {
        let mut store = new_store();

        assert_eq!(store.compact(69), Err(NvError::InvalidParameter));
        assert_eq!(store.compact(96), Err(NvError::InvalidParameter));
        assert_eq!(store.compact(70), Ok(()));
        assert_eq!(store.compact(95), Ok(()));
    }

    #[test]
    fn voluntary_compaction_runs_at_threshold() {
        let mut store = new_store();

        while store.utilization_percent() < 80 {
            store.write(RecordId(3), &[store.utilization_percent(); 16]).unwrap();
        }

        let before = store.active;

        store.compact(70).unwrap();

        assert_ne!(store.active, before);

        assert!(store.utilization_percent() < 10);
    }

    #[test]
    fn verification_failure_latches_the_store() {
        let mut store = new_store();

        store.write(RecordId(1), &[1; 4]).unwrap();

        store.flash.corrupt_next_write = true;

        assert_eq!(store.write(RecordId(1), &[2; 4]), Err(NvError::OperationFailed));

        assert!(store.is_failed());

        // every further mutation is refused
        assert_eq!(store.write(RecordId(2), &[3; 4]), Err(NvError::OperationFailed));
        assert_eq!(store.compact(70), Err(NvError::OperationFailed));

        // the prior value of the record is still intact
        let mut buf = [0u8; 4];

        store.read(RecordId(1), &mut buf).unwrap();

        assert_eq!(buf, [1; 4]);
    }

    #[test]
    fn erase_failure_latches_the_store() {
        let mut store = new_store();

        store.write(RecordId(1), &[1; 4]).unwrap();

        store.flash.erase_noop = true;

        assert_eq!(store.run_compaction(), Err(NvError::OperationFailed));

        assert!(store.is_failed());
    }

    #[test]
    fn remount_clears_the_latch() {
        let mut store = new_store();

        store.write(RecordId(1), &[1; 4]).unwrap();

        store.flash.corrupt_next_write = true;

        let _ = store.write(RecordId(1), &[2; 4]);

        assert!(store.is_failed());

        let mut store = RecordStore::new(store.into_flash()).unwrap();

        assert!(!store.is_failed());

        store.write(RecordId(1), &[2; 4]).unwrap();
    }

    /// Interrupt a compaction at every possible write and check that every record still reads
    /// with its pre-compaction value after a remount.
    #[test]
    fn interrupted_compaction_recovers_every_value() {
        for cut_after in 0..30 {
            let mut store = new_store();

            for id in 0u16..8 {
                store.write(RecordId(id), &[id as u8 | 0x40; 12]).unwrap();
            }

            store.flash.write_budget = Some(cut_after);

            // with dropped writes the copy either fails verification or produces torn entries
            let _ = store.run_compaction();

            let mut flash = store.into_flash();

            flash.write_budget = None;

            let mut store = RecordStore::new(flash).unwrap();

            for id in 0u16..8 {
                let mut buf = [0u8; 12];

                store
                    .read(RecordId(id), &mut buf)
                    .unwrap_or_else(|e| panic!("cut {}: record {} unreadable: {}", cut_after, id, e));

                assert_eq!(buf, [id as u8 | 0x40; 12], "cut {}: record {} changed", cut_after, id);
            }
        }
    }

    #[test]
    fn torn_tail_poisons_until_compaction() {
        let mut store = new_store();

        store.write(RecordId(1), &[0x11; 8]).unwrap();

        // hand-craft a header with a bad checksum at the write position
        let offset = store.write_offset;

        store.program(offset, &[0x05, 0x00, 0x08, 0x00]).unwrap();

        let mut store = RecordStore::new(store.into_flash()).unwrap();

        // the poisoned tail forces the next write to compact, which discards the damage
        store.write(RecordId(2), &[0x22; 8]).unwrap();

        let mut buf = [0u8; 8];

        store.read(RecordId(1), &mut buf).unwrap();
        assert_eq!(buf, [0x11; 8]);

        store.read(RecordId(2), &mut buf).unwrap();
        assert_eq!(buf, [0x22; 8]);
    }
}
