//! Durable bond table
//!
//! A bond is the durable record of a pairing: the identity of the peer, the long term key
//! material of both roles, the peer's identity resolving key, its signing key with the replay
//! counter and a snapshot of the client characteristic configuration. The table has a fixed
//! capacity of [`MAX_BOND_COUNT`] slots.
//!
//! Each slot is physically six separate records in the [record store](crate::nvstore) plus one
//! record for the characteristic configuration snapshot, all derived from the slot number through
//! [`RecordKey`]. The parts are written one at a time as key distribution delivers them (see
//! [`commit`]), so the table must stay readable with any prefix of the parts present.
//!
//! A slot is occupied exactly when its core record holds a peer address that is not all ones;
//! erasing a bond writes the all-ones pattern back over every part.

pub mod commit;

use crate::nvstore::{NvError, RecordId, RecordStore};
use crate::{AddressType, BluetoothDeviceAddress, Status};
use alloc::vec;
use embedded_storage::nor_flash::NorFlash;

/// The capacity of the bond table
pub const MAX_BOND_COUNT: u8 = 10;

/// The attribute handle wildcard of [`BondStore::update_char_config`]
pub const INVALID_ATTRIBUTE_HANDLE: u16 = 0xFFFF;

/// The number of characteristic configurations kept per bond
pub const CHAR_CONFIG_ENTRIES: usize = 4;

/// First record identifier of the bond part records
const BOND_RECORD_BASE: u16 = 0x20;

/// First record identifier of the characteristic configuration snapshots
const CHAR_CONFIG_RECORD_BASE: u16 = 0x70;

/// A slot of the bond table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BondSlot(pub u8);

/// One part of a bond record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondPart {
    Core,
    LocalLtk,
    PeerLtk,
    Irk,
    Csrk,
    SignCounter,
}

impl BondPart {
    fn offset(self) -> u16 {
        match self {
            BondPart::Core => 0,
            BondPart::LocalLtk => 1,
            BondPart::PeerLtk => 2,
            BondPart::Irk => 3,
            BondPart::Csrk => 4,
            BondPart::SignCounter => 5,
        }
    }
}

/// The address of one part of one bond within the record store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordKey {
    pub slot: BondSlot,
    pub part: BondPart,
}

impl RecordKey {
    pub fn record_id(self) -> RecordId {
        RecordId(BOND_RECORD_BASE + <u16>::from(self.slot.0) * 6 + self.part.offset())
    }
}

fn char_config_record_id(slot: BondSlot) -> RecordId {
    RecordId(CHAR_CONFIG_RECORD_BASE + <u16>::from(slot.0))
}

/// The flags of a bond's core record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BondFlags(u16);

impl BondFlags {
    pub const NONE: BondFlags = BondFlags(0);

    /// The pairing behind this bond was authenticated (protected against man in the middle)
    pub const AUTHENTICATED: BondFlags = BondFlags(1 << 0);

    /// A service changed indication is owed to this peer
    pub const SERVICE_CHANGED: BondFlags = BondFlags(1 << 1);

    /// Every exchanged key of the pairing was durably written
    pub const COMPLETE: BondFlags = BondFlags(1 << 2);

    pub fn contains(self, mask: BondFlags) -> bool {
        self.0 & mask.0 == mask.0
    }
}

impl core::ops::BitOr for BondFlags {
    type Output = BondFlags;

    fn bitor(self, rhs: BondFlags) -> BondFlags {
        BondFlags(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for BondFlags {
    fn bitor_assign(&mut self, rhs: BondFlags) {
        self.0 |= rhs.0
    }
}

impl core::ops::Not for BondFlags {
    type Output = BondFlags;

    fn not(self) -> BondFlags {
        BondFlags(!self.0)
    }
}

impl core::ops::BitAnd for BondFlags {
    type Output = BondFlags;

    fn bitand(self, rhs: BondFlags) -> BondFlags {
        BondFlags(self.0 & rhs.0)
    }
}

/// The byte form of a bond part within the record store
pub trait RecordData: Sized {
    /// The exact stored length
    const LEN: usize;

    /// Serialize into `buf`, which has a length of [`LEN`](RecordData::LEN)
    fn write_record(&self, buf: &mut [u8]);

    /// Deserialize from `buf`, which has a length of [`LEN`](RecordData::LEN)
    fn try_from_record(buf: &[u8]) -> Option<Self>;
}

/// The identity part of a bond
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreRecord {
    /// The identity address of the peer (public or static random)
    pub peer_address: BluetoothDeviceAddress,
    /// The last private address the peer connected with
    pub reconnection_address: BluetoothDeviceAddress,
    pub flags: BondFlags,
}

impl RecordData for CoreRecord {
    const LEN: usize = 14;

    fn write_record(&self, buf: &mut [u8]) {
        buf[..6].copy_from_slice(&self.peer_address.0);
        buf[6..12].copy_from_slice(&self.reconnection_address.0);
        buf[12..14].copy_from_slice(&self.flags.0.to_le_bytes());
    }

    fn try_from_record(buf: &[u8]) -> Option<Self> {
        let mut peer_address = [0u8; 6];
        let mut reconnection_address = [0u8; 6];

        peer_address.copy_from_slice(&buf[..6]);
        reconnection_address.copy_from_slice(&buf[6..12]);

        Some(CoreRecord {
            peer_address: peer_address.into(),
            reconnection_address: reconnection_address.into(),
            flags: BondFlags(<u16>::from_le_bytes([buf[12], buf[13]])),
        })
    }
}

/// A long term key with the values needed to request it during encryption setup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LtkRecord {
    pub ltk: u128,
    /// The encrypted diversifier (EDIV)
    pub div: u16,
    /// The random value accompanying the diversifier
    pub rand: u64,
    pub key_size: u8,
}

impl RecordData for LtkRecord {
    const LEN: usize = 27;

    fn write_record(&self, buf: &mut [u8]) {
        buf[..16].copy_from_slice(&self.ltk.to_le_bytes());
        buf[16..18].copy_from_slice(&self.div.to_le_bytes());
        buf[18..26].copy_from_slice(&self.rand.to_le_bytes());
        buf[26] = self.key_size;
    }

    fn try_from_record(buf: &[u8]) -> Option<Self> {
        let mut ltk = [0u8; 16];
        let mut rand = [0u8; 8];

        ltk.copy_from_slice(&buf[..16]);
        rand.copy_from_slice(&buf[18..26]);

        Some(LtkRecord {
            ltk: <u128>::from_le_bytes(ltk),
            div: <u16>::from_le_bytes([buf[16], buf[17]]),
            rand: <u64>::from_le_bytes(rand),
            key_size: buf[26],
        })
    }
}

/// A bare 128-bit key, the form of the IRK and the CSRK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct KeyRecord(pub u128);

impl RecordData for KeyRecord {
    const LEN: usize = 16;

    fn write_record(&self, buf: &mut [u8]) {
        buf.copy_from_slice(&self.0.to_le_bytes());
    }

    fn try_from_record(buf: &[u8]) -> Option<Self> {
        let mut key = [0u8; 16];

        key.copy_from_slice(buf);

        Some(KeyRecord(<u128>::from_le_bytes(key)))
    }
}

/// The replay counter of signed writes from the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignCounterRecord(pub u32);

impl RecordData for SignCounterRecord {
    const LEN: usize = 4;

    fn write_record(&self, buf: &mut [u8]) {
        buf.copy_from_slice(&self.0.to_le_bytes());
    }

    fn try_from_record(buf: &[u8]) -> Option<Self> {
        Some(SignCounterRecord(<u32>::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])))
    }
}

/// One stored client characteristic configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharConfigEntry {
    /// The attribute handle, [`INVALID_ATTRIBUTE_HANDLE`] for an unused entry
    pub handle: u16,
    pub value: u8,
}

impl CharConfigEntry {
    fn empty() -> Self {
        CharConfigEntry {
            handle: INVALID_ATTRIBUTE_HANDLE,
            value: 0xFF,
        }
    }
}

/// The per-bond snapshot of client characteristic configurations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharConfigRecord {
    pub entries: [CharConfigEntry; CHAR_CONFIG_ENTRIES],
}

impl CharConfigRecord {
    pub fn empty() -> Self {
        CharConfigRecord {
            entries: [CharConfigEntry::empty(); CHAR_CONFIG_ENTRIES],
        }
    }
}

impl RecordData for CharConfigRecord {
    const LEN: usize = 3 * CHAR_CONFIG_ENTRIES;

    fn write_record(&self, buf: &mut [u8]) {
        for (chunk, entry) in buf.chunks_exact_mut(3).zip(self.entries.iter()) {
            chunk[..2].copy_from_slice(&entry.handle.to_le_bytes());
            chunk[2] = entry.value;
        }
    }

    fn try_from_record(buf: &[u8]) -> Option<Self> {
        let mut this = CharConfigRecord::empty();

        for (chunk, entry) in buf.chunks_exact(3).zip(this.entries.iter_mut()) {
            entry.handle = <u16>::from_le_bytes([chunk[0], chunk[1]]);
            entry.value = chunk[2];
        }

        Some(this)
    }
}

/// The fixed-capacity table of bonds, stored in the record store
pub struct BondStore<F: NorFlash> {
    store: RecordStore<F>,
    capacity: u8,
}

impl<F: NorFlash> BondStore<F> {
    /// Mount the bond table over `flash`
    ///
    /// `capacity` is the number of usable slots, at most [`MAX_BOND_COUNT`].
    pub fn new(flash: F, capacity: u8) -> Result<Self, Status> {
        if capacity == 0 || capacity > MAX_BOND_COUNT {
            return Err(Status::InvalidParameter);
        }

        let store = RecordStore::new(flash)?;

        Ok(BondStore { store, capacity })
    }

    pub fn capacity(&self) -> u8 {
        self.capacity
    }

    /// Voluntarily compact the underlying record store at `threshold_percent` utilization
    pub fn maintain(&mut self, threshold_percent: u8) -> Result<(), Status> {
        self.store.compact(threshold_percent).map_err(Status::from)
    }

    /// Write one part of a bond
    fn write_part<R: RecordData>(&mut self, key: RecordKey, record: &R) -> Result<(), NvError> {
        let mut buf = vec![0u8; R::LEN];

        record.write_record(&mut buf);

        self.store.write(key.record_id(), &buf)
    }

    /// Read one part of a bond
    ///
    /// `Ok(None)` when the part was never written or holds the all-ones empty marker.
    fn read_part<R: RecordData>(&mut self, key: RecordKey) -> Result<Option<R>, NvError> {
        self.read_record(key.record_id())
    }

    fn read_record<R: RecordData>(&mut self, id: RecordId) -> Result<Option<R>, NvError> {
        let mut buf = vec![0u8; R::LEN];

        match self.store.read(id, &mut buf) {
            Ok(()) => (),
            Err(NvError::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        }

        if buf.iter().all(|b| *b == 0xFF) {
            return Ok(None);
        }

        Ok(R::try_from_record(&buf))
    }

    /// Read the core record of `slot`, `None` when the slot is empty
    pub fn core(&mut self, slot: BondSlot) -> Result<Option<CoreRecord>, Status> {
        let key = RecordKey {
            slot,
            part: BondPart::Core,
        };

        match self.read_part::<CoreRecord>(key)? {
            Some(core) if core.peer_address != BluetoothDeviceAddress::ones() => Ok(Some(core)),
            _ => Ok(None),
        }
    }

    /// The identity address stored for `slot`
    pub fn identity_address(&mut self, slot: BondSlot) -> Result<BluetoothDeviceAddress, Status> {
        self.core(slot)?
            .map(|core| core.peer_address)
            .ok_or(Status::InvalidParameter)
    }

    /// The flags of `slot`
    pub fn state_flags(&mut self, slot: BondSlot) -> Result<BondFlags, Status> {
        self.core(slot)?.map(|core| core.flags).ok_or(Status::InvalidParameter)
    }

    /// Find the slot bonded to the identity address `address`
    pub fn find_by_identity(&mut self, address: BluetoothDeviceAddress) -> Result<Option<BondSlot>, Status> {
        for slot in self.slots() {
            if let Some(core) = self.core(slot)? {
                if core.peer_address == address {
                    return Ok(Some(slot));
                }
            }
        }

        Ok(None)
    }

    /// Match a connecting peer's address against the bond table
    ///
    /// The match dispatches on the address kind. An identity address is matched directly against
    /// the stored identities, a non-resolvable private address against the last reconnection
    /// address of every bond, and a resolvable private address is resolved through every stored
    /// identity resolving key. On success the slot is returned together with the stored identity
    /// of the peer.
    pub fn resolve_address(
        &mut self,
        address_type: AddressType,
        address: BluetoothDeviceAddress,
    ) -> Result<Option<(BondSlot, BluetoothDeviceAddress)>, Status> {
        match address_type {
            AddressType::Public | AddressType::StaticRandom => {
                Ok(self.find_by_identity(address)?.map(|slot| (slot, address)))
            }

            AddressType::NonResolvablePrivate => {
                for slot in self.slots() {
                    if let Some(core) = self.core(slot)? {
                        if core.reconnection_address == address {
                            return Ok(Some((slot, core.peer_address)));
                        }
                    }
                }

                Ok(None)
            }

            AddressType::ResolvablePrivate => {
                for slot in self.slots() {
                    if self.core(slot)?.is_none() {
                        continue;
                    }

                    let irk = match self.irk(slot)? {
                        Some(irk) => irk,
                        None => continue,
                    };

                    if address.resolve(irk) {
                        let identity = self.identity_address(slot)?;

                        return Ok(Some((slot, identity)));
                    }
                }

                Ok(None)
            }
        }
    }

    /// Claim or refresh the slot for `peer_address`
    ///
    /// An existing bond to the same identity is reused, keeping its reconnection address but
    /// taking the new `authenticated` state with the completeness cleared. When there is no
    /// existing bond an empty slot is claimed. When the table is full nothing is mutated.
    pub fn add_or_update(
        &mut self,
        peer_address: BluetoothDeviceAddress,
        authenticated: bool,
    ) -> Result<BondSlot, Status> {
        if peer_address == BluetoothDeviceAddress::ones() || peer_address == BluetoothDeviceAddress::zeroed() {
            return Err(Status::InvalidParameter);
        }

        let mut flags = BondFlags::NONE;

        if authenticated {
            flags |= BondFlags::AUTHENTICATED;
        }

        let (slot, reconnection_address) = match self.find_by_identity(peer_address)? {
            Some(slot) => {
                let reconnection = self
                    .core(slot)?
                    .map(|core| core.reconnection_address)
                    .unwrap_or(BluetoothDeviceAddress::ones());

                (slot, reconnection)
            }
            None => match self.find_empty_slot()? {
                Some(slot) => (slot, BluetoothDeviceAddress::ones()),
                None => return Err(Status::NoResources),
            },
        };

        let core = CoreRecord {
            peer_address,
            reconnection_address,
            flags,
        };

        let key = RecordKey {
            slot,
            part: BondPart::Core,
        };

        self.write_part(key, &core)?;

        log::info!("(GBM) bond slot {} claimed for {}", slot.0, peer_address);

        Ok(slot)
    }

    fn find_empty_slot(&mut self) -> Result<Option<BondSlot>, Status> {
        for slot in self.slots() {
            if self.core(slot)?.is_none() {
                return Ok(Some(slot));
            }
        }

        Ok(None)
    }

    /// Update the core flags of `slot` with `set` set and `clear` cleared
    fn change_flags(&mut self, slot: BondSlot, set: BondFlags, clear: BondFlags) -> Result<(), Status> {
        let mut core = self.core(slot)?.ok_or(Status::InvalidParameter)?;

        core.flags = (core.flags & !clear) | set;

        let key = RecordKey {
            slot,
            part: BondPart::Core,
        };

        self.write_part(key, &core)?;

        Ok(())
    }

    /// Mark the bond of `slot` as having every exchanged key durably written
    pub fn mark_complete(&mut self, slot: BondSlot) -> Result<(), Status> {
        self.change_flags(slot, BondFlags::COMPLETE, BondFlags::NONE)
    }

    /// Set or clear the owed service changed indication of `slot`
    pub fn set_service_changed(&mut self, slot: BondSlot, set: bool) -> Result<(), Status> {
        if set {
            self.change_flags(slot, BondFlags::SERVICE_CHANGED, BondFlags::NONE)
        } else {
            self.change_flags(slot, BondFlags::NONE, BondFlags::SERVICE_CHANGED)
        }
    }

    /// Remember the private address the peer last connected with
    pub fn set_reconnection_address(
        &mut self,
        slot: BondSlot,
        address: BluetoothDeviceAddress,
    ) -> Result<(), Status> {
        let mut core = self.core(slot)?.ok_or(Status::InvalidParameter)?;

        core.reconnection_address = address;

        let key = RecordKey {
            slot,
            part: BondPart::Core,
        };

        self.write_part(key, &core)?;

        Ok(())
    }

    pub fn write_local_ltk(&mut self, slot: BondSlot, ltk: &LtkRecord) -> Result<(), Status> {
        let key = RecordKey {
            slot,
            part: BondPart::LocalLtk,
        };

        self.write_part(key, ltk).map_err(Status::from)
    }

    pub fn write_peer_ltk(&mut self, slot: BondSlot, ltk: &LtkRecord) -> Result<(), Status> {
        let key = RecordKey {
            slot,
            part: BondPart::PeerLtk,
        };

        self.write_part(key, ltk).map_err(Status::from)
    }

    pub fn write_irk(&mut self, slot: BondSlot, irk: u128) -> Result<(), Status> {
        let key = RecordKey {
            slot,
            part: BondPart::Irk,
        };

        self.write_part(key, &KeyRecord(irk)).map_err(Status::from)
    }

    pub fn write_csrk(&mut self, slot: BondSlot, csrk: u128) -> Result<(), Status> {
        let key = RecordKey {
            slot,
            part: BondPart::Csrk,
        };

        self.write_part(key, &KeyRecord(csrk)).map_err(Status::from)
    }

    pub fn write_sign_counter(&mut self, slot: BondSlot, counter: u32) -> Result<(), Status> {
        let key = RecordKey {
            slot,
            part: BondPart::SignCounter,
        };

        self.write_part(key, &SignCounterRecord(counter)).map_err(Status::from)
    }

    pub fn local_ltk(&mut self, slot: BondSlot) -> Result<Option<LtkRecord>, Status> {
        let key = RecordKey {
            slot,
            part: BondPart::LocalLtk,
        };

        self.read_part(key).map_err(Status::from)
    }

    pub fn peer_ltk(&mut self, slot: BondSlot) -> Result<Option<LtkRecord>, Status> {
        let key = RecordKey {
            slot,
            part: BondPart::PeerLtk,
        };

        self.read_part(key).map_err(Status::from)
    }

    pub fn irk(&mut self, slot: BondSlot) -> Result<Option<u128>, Status> {
        let key = RecordKey {
            slot,
            part: BondPart::Irk,
        };

        Ok(self.read_part::<KeyRecord>(key)?.map(|key| key.0))
    }

    pub fn csrk(&mut self, slot: BondSlot) -> Result<Option<u128>, Status> {
        let key = RecordKey {
            slot,
            part: BondPart::Csrk,
        };

        Ok(self.read_part::<KeyRecord>(key)?.map(|key| key.0))
    }

    pub fn sign_counter(&mut self, slot: BondSlot) -> Result<Option<u32>, Status> {
        let key = RecordKey {
            slot,
            part: BondPart::SignCounter,
        };

        Ok(self.read_part::<SignCounterRecord>(key)?.map(|counter| counter.0))
    }

    /// The characteristic configuration snapshot of `slot`
    pub fn char_config(&mut self, slot: BondSlot) -> Result<CharConfigRecord, Status> {
        Ok(self
            .read_record::<CharConfigRecord>(char_config_record_id(slot))?
            .unwrap_or(CharConfigRecord::empty()))
    }

    /// Store one characteristic configuration of `slot`, or clear the whole snapshot
    ///
    /// With the [`INVALID_ATTRIBUTE_HANDLE`] wildcard the snapshot is reset to empty. Otherwise
    /// the value of an already stored handle is updated, or the pair is added to a free entry.
    /// Adding a new handle to a full snapshot fails without evicting anything.
    pub fn update_char_config(&mut self, slot: BondSlot, handle: u16, value: u8) -> Result<(), Status> {
        if self.core(slot)?.is_none() {
            return Err(Status::InvalidParameter);
        }

        let id = char_config_record_id(slot);

        if handle == INVALID_ATTRIBUTE_HANDLE {
            if self.store.contains(id)? {
                self.store.erase(id, CharConfigRecord::LEN)?;
            }

            return Ok(());
        }

        let mut config = self.char_config(slot)?;

        let entry = match config.entries.iter_mut().find(|e| e.handle == handle) {
            Some(entry) => entry,
            None => config
                .entries
                .iter_mut()
                .find(|e| e.handle == INVALID_ATTRIBUTE_HANDLE)
                .ok_or(Status::NoResources)?,
        };

        entry.handle = handle;
        entry.value = value;

        let mut buf = [0u8; CharConfigRecord::LEN];

        config.write_record(&mut buf);

        self.store.write(id, &buf).map_err(Status::from)
    }

    /// Erase the bond of `slot`, every part and the characteristic configuration snapshot
    ///
    /// A caller holding an in-flight commit for this slot must discard it first.
    pub fn erase_one(&mut self, slot: BondSlot) -> Result<(), Status> {
        if slot.0 >= self.capacity {
            return Err(Status::InvalidParameter);
        }

        for part in [
            BondPart::Core,
            BondPart::LocalLtk,
            BondPart::PeerLtk,
            BondPart::Irk,
            BondPart::Csrk,
            BondPart::SignCounter,
        ] {
            let key = RecordKey { slot, part };

            let len = match part {
                BondPart::Core => CoreRecord::LEN,
                BondPart::LocalLtk | BondPart::PeerLtk => LtkRecord::LEN,
                BondPart::Irk | BondPart::Csrk => KeyRecord::LEN,
                BondPart::SignCounter => SignCounterRecord::LEN,
            };

            if self.store.contains(key.record_id())? {
                self.store.erase(key.record_id(), len)?;
            }
        }

        let config_id = char_config_record_id(slot);

        if self.store.contains(config_id)? {
            self.store.erase(config_id, CharConfigRecord::LEN)?;
        }

        log::info!("(GBM) bond slot {} erased", slot.0);

        Ok(())
    }

    /// Erase every bond
    ///
    /// The policy check that no connection is active belongs to the caller.
    pub fn erase_all(&mut self) -> Result<(), Status> {
        for slot in self.slots() {
            self.erase_one(slot)?;
        }

        Ok(())
    }

    /// The number of occupied slots
    pub fn count_present(&mut self) -> Result<u8, Status> {
        let mut count = 0;

        for slot in self.slots() {
            if self.core(slot)?.is_some() {
                count += 1;
            }
        }

        Ok(count)
    }

    fn slots(&self) -> impl Iterator<Item = BondSlot> {
        (0..self.capacity).map(BondSlot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemFlash;

    fn new_store() -> BondStore<MemFlash> {
        BondStore::new(MemFlash::new(8192), MAX_BOND_COUNT).unwrap()
    }

    fn identity(last: u8) -> BluetoothDeviceAddress {
        BluetoothDeviceAddress([0x01, 0x02, 0x03, 0x04, 0x05, last])
    }

    #[test]
    fn empty_table() {
        let mut store = new_store();

        assert_eq!(store.count_present().unwrap(), 0);

        assert_eq!(store.resolve_address(AddressType::Public, identity(1)).unwrap(), None);
    }

    #[test]
    fn present_iff_core_address_is_not_all_ones() {
        let mut store = new_store();

        let slot = store.add_or_update(identity(1), false).unwrap();

        assert!(store.core(slot).unwrap().is_some());

        store.erase_one(slot).unwrap();

        assert!(store.core(slot).unwrap().is_none());
        assert_eq!(store.count_present().unwrap(), 0);
    }

    #[test]
    fn no_duplicate_bond_for_the_same_identity() {
        let mut store = new_store();

        let first = store.add_or_update(identity(1), false).unwrap();
        let second = store.add_or_update(identity(1), true).unwrap();

        assert_eq!(first, second);
        assert_eq!(store.count_present().unwrap(), 1);

        assert!(store
            .state_flags(first)
            .unwrap()
            .contains(BondFlags::AUTHENTICATED));
    }

    #[test]
    fn full_table_rejects_without_mutation() {
        let mut store = new_store();

        for i in 0..MAX_BOND_COUNT {
            store.add_or_update(identity(i), false).unwrap();
        }

        assert_eq!(
            store.add_or_update(identity(0xE0), false),
            Err(Status::NoResources)
        );

        assert_eq!(store.count_present().unwrap(), MAX_BOND_COUNT);

        // every pre-existing identity is untouched
        for i in 0..MAX_BOND_COUNT {
            assert!(store.find_by_identity(identity(i)).unwrap().is_some());
        }
    }

    #[test]
    fn key_parts_round_trip() {
        let mut store = new_store();

        let slot = store.add_or_update(identity(1), true).unwrap();

        let ltk = LtkRecord {
            ltk: 0x0123_4567_89AB_CDEF_0011_2233_4455_6677,
            div: 0x9876,
            rand: 0xDEAD_BEEF_CAFE_F00D,
            key_size: 16,
        };

        store.write_local_ltk(slot, &ltk).unwrap();
        store.write_irk(slot, 0x5555).unwrap();
        store.write_csrk(slot, 0xAAAA).unwrap();
        store.write_sign_counter(slot, 42).unwrap();

        assert_eq!(store.local_ltk(slot).unwrap(), Some(ltk));
        assert_eq!(store.peer_ltk(slot).unwrap(), None);
        assert_eq!(store.irk(slot).unwrap(), Some(0x5555));
        assert_eq!(store.csrk(slot).unwrap(), Some(0xAAAA));
        assert_eq!(store.sign_counter(slot).unwrap(), Some(42));
    }

    #[test]
    fn resolve_public_address() {
        let mut store = new_store();

        let slot = store.add_or_update(identity(1), false).unwrap();

        assert_eq!(
            store.resolve_address(AddressType::Public, identity(1)).unwrap(),
            Some((slot, identity(1)))
        );

        assert_eq!(store.resolve_address(AddressType::Public, identity(2)).unwrap(), None);
    }

    #[test]
    fn resolve_resolvable_private_address() {
        let irk = 0xec0234a3_57c8ad05_341010a6_0a397d9b;

        let mut store = new_store();

        // a bonded slot without an IRK must be skipped, not matched
        store.add_or_update(identity(9), false).unwrap();

        let slot = store.add_or_update(identity(1), false).unwrap();

        store.write_irk(slot, irk).unwrap();

        let private = BluetoothDeviceAddress::try_from_resolvable(irk, [0x94, 0x81, 0x70]).unwrap();

        assert_eq!(
            store.resolve_address(AddressType::ResolvablePrivate, private).unwrap(),
            Some((slot, identity(1)))
        );

        let other = BluetoothDeviceAddress::try_from_resolvable(irk ^ 1, [0x94, 0x81, 0x70]).unwrap();

        assert_eq!(
            store.resolve_address(AddressType::ResolvablePrivate, other).unwrap(),
            None
        );
    }

    #[test]
    fn resolve_non_resolvable_by_reconnection_address() {
        let mut store = new_store();

        let slot = store.add_or_update(identity(1), false).unwrap();

        let private = BluetoothDeviceAddress::try_from_non_resolvable([0x31, 0x32, 0x33, 0x34, 0x35, 0x36]).unwrap();

        store.set_reconnection_address(slot, private).unwrap();

        assert_eq!(
            store
                .resolve_address(AddressType::NonResolvablePrivate, private)
                .unwrap(),
            Some((slot, identity(1)))
        );
    }

    #[test]
    fn completion_flag_lifecycle() {
        let mut store = new_store();

        let slot = store.add_or_update(identity(1), false).unwrap();

        assert!(!store.state_flags(slot).unwrap().contains(BondFlags::COMPLETE));

        store.mark_complete(slot).unwrap();

        assert!(store.state_flags(slot).unwrap().contains(BondFlags::COMPLETE));

        // re-pairing the same peer clears the completeness again
        store.add_or_update(identity(1), false).unwrap();

        assert!(!store.state_flags(slot).unwrap().contains(BondFlags::COMPLETE));
    }

    #[test]
    fn char_config_upsert_and_wildcard_clear() {
        let mut store = new_store();

        let slot = store.add_or_update(identity(1), false).unwrap();

        store.update_char_config(slot, 0x0021, 1).unwrap();
        store.update_char_config(slot, 0x0035, 2).unwrap();
        store.update_char_config(slot, 0x0021, 0).unwrap();

        let config = store.char_config(slot).unwrap();

        assert_eq!(config.entries[0].handle, 0x0021);
        assert_eq!(config.entries[0].value, 0);
        assert_eq!(config.entries[1].handle, 0x0035);
        assert_eq!(config.entries[1].value, 2);

        store.update_char_config(slot, INVALID_ATTRIBUTE_HANDLE, 0).unwrap();

        assert_eq!(store.char_config(slot).unwrap(), CharConfigRecord::empty());
    }

    #[test]
    fn char_config_full_snapshot_rejects_new_handle() {
        let mut store = new_store();

        let slot = store.add_or_update(identity(1), false).unwrap();

        for i in 0..CHAR_CONFIG_ENTRIES as u16 {
            store.update_char_config(slot, 0x0100 + i, 1).unwrap();
        }

        assert_eq!(store.update_char_config(slot, 0x0200, 1), Err(Status::NoResources));

        // an existing handle can still be updated
        store.update_char_config(slot, 0x0100, 0).unwrap();
    }

    #[test]
    fn erase_one_clears_every_part() {
        let mut store = new_store();

        let slot = store.add_or_update(identity(1), false).unwrap();

        store.write_local_ltk(
            slot,
            &LtkRecord {
                ltk: 1,
                div: 2,
                rand: 3,
                key_size: 16,
            },
        )
        .unwrap();

        store.write_irk(slot, 7).unwrap();
        store.update_char_config(slot, 0x0021, 1).unwrap();

        store.erase_one(slot).unwrap();

        assert!(store.core(slot).unwrap().is_none());
        assert_eq!(store.local_ltk(slot).unwrap(), None);
        assert_eq!(store.irk(slot).unwrap(), None);
        assert_eq!(store.char_config(slot).unwrap(), CharConfigRecord::empty());
    }

    #[test]
    fn erase_all_empties_the_table() {
        let mut store = new_store();

        for i in 0..4 {
            store.add_or_update(identity(i), false).unwrap();
        }

        store.erase_all().unwrap();

        assert_eq!(store.count_present().unwrap(), 0);
    }

    #[test]
    fn table_survives_a_remount() {
        let mut store = new_store();

        let slot = store.add_or_update(identity(1), true).unwrap();

        store.write_irk(slot, 0x77).unwrap();
        store.mark_complete(slot).unwrap();

        let flash = store.store.into_flash();

        let mut store = BondStore::new(flash, MAX_BOND_COUNT).unwrap();

        assert_eq!(store.count_present().unwrap(), 1);
        assert_eq!(store.irk(slot).unwrap(), Some(0x77));
        assert!(store.state_flags(slot).unwrap().contains(BondFlags::COMPLETE));
    }
}
