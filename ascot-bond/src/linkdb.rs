//! Link state table
//!
//! The link database is the volatile table of currently active connections. Each link is keyed by
//! its connection handle and carries the peer address, the coarse security state flags and the
//! transient signing material used while the link is up. The table has a fixed small capacity
//! matching the controller's connection limit.
//!
//! Everything here is in-memory only, the durable counterpart of a link lives in
//! [`bonds`](crate::bonds).

use crate::{AddressType, BluetoothDeviceAddress, Status};
use alloc::vec::Vec;

/// A connection handle given by the controller
pub type ConnectionHandle = u16;

/// The sentinel for "no connection"
pub const INVALID_CONNECTION_HANDLE: ConnectionHandle = 0xFFFF;

/// The security state flags of a link
///
/// Flags are combined with `|`. Within a connection's lifetime the flags only ever accumulate,
/// except that [`BONDED`](LinkState::BONDED) and [`ENCRYPTED`](LinkState::ENCRYPTED) are cleared
/// when a re-pairing fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkState(u8);

impl LinkState {
    pub const NONE: LinkState = LinkState(0);

    pub const CONNECTED: LinkState = LinkState(1 << 0);

    pub const AUTHENTICATED: LinkState = LinkState(1 << 1);

    pub const BONDED: LinkState = LinkState(1 << 2);

    pub const ENCRYPTED: LinkState = LinkState(1 << 3);

    /// Check if every flag of `mask` is set
    pub fn contains(self, mask: LinkState) -> bool {
        self.0 & mask.0 == mask.0
    }
}

impl core::ops::BitOr for LinkState {
    type Output = LinkState;

    fn bitor(self, rhs: LinkState) -> LinkState {
        LinkState(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for LinkState {
    fn bitor_assign(&mut self, rhs: LinkState) {
        self.0 |= rhs.0
    }
}

impl core::ops::Not for LinkState {
    type Output = LinkState;

    fn not(self) -> LinkState {
        LinkState(!self.0)
    }
}

impl core::ops::BitAnd for LinkState {
    type Output = LinkState;

    fn bitand(self, rhs: LinkState) -> LinkState {
        LinkState(self.0 & rhs.0)
    }
}

/// Transient signing material of a link
///
/// This mirrors the durable signing key of the bond but has its own lifetime, it exists only
/// while the link does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignInfo {
    /// The peer's connection signature resolving key
    pub csrk: u128,
    /// The replay-guarding counter of signed writes
    pub sign_counter: u32,
}

/// One active connection
#[derive(Debug, Clone)]
pub struct LinkRecord {
    pub handle: ConnectionHandle,
    /// Identifier of the logical owner of this link
    pub owner: u8,
    pub state: LinkState,
    pub peer_address: BluetoothDeviceAddress,
    pub peer_address_type: AddressType,
    /// Negotiated connection interval, informational
    pub conn_interval: u16,
    /// Size of the encryption key of the link, valid once encrypted
    pub key_size: u8,
    pub security: Option<SignInfo>,
}

/// The table of active links
pub struct LinkDb {
    links: Vec<LinkRecord>,
    capacity: usize,
}

impl LinkDb {
    /// Create a table with room for `capacity` simultaneous links
    pub fn new(capacity: usize) -> Self {
        LinkDb {
            links: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Insert a new link
    ///
    /// # Errors
    /// [`NoResources`](Status::NoResources) when the table is full, and
    /// [`InvalidParameter`](Status::InvalidParameter) when `handle` is the invalid sentinel or
    /// already present.
    pub fn add(
        &mut self,
        handle: ConnectionHandle,
        owner: u8,
        state: LinkState,
        peer_address: BluetoothDeviceAddress,
        peer_address_type: AddressType,
        conn_interval: u16,
    ) -> Result<(), Status> {
        if handle == INVALID_CONNECTION_HANDLE || self.find(handle).is_some() {
            return Err(Status::InvalidParameter);
        }

        if self.links.len() == self.capacity {
            return Err(Status::NoResources);
        }

        self.links.push(LinkRecord {
            handle,
            owner,
            state,
            peer_address,
            peer_address_type,
            conn_interval,
            key_size: 0,
            security: None,
        });

        log::info!("(LDB) link {:#x} added, peer {}", handle, peer_address);

        Ok(())
    }

    /// Remove the link of `handle`, freeing its slot
    pub fn remove(&mut self, handle: ConnectionHandle) -> Result<(), Status> {
        match self.links.iter().position(|l| l.handle == handle) {
            Some(index) => {
                self.links.swap_remove(index);

                log::info!("(LDB) link {:#x} removed", handle);

                Ok(())
            }
            None => Err(Status::NotConnected),
        }
    }

    /// Set the state flags of a link
    ///
    /// The flags are set absolutely, not merged. A caller merging flags must read the current
    /// state first.
    pub fn update_state(&mut self, handle: ConnectionHandle, new_state: LinkState) -> Result<(), Status> {
        match self.find_mut(handle) {
            Some(link) => {
                link.state = new_state;

                Ok(())
            }
            None => Err(Status::NotConnected),
        }
    }

    pub fn find(&self, handle: ConnectionHandle) -> Option<&LinkRecord> {
        self.links.iter().find(|l| l.handle == handle)
    }

    pub fn find_mut(&mut self, handle: ConnectionHandle) -> Option<&mut LinkRecord> {
        self.links.iter_mut().find(|l| l.handle == handle)
    }

    /// Find the first link owned by `owner`, in table order
    pub fn find_first_by_owner(&self, owner: u8) -> Option<&LinkRecord> {
        self.links.iter().find(|l| l.owner == owner)
    }

    /// Check if the link of `handle` has every flag of `mask` set
    ///
    /// An unknown handle is simply not in any state.
    pub fn is_in_state(&self, handle: ConnectionHandle, mask: LinkState) -> bool {
        self.find(handle).map(|l| l.state.contains(mask)).unwrap_or(false)
    }

    /// Visit every active link in table order
    ///
    /// The callback may update the fields of a link but must not change the membership of the
    /// table; the borrow rules enforce this.
    pub fn for_each<F>(&mut self, mut callback: F)
    where
        F: FnMut(&mut LinkRecord),
    {
        for link in self.links.iter_mut() {
            callback(link)
        }
    }

    pub fn active_count(&self) -> usize {
        self.links.len()
    }

    /// The layered security gate for encrypted or signed operations
    ///
    /// The checks run in a fixed order so that the most fundamental problem is the one reported:
    /// the link must exist, then it must be encrypted, then its key must be at least
    /// `required_key_size`, then (when `require_authenticated`) the pairing behind the key must
    /// have been authenticated.
    pub fn authentication_check(
        &self,
        handle: ConnectionHandle,
        required_key_size: u8,
        require_authenticated: bool,
    ) -> Result<(), Status> {
        let link = self.find(handle).ok_or(Status::NotConnected)?;

        if !link.state.contains(LinkState::ENCRYPTED) {
            return Err(Status::NotEncrypted);
        }

        if link.key_size < required_key_size {
            return Err(Status::KeySizeTooSmall);
        }

        if require_authenticated && !link.state.contains(LinkState::AUTHENTICATED) {
            return Err(Status::NotAuthenticated);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(last: u8) -> BluetoothDeviceAddress {
        BluetoothDeviceAddress([0x10, 0x20, 0x30, 0x40, 0x50, last])
    }

    fn db_with_one() -> LinkDb {
        let mut db = LinkDb::new(3);

        db.add(0x20, 1, LinkState::CONNECTED, peer(1), AddressType::Public, 24)
            .unwrap();

        db
    }

    #[test]
    fn add_find_remove() {
        let mut db = db_with_one();

        assert_eq!(db.find(0x20).unwrap().peer_address, peer(1));

        db.remove(0x20).unwrap();

        assert!(db.find(0x20).is_none());

        assert_eq!(db.remove(0x20), Err(Status::NotConnected));
    }

    #[test]
    fn capacity_is_enforced() {
        let mut db = LinkDb::new(2);

        db.add(1, 0, LinkState::CONNECTED, peer(1), AddressType::Public, 24).unwrap();
        db.add(2, 0, LinkState::CONNECTED, peer(2), AddressType::Public, 24).unwrap();

        assert_eq!(
            db.add(3, 0, LinkState::CONNECTED, peer(3), AddressType::Public, 24),
            Err(Status::NoResources)
        );
    }

    #[test]
    fn duplicate_and_invalid_handles_are_rejected() {
        let mut db = db_with_one();

        assert_eq!(
            db.add(0x20, 0, LinkState::CONNECTED, peer(2), AddressType::Public, 24),
            Err(Status::InvalidParameter)
        );

        assert_eq!(
            db.add(
                INVALID_CONNECTION_HANDLE,
                0,
                LinkState::CONNECTED,
                peer(2),
                AddressType::Public,
                24
            ),
            Err(Status::InvalidParameter)
        );
    }

    #[test]
    fn update_state_is_absolute() {
        let mut db = db_with_one();

        db.update_state(0x20, LinkState::CONNECTED | LinkState::ENCRYPTED).unwrap();

        db.update_state(0x20, LinkState::CONNECTED).unwrap();

        assert!(!db.is_in_state(0x20, LinkState::ENCRYPTED));
        assert!(db.is_in_state(0x20, LinkState::CONNECTED));
    }

    #[test]
    fn find_first_by_owner_in_table_order() {
        let mut db = LinkDb::new(3);

        db.add(1, 7, LinkState::CONNECTED, peer(1), AddressType::Public, 24).unwrap();
        db.add(2, 7, LinkState::CONNECTED, peer(2), AddressType::Public, 24).unwrap();

        assert_eq!(db.find_first_by_owner(7).unwrap().handle, 1);

        assert!(db.find_first_by_owner(8).is_none());
    }

    #[test]
    fn for_each_updates_fields() {
        let mut db = LinkDb::new(3);

        db.add(1, 0, LinkState::CONNECTED, peer(1), AddressType::Public, 24).unwrap();
        db.add(2, 0, LinkState::CONNECTED, peer(2), AddressType::Public, 24).unwrap();

        db.for_each(|link| link.state |= LinkState::ENCRYPTED);

        assert!(db.is_in_state(1, LinkState::ENCRYPTED));
        assert!(db.is_in_state(2, LinkState::ENCRYPTED));
    }

    #[test]
    fn authentication_check_order() {
        let mut db = db_with_one();

        assert_eq!(db.authentication_check(0x99, 16, true), Err(Status::NotConnected));

        assert_eq!(db.authentication_check(0x20, 16, true), Err(Status::NotEncrypted));

        let link = db.find_mut(0x20).unwrap();
        link.state |= LinkState::ENCRYPTED;
        link.key_size = 7;

        assert_eq!(db.authentication_check(0x20, 16, true), Err(Status::KeySizeTooSmall));

        db.find_mut(0x20).unwrap().key_size = 16;

        assert_eq!(db.authentication_check(0x20, 16, true), Err(Status::NotAuthenticated));

        assert_eq!(db.authentication_check(0x20, 16, false), Ok(()));

        db.find_mut(0x20).unwrap().state |= LinkState::AUTHENTICATED;

        assert_eq!(db.authentication_check(0x20, 16, true), Ok(()));
    }
}
