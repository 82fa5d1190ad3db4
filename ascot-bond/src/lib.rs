//! GAP Bond Manager
//!
//! This library implements the bonding side of the Generic Access Profile: it tracks the security
//! state of every active connection, durably persists the key material produced by pairing (long
//! term keys, the identity resolving key, the signing key and its counter), and recognizes
//! previously bonded devices when they reconnect so that pairing can be skipped and encryption
//! started from the stored keys.
//!
//! The library is split along the lines of its storage:
//!
//! * [`nvstore`] is a wear-leveling record log over a NOR flash. It knows nothing about bonding,
//!   it maps record identifiers to the newest bytes written for them.
//! * [`linkdb`] is the volatile table of active connections and their security flags.
//! * [`bonds`] is the durable bond table built on top of [`nvstore`], together with the multi-step
//!   commit sequence that persists a new bond one record at a time.
//! * [`sm`] drives pairing and bonding for each connection and exposes the application surface,
//!   the [`GapBondManager`](sm::GapBondManager).
//!
//! The whole library runs in a single-threaded cooperative model. Every operation is driven by a
//! discrete event (a controller callback, a timer expiration or an application call) and runs to
//! completion, including flash access.
//!
//! # Flash
//! All persistence is generic over [`NorFlash`](embedded_storage::nor_flash::NorFlash). The
//! implementation provided to the manager owns the flash area exclusively; half of the area is
//! always kept erased as the compaction destination.

#![cfg_attr(not(feature = "std"), no_std)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

extern crate alloc;

pub mod bonds;
pub mod linkdb;
pub mod nvstore;
pub mod sm;

#[cfg(test)]
pub(crate) mod testing;

pub use ascot_core::{AddressType, BluetoothDeviceAddress};

use nvstore::NvError;

/// Status codes of the bond manager
///
/// These are the failure values returned throughout this library. An `Ok(..)` takes the place of
/// the *success* code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// A parameter was outside of its valid enumeration or range
    InvalidParameter,
    /// A fixed capacity table or snapshot has no free slot
    NoResources,
    /// The connection handle does not refer to an active connection
    NotConnected,
    /// The connection exists but is not usable for the requested operation
    InactiveConnection,
    /// The requested mode is already in effect
    AlreadyInRequestedMode,
    /// The operation is blocked by policy, for example erasing all bonds while connected
    CommandDisallowed,
    /// The persistent record store failed and has latched; see [`nvstore`]
    OperationFailed,
    /// The link is not encrypted
    NotEncrypted,
    /// The link is encrypted with a key smaller than required
    KeySizeTooSmall,
    /// The link is encrypted but the pairing was not authenticated
    NotAuthenticated,
}

impl core::fmt::Display for Status {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Status::InvalidParameter => f.write_str("invalid parameter"),
            Status::NoResources => f.write_str("no resources"),
            Status::NotConnected => f.write_str("not connected"),
            Status::InactiveConnection => f.write_str("inactive connection"),
            Status::AlreadyInRequestedMode => f.write_str("already in requested mode"),
            Status::CommandDisallowed => f.write_str("command disallowed"),
            Status::OperationFailed => f.write_str("persistent store operation failed"),
            Status::NotEncrypted => f.write_str("link is not encrypted"),
            Status::KeySizeTooSmall => f.write_str("encryption key size is too small"),
            Status::NotAuthenticated => f.write_str("link is not authenticated"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Status {}

impl From<NvError> for Status {
    fn from(e: NvError) -> Self {
        match e {
            NvError::InvalidParameter => Status::InvalidParameter,
            NvError::NoResources => Status::NoResources,
            NvError::NotFound | NvError::BadLength | NvError::OperationFailed => Status::OperationFailed,
        }
    }
}
