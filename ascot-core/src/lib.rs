//! Foundation types for `ascot`
//!
//! This library contains the types that are shared between the `ascot` crates: the Bluetooth
//! device address with its four kinds, and the cryptographic toolbox functions used for address
//! resolution and signed data.
//!
//! The address kinds follow the Bluetooth Specification (v5.0 | Vol 6, Part B, section 1.3). A
//! device address is always in little endian order, the same byte order the address has within a
//! protocol data unit.

#![cfg_attr(not(feature = "std"), no_std)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

#[cfg(feature = "cryptography")]
pub mod cryptography;
pub mod errors;

use errors::{AddressError, ResolvableError};

/// A Bluetooth device address
///
/// The address is stored in little endian order, so the most significant byte (the byte carrying
/// the random address sub-type bits) is the *last* byte of the array.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BluetoothDeviceAddress(pub [u8; 6]);

impl core::ops::Deref for BluetoothDeviceAddress {
    type Target = [u8; 6];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl core::ops::DerefMut for BluetoothDeviceAddress {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<[u8; 6]> for BluetoothDeviceAddress {
    fn from(address: [u8; 6]) -> Self {
        BluetoothDeviceAddress(address)
    }
}

impl core::fmt::Display for BluetoothDeviceAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        // display in the human order, most significant byte first
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[5], self.0[4], self.0[3], self.0[2], self.0[1], self.0[0]
        )
    }
}

impl BluetoothDeviceAddress {
    /// Create an address with all bytes set to zero
    pub fn zeroed() -> Self {
        BluetoothDeviceAddress([0; 6])
    }

    /// Create an address with all bytes set to one
    ///
    /// This is the pattern used by bond storage for an unoccupied record.
    pub fn ones() -> Self {
        BluetoothDeviceAddress([0xFF; 6])
    }

    /// Try to create a static random device address from `address`
    ///
    /// The two most significant bits are forced to be ones. The rest of the address is random and
    /// must not be all zeros nor all ones.
    pub fn try_from_static(mut address: [u8; 6]) -> Result<Self, errors::StaticDeviceError> {
        let rand_is_zero = address[..5].iter().all(|b| *b == 0) && address[5] & 0x3F == 0;

        let rand_is_ones = address[..5].iter().all(|b| *b == 0xFF) && address[5] & 0x3F == 0x3F;

        if rand_is_zero {
            Err(AddressError::AddressIsZero)
        } else if rand_is_ones {
            Err(AddressError::AddressIsAllOnes)
        } else {
            address[5] |= 0xC0;

            Ok(BluetoothDeviceAddress(address))
        }
    }

    /// Try to create a non-resolvable private address from `address`
    ///
    /// The two most significant bits are forced to be zeros. The rest of the address is random and
    /// must not be all zeros nor all ones.
    pub fn try_from_non_resolvable(mut address: [u8; 6]) -> Result<Self, errors::NonResolvableError> {
        let rand_is_zero = address[..5].iter().all(|b| *b == 0) && address[5] & 0x3F == 0;

        let rand_is_ones = address[..5].iter().all(|b| *b == 0xFF) && address[5] & 0x3F == 0x3F;

        if rand_is_zero {
            Err(AddressError::AddressIsZero)
        } else if rand_is_ones {
            Err(AddressError::AddressIsAllOnes)
        } else {
            address[5] &= 0x3F;

            Ok(BluetoothDeviceAddress(address))
        }
    }

    /// Try to create a resolvable private address from an identity resolving key and a *prand*
    ///
    /// The two most significant bits of the prand are forced to the resolvable private address
    /// sub-type (`0b01`). The twenty two random bits of the prand must not be all zeros nor all
    /// ones. The hash part of the address is generated from `irk` and the prand with the toolbox
    /// function [`ah`](cryptography::ah).
    #[cfg(feature = "cryptography")]
    pub fn try_from_resolvable(irk: u128, mut prand: [u8; 3]) -> Result<Self, ResolvableError> {
        let rand_is_zero = prand[..2].iter().all(|b| *b == 0) && prand[2] & 0x3F == 0;

        let rand_is_ones = prand[..2].iter().all(|b| *b == 0xFF) && prand[2] & 0x3F == 0x3F;

        if rand_is_zero {
            return Err(ResolvableError::PRandIsZero);
        }

        if rand_is_ones {
            return Err(ResolvableError::PRandIsAllOnes);
        }

        prand[2] = (prand[2] & 0x3F) | 0x40;

        let hash = cryptography::ah(irk, prand);

        Ok(BluetoothDeviceAddress([
            hash[0], hash[1], hash[2], prand[0], prand[1], prand[2],
        ]))
    }

    /// Create a new resolvable private address using the system random number generator
    #[cfg(all(feature = "cryptography", feature = "sys-rand"))]
    pub fn new_resolvable(irk: u128) -> Self {
        use rand_core::RngCore;

        loop {
            let mut prand = [0u8; 3];

            rand_core::OsRng.fill_bytes(&mut prand);

            if let Ok(address) = Self::try_from_resolvable(irk, prand) {
                break address;
            }
        }
    }

    /// Check whether this address resolves with the identity resolving key `irk`
    ///
    /// The hash part of the address is recalculated from `irk` and the prand part, and compared
    /// against the hash within the address.
    #[cfg(feature = "cryptography")]
    pub fn resolve(&self, irk: u128) -> bool {
        let hash = [self.0[0], self.0[1], self.0[2]];

        let prand = [self.0[3], self.0[4], self.0[5]];

        cryptography::ah(irk, prand) == hash
    }

    /// Check if this is a resolvable private address (by its sub-type bits)
    pub fn is_resolvable_private(&self) -> bool {
        self.0[5] & 0xC0 == 0x40
    }

    /// Check if this is a non-resolvable private address (by its sub-type bits)
    pub fn is_non_resolvable_private(&self) -> bool {
        self.0[5] & 0xC0 == 0x00
    }

    /// Check if this is a static random device address (by its sub-type bits)
    pub fn is_static_random(&self) -> bool {
        self.0[5] & 0xC0 == 0xC0
    }
}

/// The kind of a device address
///
/// A peer address is always accompanied by its kind, as the kind decides how the address is
/// matched against stored bonding information. Public and static random addresses are matched
/// directly, a resolvable private address is matched through every stored identity resolving key,
/// and a non-resolvable private address can only be matched against the last address the peer was
/// seen with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AddressType {
    Public,
    StaticRandom,
    ResolvablePrivate,
    NonResolvablePrivate,
}

impl AddressType {
    pub fn into_val(self) -> u8 {
        match self {
            AddressType::Public => 0x0,
            AddressType::StaticRandom => 0x1,
            AddressType::ResolvablePrivate => 0x2,
            AddressType::NonResolvablePrivate => 0x3,
        }
    }

    pub fn try_from_val(val: u8) -> Result<Self, AddressTypeError> {
        match val {
            0x0 => Ok(AddressType::Public),
            0x1 => Ok(AddressType::StaticRandom),
            0x2 => Ok(AddressType::ResolvablePrivate),
            0x3 => Ok(AddressType::NonResolvablePrivate),
            _ => Err(AddressTypeError),
        }
    }

    /// Check if the address kind is an identity kind
    ///
    /// Only a public or a static random address identifies a device on its own, and only those
    /// kinds are stored as the identity of a bond.
    pub fn is_identity(self) -> bool {
        match self {
            AddressType::Public | AddressType::StaticRandom => true,
            _ => false,
        }
    }
}

impl core::fmt::Display for AddressType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AddressType::Public => f.write_str("public device address"),
            AddressType::StaticRandom => f.write_str("static random device address"),
            AddressType::ResolvablePrivate => f.write_str("resolvable private address"),
            AddressType::NonResolvablePrivate => f.write_str("non-resolvable private address"),
        }
    }
}

/// Error returned by [`AddressType::try_from_val`] for a value outside of the enumeration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AddressTypeError;

impl core::fmt::Display for AddressTypeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("invalid address type value")
    }
}

#[cfg(feature = "std")]
impl std::error::Error for AddressTypeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_address_sub_type() {
        let address = BluetoothDeviceAddress::try_from_static([0x12, 0x34, 0x56, 0x78, 0x9A, 0x1C]).unwrap();

        assert!(address.is_static_random());
        assert_eq!(address.0[5], 0xDC);
    }

    #[test]
    fn static_address_no_entropy() {
        assert_eq!(
            BluetoothDeviceAddress::try_from_static([0, 0, 0, 0, 0, 0xC0]),
            Err(AddressError::AddressIsZero)
        );

        assert_eq!(
            BluetoothDeviceAddress::try_from_static([0xFF; 6]),
            Err(AddressError::AddressIsAllOnes)
        );
    }

    #[test]
    fn non_resolvable_sub_type() {
        let address = BluetoothDeviceAddress::try_from_non_resolvable([0x12, 0x34, 0x56, 0x78, 0x9A, 0xFC]).unwrap();

        assert!(address.is_non_resolvable_private());
        assert_eq!(address.0[5], 0x3C);
    }

    #[cfg(feature = "cryptography")]
    #[test]
    fn resolvable_address_resolves_with_its_irk() {
        let irk = 0xec0234a3_57c8ad05_341010a6_0a397d9b;

        let address = BluetoothDeviceAddress::try_from_resolvable(irk, [0x94, 0x81, 0x70]).unwrap();

        assert!(address.is_resolvable_private());
        assert!(address.resolve(irk));
        assert!(!address.resolve(irk ^ 1));
    }

    /// Sample data from the Bluetooth Specification (v5.0 | Vol 3, Part H, Appendix D.7): prand
    /// 0x708194 with the sample IRK hashes to 0x0dfbaa.
    #[cfg(feature = "cryptography")]
    #[test]
    fn resolvable_address_from_spec_sample() {
        let irk = 0xec0234a3_57c8ad05_341010a6_0a397d9b;

        let address = BluetoothDeviceAddress::try_from_resolvable(irk, [0x94, 0x81, 0x70]).unwrap();

        assert_eq!(address.0, [0xaa, 0xfb, 0x0d, 0x94, 0x81, 0x70]);
    }

    #[cfg(feature = "cryptography")]
    #[test]
    fn resolvable_prand_no_entropy() {
        assert_eq!(
            BluetoothDeviceAddress::try_from_resolvable(0, [0, 0, 0x40]),
            Err(ResolvableError::PRandIsZero)
        );

        assert_eq!(
            BluetoothDeviceAddress::try_from_resolvable(0, [0xFF, 0xFF, 0x7F]),
            Err(ResolvableError::PRandIsAllOnes)
        );
    }

    #[test]
    fn address_type_values_round_trip() {
        for val in 0..=3 {
            assert_eq!(AddressType::try_from_val(val).unwrap().into_val(), val);
        }

        assert!(AddressType::try_from_val(4).is_err());
    }
}
