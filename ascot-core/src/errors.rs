//! `ascot` Errors
//!
//! Errors shared by the libraries within `ascot`.

use core::fmt::{self, Display, Formatter};

/// The error for an invalid Bluetooth address
///
/// This is returned whenever trying to create a [`BluetoothDeviceAddress`] fails because the
/// random part of the address does not contain any entropy.
///
/// [`BluetoothDeviceAddress`]: super::BluetoothDeviceAddress
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum AddressError {
    AddressIsZero,
    AddressIsAllOnes,
}

impl Display for AddressError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AddressError::AddressIsZero => f.write_str("the random part of the address is zero"),
            AddressError::AddressIsAllOnes => f.write_str("the random part of the address is all ones"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for AddressError {}

/// Error type for
/// [BluetoothDeviceAddress::try_from_static](crate::BluetoothDeviceAddress::try_from_static)
pub type StaticDeviceError = AddressError;

/// Error type for
/// [BluetoothDeviceAddress::try_from_non_resolvable](crate::BluetoothDeviceAddress::try_from_non_resolvable)
pub type NonResolvableError = AddressError;

/// The error for an invalid resolvable private address
///
/// The *prand* of a resolvable private address has twenty two random bits, and like the other
/// random address kinds those bits must not be all zeros nor all ones.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ResolvableError {
    PRandIsZero,
    PRandIsAllOnes,
}

impl Display for ResolvableError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ResolvableError::PRandIsZero => f.write_str("the random part of the prand is all zeros"),
            ResolvableError::PRandIsAllOnes => f.write_str("the random part of the prand is all ones"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ResolvableError {}
