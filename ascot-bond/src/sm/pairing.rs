//! Pairing protocol values
//!
//! The enumerations of the pairing feature exchange, as specified in the Bluetooth Specification
//! (v5.0 | Vol 3, Part H, section 3.5). These are the values carried in pairing request and
//! response protocol data units and in the pairing failed reason code.

use crate::Status;

/// The IO Capabilities of a device as it relates to the pairing method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoCapability {
    /// The device only contains a display
    DisplayOnly,
    /// The device contains a display with a method for the user to enter yes or no
    DisplayWithYesOrNo,
    /// The device only contains a keyboard
    KeyboardOnly,
    /// The device has no input or output for the user
    NoInputNoOutput,
    /// The device contains a keyboard and a display
    KeyboardDisplay,
}

impl IoCapability {
    pub fn into_val(self) -> u8 {
        match self {
            IoCapability::DisplayOnly => 0x0,
            IoCapability::DisplayWithYesOrNo => 0x1,
            IoCapability::KeyboardOnly => 0x2,
            IoCapability::NoInputNoOutput => 0x3,
            IoCapability::KeyboardDisplay => 0x4,
        }
    }

    pub fn try_from_val(val: u8) -> Result<Self, Status> {
        match val {
            0x0 => Ok(IoCapability::DisplayOnly),
            0x1 => Ok(IoCapability::DisplayWithYesOrNo),
            0x2 => Ok(IoCapability::KeyboardOnly),
            0x3 => Ok(IoCapability::NoInputNoOutput),
            0x4 => Ok(IoCapability::KeyboardDisplay),
            _ => Err(Status::InvalidParameter),
        }
    }

    /// Check if this device has no input or output capability for pairing
    pub fn no_io_capability(self) -> bool {
        matches!(self, IoCapability::NoInputNoOutput)
    }

    /// Check if the capability can take a passkey entered by the user
    pub fn is_input_capable(self) -> bool {
        matches!(self, IoCapability::KeyboardOnly | IoCapability::KeyboardDisplay)
    }

    /// Check if the capability can show a passkey to the user
    pub fn is_output_capable(self) -> bool {
        matches!(
            self,
            IoCapability::DisplayOnly | IoCapability::DisplayWithYesOrNo | IoCapability::KeyboardDisplay
        )
    }
}

/// Flag if out of band authentication data is available
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OobDataFlag {
    AuthenticationDataNotPresent,
    AuthenticationDataFromRemoteDevicePresent,
}

impl OobDataFlag {
    pub fn into_val(self) -> u8 {
        match self {
            OobDataFlag::AuthenticationDataNotPresent => 0x0,
            OobDataFlag::AuthenticationDataFromRemoteDevicePresent => 0x1,
        }
    }

    pub fn try_from_val(val: u8) -> Result<Self, Status> {
        match val {
            0x0 => Ok(OobDataFlag::AuthenticationDataNotPresent),
            0x1 => Ok(OobDataFlag::AuthenticationDataFromRemoteDevicePresent),
            _ => Err(Status::InvalidParameter),
        }
    }
}

/// The key distribution and generation flags
///
/// Six independent flags stating which keys each side distributes at the end of pairing, as in
/// the key distribution and generation section of the Bluetooth Specification (v5.0 | Vol 3,
/// Part H, section 3.6.1). *Slave* flags are the keys distributed by the responding device and
/// *master* flags the keys distributed by the initiating device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyDistribution {
    pub slave_enc_key: bool,
    pub slave_id_key: bool,
    pub slave_sign_key: bool,
    pub master_enc_key: bool,
    pub master_id_key: bool,
    pub master_sign_key: bool,
}

impl KeyDistribution {
    /// A distribution exchanging only the responder's encryption key
    pub fn enc_key_only() -> Self {
        KeyDistribution {
            slave_enc_key: true,
            slave_id_key: false,
            slave_sign_key: false,
            master_enc_key: false,
            master_id_key: false,
            master_sign_key: false,
        }
    }

    /// A distribution exchanging every key in both directions
    pub fn all() -> Self {
        KeyDistribution {
            slave_enc_key: true,
            slave_id_key: true,
            slave_sign_key: true,
            master_enc_key: true,
            master_id_key: true,
            master_sign_key: true,
        }
    }

    pub fn into_val(self) -> u8 {
        let mut val = 0;

        if self.slave_enc_key {
            val |= 1 << 0
        }
        if self.slave_id_key {
            val |= 1 << 1
        }
        if self.slave_sign_key {
            val |= 1 << 2
        }
        if self.master_enc_key {
            val |= 1 << 3
        }
        if self.master_id_key {
            val |= 1 << 4
        }
        if self.master_sign_key {
            val |= 1 << 5
        }

        val
    }

    pub fn try_from_val(val: u8) -> Result<Self, Status> {
        if val & !0x3F != 0 {
            return Err(Status::InvalidParameter);
        }

        Ok(KeyDistribution {
            slave_enc_key: val & (1 << 0) != 0,
            slave_id_key: val & (1 << 1) != 0,
            slave_sign_key: val & (1 << 2) != 0,
            master_enc_key: val & (1 << 3) != 0,
            master_id_key: val & (1 << 4) != 0,
            master_sign_key: val & (1 << 5) != 0,
        })
    }
}

impl Default for KeyDistribution {
    fn default() -> Self {
        KeyDistribution::enc_key_only()
    }
}

/// The reason of a pairing failed protocol data unit
///
/// See the Bluetooth Specification (v5.0 | Vol 3, Part H, section 3.5.5)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingFailedReason {
    PasskeyEntryFailed,
    OobNotAvailable,
    AuthenticationRequirements,
    ConfirmValueFailed,
    PairingNotSupported,
    EncryptionKeySize,
    CommandNotSupported,
    UnspecifiedReason,
    RepeatedAttempts,
}

impl PairingFailedReason {
    pub fn into_val(self) -> u8 {
        match self {
            PairingFailedReason::PasskeyEntryFailed => 0x1,
            PairingFailedReason::OobNotAvailable => 0x2,
            PairingFailedReason::AuthenticationRequirements => 0x3,
            PairingFailedReason::ConfirmValueFailed => 0x4,
            PairingFailedReason::PairingNotSupported => 0x5,
            PairingFailedReason::EncryptionKeySize => 0x6,
            PairingFailedReason::CommandNotSupported => 0x7,
            PairingFailedReason::UnspecifiedReason => 0x8,
            PairingFailedReason::RepeatedAttempts => 0x9,
        }
    }

    pub fn try_from_val(val: u8) -> Result<Self, Status> {
        match val {
            0x1 => Ok(PairingFailedReason::PasskeyEntryFailed),
            0x2 => Ok(PairingFailedReason::OobNotAvailable),
            0x3 => Ok(PairingFailedReason::AuthenticationRequirements),
            0x4 => Ok(PairingFailedReason::ConfirmValueFailed),
            0x5 => Ok(PairingFailedReason::PairingNotSupported),
            0x6 => Ok(PairingFailedReason::EncryptionKeySize),
            0x7 => Ok(PairingFailedReason::CommandNotSupported),
            0x8 => Ok(PairingFailedReason::UnspecifiedReason),
            0x9 => Ok(PairingFailedReason::RepeatedAttempts),
            _ => Err(Status::InvalidParameter),
        }
    }
}

impl core::fmt::Display for PairingFailedReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PairingFailedReason::PasskeyEntryFailed => f.write_str("passkey entry failed"),
            PairingFailedReason::OobNotAvailable => f.write_str("out of band data not available"),
            PairingFailedReason::AuthenticationRequirements => f.write_str("authentication requirements not met"),
            PairingFailedReason::ConfirmValueFailed => f.write_str("confirm value check failed"),
            PairingFailedReason::PairingNotSupported => f.write_str("pairing not supported"),
            PairingFailedReason::EncryptionKeySize => f.write_str("encryption key size insufficient"),
            PairingFailedReason::CommandNotSupported => f.write_str("command not supported"),
            PairingFailedReason::UnspecifiedReason => f.write_str("unspecified reason"),
            PairingFailedReason::RepeatedAttempts => f.write_str("repeated attempts"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_capability_values_round_trip() {
        for val in 0..=4 {
            assert_eq!(IoCapability::try_from_val(val).unwrap().into_val(), val);
        }

        assert!(IoCapability::try_from_val(5).is_err());
    }

    #[test]
    fn oob_data_flag_values_round_trip() {
        for val in 0..=1 {
            assert_eq!(OobDataFlag::try_from_val(val).unwrap().into_val(), val);
        }

        assert!(OobDataFlag::try_from_val(2).is_err());
    }

    #[test]
    fn key_distribution_values_round_trip() {
        for val in 0..=0x3F {
            assert_eq!(KeyDistribution::try_from_val(val).unwrap().into_val(), val);
        }

        assert!(KeyDistribution::try_from_val(0x40).is_err());
    }

    #[test]
    fn pairing_failed_reason_values_round_trip() {
        for val in 0x1..=0x9 {
            assert_eq!(PairingFailedReason::try_from_val(val).unwrap().into_val(), val);
        }

        assert!(PairingFailedReason::try_from_val(0x0).is_err());
        assert!(PairingFailedReason::try_from_val(0xA).is_err());
    }
}
