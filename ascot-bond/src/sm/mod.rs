//! Security and pairing state machine
//!
//! [`GapBondManager`] is the application surface of this library. It is driven by discrete
//! [controller events](ControllerEvent) and reacts by issuing [controller
//! commands](ControllerCommands) and by reading and writing the [bond table](crate::bonds) and
//! the [link table](crate::linkdb). The application observes pairing through a
//! [`BondEventListener`] and configures behavior through [`set_parameter`](GapBondManager::set_parameter).
//!
//! Pairing for one connection walks the states `Idle` → `PairingRequested` → `KeyExchange` →
//! `EncryptionPending` → `Encrypted` → `Bonded`, with `AutoFail` and `Terminated` absorbing a
//! failed or abandoned exchange. On a reconnection whose address matches a completed bond the
//! whole walk is skipped and encryption is started directly from the stored long term key.

pub mod pairing;

use crate::bonds::commit::{BondCommit, CommitProgress, PendingKeys};
use crate::bonds::{BondFlags, BondSlot, BondStore, LtkRecord};
use crate::linkdb::{ConnectionHandle, LinkDb, LinkState, SignInfo};
use crate::{AddressType, BluetoothDeviceAddress, Status};
use alloc::vec::Vec;
use embedded_storage::nor_flash::NorFlash;
use ascot_core::cryptography::aes_cmac_generate;
use pairing::{IoCapability, KeyDistribution, OobDataFlag, PairingFailedReason};

/// The most a default passcode may be set to
pub const PASSCODE_MAX: u32 = 999_999;

/// Valid range of the encryption key size parameter, in bytes
pub const KEY_SIZE_RANGE: core::ops::RangeInclusive<u8> = 7..=16;

/// The pairing state of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    /// No pairing activity
    Idle,
    /// A pairing request was sent or received and awaits the feature exchange
    PairingRequested,
    /// Keys are being exchanged
    KeyExchange,
    /// Encryption start was requested and awaits the encryption change event
    EncryptionPending,
    /// The link is encrypted and pairing is complete
    Encrypted,
    /// The bond of the pairing is durably stored
    Bonded,
    /// Pairing was rejected by the automatic failure test mode
    AutoFail,
    /// Pairing was abandoned and the link is being dropped
    Terminated,
}

/// When this device pairs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingPolicy {
    /// Never pair, incoming requests are rejected
    NoPairing,
    /// Pair when the peer asks for it
    WaitForRequest,
    /// Request pairing as soon as an unbonded peer connects
    InitiatePairing,
}

/// Recovery after a reconnection to a bonded peer fails because the peer lost the key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondFailAction {
    NoAction,
    /// Pair again from scratch
    Repair,
    TerminateLink,
    TerminateLinkAndEraseAllBonds,
}

/// The configuration of the bond manager
#[derive(Debug, Clone, Copy)]
pub struct GapBondConfig {
    pub pairing_policy: PairingPolicy,
    /// Require protection against man in the middle attacks
    pub mitm_protection: bool,
    pub io_capability: IoCapability,
    pub oob_flag: OobDataFlag,
    pub oob_data: [u8; 16],
    pub bonding_enabled: bool,
    pub key_distribution: KeyDistribution,
    /// Passcode used when the application is not prompted
    pub default_passcode: u32,
    /// Ask the application for the passcode instead of using the default
    pub passcode_prompt: bool,
    pub key_size: u8,
    /// Test mode, reject every pairing with [`auto_fail_reason`](GapBondConfig::auto_fail_reason)
    pub auto_fail_pairing: bool,
    pub auto_fail_reason: PairingFailedReason,
    /// Keep the controller white list mirroring the bond table
    pub auto_sync_white_list: bool,
    pub bond_fail_action: BondFailAction,
    /// Pairing timeout in seconds, enforced by the external timer facility
    pub pairing_timeout: u16,
}

impl Default for GapBondConfig {
    fn default() -> Self {
        GapBondConfig {
            pairing_policy: PairingPolicy::WaitForRequest,
            mitm_protection: false,
            io_capability: IoCapability::NoInputNoOutput,
            oob_flag: OobDataFlag::AuthenticationDataNotPresent,
            oob_data: [0; 16],
            bonding_enabled: true,
            key_distribution: KeyDistribution::default(),
            default_passcode: 0,
            passcode_prompt: false,
            key_size: 16,
            auto_fail_pairing: false,
            auto_fail_reason: PairingFailedReason::UnspecifiedReason,
            auto_sync_white_list: false,
            bond_fail_action: BondFailAction::NoAction,
            pairing_timeout: 30,
        }
    }
}

/// One configuration parameter, written with [`set_parameter`](GapBondManager::set_parameter)
/// and read back with [`get_parameter`](GapBondManager::get_parameter)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parameter {
    PairingPolicy(PairingPolicy),
    MitmProtection(bool),
    IoCapability(IoCapability),
    OobFlag(OobDataFlag),
    OobData([u8; 16]),
    BondingEnabled(bool),
    KeyDistribution(KeyDistribution),
    DefaultPasscode(u32),
    PasscodePrompt(bool),
    KeySize(u8),
    AutoFailPairing(bool),
    AutoFailReason(PairingFailedReason),
    AutoSyncWhiteList(bool),
    BondFailAction(BondFailAction),
    PairingTimeout(u16),
    /// Erase every bond; disallowed and deferred while any connection is active
    EraseAllBonds,
    /// Erase the bond matching an address
    EraseBond(AddressType, BluetoothDeviceAddress),
    /// The number of stored bonds; read only, a write is rejected
    BondCount(u8),
}

/// The discriminant of a readable [`Parameter`]
///
/// Used with [`get_parameter`](GapBondManager::get_parameter). The erase parameters are
/// commands rather than state and have no discriminant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterId {
    PairingPolicy,
    MitmProtection,
    IoCapability,
    OobFlag,
    OobData,
    BondingEnabled,
    KeyDistribution,
    DefaultPasscode,
    PasscodePrompt,
    KeySize,
    AutoFailPairing,
    AutoFailReason,
    AutoSyncWhiteList,
    BondFailAction,
    PairingTimeout,
    BondCount,
}

/// The role this device has on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Central,
    Peripheral,
}

/// The keys delivered by a finished pairing
///
/// A `None` key was not exchanged. The identity is present when the peer distributed its identity
/// address information alongside the identity resolving key.
#[derive(Debug, Clone, Copy, Default)]
pub struct DistributedKeys {
    /// The peer asked for the pairing to be bonded
    pub bonding: bool,
    /// The pairing method protected against man in the middle attacks
    pub authenticated: bool,
    pub key_size: u8,
    pub identity: Option<(AddressType, BluetoothDeviceAddress)>,
    pub keys: PendingKeys,
}

/// An event from the controller or the protocol layer below
#[derive(Debug, Clone, Copy)]
pub enum ControllerEvent {
    ConnectionEstablished {
        handle: ConnectionHandle,
        role: Role,
        peer_address: BluetoothDeviceAddress,
        peer_address_type: AddressType,
        conn_interval: u16,
    },
    ConnectionTerminated {
        handle: ConnectionHandle,
    },
    /// The encryption state of the link changed
    EncryptionChange {
        handle: ConnectionHandle,
        encrypted: bool,
        key_size: u8,
    },
    /// Encryption start failed; `key_missing` when the peer rejected with its key lost
    EncryptionFailed {
        handle: ConnectionHandle,
        key_missing: bool,
    },
    /// The peer sent a pairing request
    PairingRequestReceived {
        handle: ConnectionHandle,
        io_capability: IoCapability,
        mitm: bool,
    },
    /// Pairing finished, successfully or not
    AuthenticationComplete {
        handle: ConnectionHandle,
        result: Result<DistributedKeys, PairingFailedReason>,
    },
    /// The peer started encryption and the controller needs the long term key (peripheral role)
    LtkRequested {
        handle: ConnectionHandle,
        div: u16,
    },
    /// The peer acknowledged the service changed indication
    ServiceChangedConfirmed {
        handle: ConnectionHandle,
    },
}

/// The commands the bond manager issues to the controller and the protocol layer below
///
/// Implemented by the glue to the real radio stack, and by test doubles.
pub trait ControllerCommands {
    /// Start encrypting the link from a stored long term key (central role)
    fn start_encryption(&mut self, handle: ConnectionHandle, ltk: &LtkRecord);

    /// Answer a long term key request, `None` for the negative reply (peripheral role)
    fn long_term_key_reply(&mut self, handle: ConnectionHandle, ltk: Option<u128>);

    fn terminate_connection(&mut self, handle: ConnectionHandle);

    fn clear_white_list(&mut self);

    fn add_to_white_list(&mut self, address_type: AddressType, address: BluetoothDeviceAddress);

    fn send_service_changed(&mut self, handle: ConnectionHandle);

    fn send_pairing_request(&mut self, handle: ConnectionHandle);

    fn accept_pairing(&mut self, handle: ConnectionHandle);

    fn reject_pairing(&mut self, handle: ConnectionHandle, reason: PairingFailedReason);

    fn passkey_reply(&mut self, handle: ConnectionHandle, passcode: u32);
}

/// Why a pairing did not complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingFailure {
    /// The protocol failed with a pairing failed reason code
    Protocol(PairingFailedReason),
    /// A local operation failed, most often bond persistence
    Local(Status),
    /// The pairing timer expired
    Timeout,
}

/// The callbacks of the application layer
///
/// Every pairing the application initiated or was notified of eventually gets a terminal
/// [`pairing_state_changed`](BondEventListener::pairing_state_changed) call, nothing is silently
/// dropped.
pub trait BondEventListener {
    /// The pairing needs a passcode from the application
    ///
    /// The application answers with [`passcode_response`](GapBondManager::passcode_response).
    fn passcode_requested(
        &mut self,
        peer_address: BluetoothDeviceAddress,
        handle: ConnectionHandle,
        input_capable: bool,
        output_capable: bool,
    );

    /// A connection moved to a new pairing state
    fn pairing_state_changed(
        &mut self,
        handle: ConnectionHandle,
        state: PairingState,
        status: Result<(), PairingFailure>,
    );
}

/// Per-connection pairing bookkeeping
struct Session {
    handle: ConnectionHandle,
    role: Role,
    state: PairingState,
    /// The bond slot of the peer, known from resolution at connect or claimed at bonding
    slot: Option<BondSlot>,
    awaiting_passcode: bool,
}

/// The GAP bond manager
///
/// See the [module](self) documentation. The manager is an explicit object, independent
/// instances can exist side by side (in tests in particular); nothing is process-global.
pub struct GapBondManager<F: NorFlash> {
    config: GapBondConfig,
    bonds: BondStore<F>,
    links: LinkDb,
    sessions: Vec<Session>,
    /// At most one bond commit may be in flight process-wide
    commit: Option<BondCommit>,
    /// An erase-all arrived while connected and runs at the last disconnect
    deferred_erase_all: bool,
    privacy_flag_writable: bool,
}

impl<F: NorFlash> GapBondManager<F> {
    /// Create a bond manager over `flash`
    ///
    /// `bond_capacity` is the size of the bond table and `link_capacity` the controller's
    /// connection limit.
    pub fn new(flash: F, config: GapBondConfig, bond_capacity: u8, link_capacity: usize) -> Result<Self, Status> {
        if config.default_passcode > PASSCODE_MAX || !KEY_SIZE_RANGE.contains(&config.key_size) {
            return Err(Status::InvalidParameter);
        }

        let mut bonds = BondStore::new(flash, bond_capacity)?;

        let privacy_flag_writable = bonds.count_present()? <= 1;

        Ok(GapBondManager {
            config,
            bonds,
            links: LinkDb::new(link_capacity),
            sessions: Vec::new(),
            commit: None,
            deferred_erase_all: false,
            privacy_flag_writable,
        })
    }

    pub fn config(&self) -> &GapBondConfig {
        &self.config
    }

    /// The number of stored bonds (the read-only bond count parameter)
    pub fn bond_count(&mut self) -> Result<u8, Status> {
        self.bonds.count_present()
    }

    /// Whether the privacy flag characteristic may currently be written
    ///
    /// The flag is writable while at most one bond exists and becomes read only once there is
    /// more than one.
    pub fn privacy_flag_writable(&self) -> bool {
        self.privacy_flag_writable
    }

    /// Match a peer address against the bond table
    pub fn resolve_address(
        &mut self,
        address_type: AddressType,
        address: BluetoothDeviceAddress,
    ) -> Result<Option<(BondSlot, BluetoothDeviceAddress)>, Status> {
        self.bonds.resolve_address(address_type, address)
    }

    /// Voluntarily compact the record store at `threshold_percent` utilization
    pub fn maintain(&mut self, threshold_percent: u8) -> Result<(), Status> {
        self.bonds.maintain(threshold_percent)
    }

    /// Write one configuration parameter
    ///
    /// The erase parameters act immediately (or are deferred, for an erase-all while connected).
    pub fn set_parameter<C>(&mut self, parameter: Parameter, controller: &mut C) -> Result<(), Status>
    where
        C: ControllerCommands,
    {
        match parameter {
            Parameter::PairingPolicy(v) => self.config.pairing_policy = v,
            Parameter::MitmProtection(v) => self.config.mitm_protection = v,
            Parameter::IoCapability(v) => self.config.io_capability = v,
            Parameter::OobFlag(v) => self.config.oob_flag = v,
            Parameter::OobData(v) => self.config.oob_data = v,
            Parameter::BondingEnabled(v) => self.config.bonding_enabled = v,
            Parameter::KeyDistribution(v) => self.config.key_distribution = v,

            Parameter::DefaultPasscode(v) => {
                if v > PASSCODE_MAX {
                    return Err(Status::InvalidParameter);
                }

                self.config.default_passcode = v
            }

            Parameter::PasscodePrompt(v) => self.config.passcode_prompt = v,

            Parameter::KeySize(v) => {
                if !KEY_SIZE_RANGE.contains(&v) {
                    return Err(Status::InvalidParameter);
                }

                self.config.key_size = v
            }

            Parameter::AutoFailPairing(v) => self.config.auto_fail_pairing = v,
            Parameter::AutoFailReason(v) => self.config.auto_fail_reason = v,

            Parameter::AutoSyncWhiteList(v) => {
                self.config.auto_sync_white_list = v;

                if v {
                    self.sync_white_list(controller)?;
                }
            }

            Parameter::BondFailAction(v) => self.config.bond_fail_action = v,

            Parameter::PairingTimeout(v) => {
                if v == 0 {
                    return Err(Status::InvalidParameter);
                }

                self.config.pairing_timeout = v
            }

            Parameter::EraseAllBonds => return self.erase_all_bonds(controller),

            Parameter::EraseBond(address_type, address) => return self.erase_bond(address_type, address, controller),

            Parameter::BondCount(_) => return Err(Status::InvalidParameter),
        }

        Ok(())
    }

    /// Read one configuration parameter
    pub fn get_parameter(&mut self, id: ParameterId) -> Result<Parameter, Status> {
        let parameter = match id {
            ParameterId::PairingPolicy => Parameter::PairingPolicy(self.config.pairing_policy),
            ParameterId::MitmProtection => Parameter::MitmProtection(self.config.mitm_protection),
            ParameterId::IoCapability => Parameter::IoCapability(self.config.io_capability),
            ParameterId::OobFlag => Parameter::OobFlag(self.config.oob_flag),
            ParameterId::OobData => Parameter::OobData(self.config.oob_data),
            ParameterId::BondingEnabled => Parameter::BondingEnabled(self.config.bonding_enabled),
            ParameterId::KeyDistribution => Parameter::KeyDistribution(self.config.key_distribution),
            ParameterId::DefaultPasscode => Parameter::DefaultPasscode(self.config.default_passcode),
            ParameterId::PasscodePrompt => Parameter::PasscodePrompt(self.config.passcode_prompt),
            ParameterId::KeySize => Parameter::KeySize(self.config.key_size),
            ParameterId::AutoFailPairing => Parameter::AutoFailPairing(self.config.auto_fail_pairing),
            ParameterId::AutoFailReason => Parameter::AutoFailReason(self.config.auto_fail_reason),
            ParameterId::AutoSyncWhiteList => Parameter::AutoSyncWhiteList(self.config.auto_sync_white_list),
            ParameterId::BondFailAction => Parameter::BondFailAction(self.config.bond_fail_action),
            ParameterId::PairingTimeout => Parameter::PairingTimeout(self.config.pairing_timeout),
            ParameterId::BondCount => Parameter::BondCount(self.bonds.count_present()?),
        };

        Ok(parameter)
    }

    /// Process one controller event
    pub fn process<C, L>(&mut self, event: ControllerEvent, controller: &mut C, listener: &mut L) -> Result<(), Status>
    where
        C: ControllerCommands,
        L: BondEventListener,
    {
        match event {
            ControllerEvent::ConnectionEstablished {
                handle,
                role,
                peer_address,
                peer_address_type,
                conn_interval,
            } => self.p_connection_established(handle, role, peer_address, peer_address_type, conn_interval, controller),

            ControllerEvent::ConnectionTerminated { handle } => self.p_connection_terminated(handle, controller),

            ControllerEvent::EncryptionChange {
                handle,
                encrypted,
                key_size,
            } => self.p_encryption_change(handle, encrypted, key_size, controller, listener),

            ControllerEvent::EncryptionFailed { handle, key_missing } => {
                self.p_encryption_failed(handle, key_missing, controller, listener)
            }

            ControllerEvent::PairingRequestReceived {
                handle,
                io_capability,
                mitm,
            } => self.p_pairing_request(handle, io_capability, mitm, controller, listener),

            ControllerEvent::AuthenticationComplete { handle, result } => {
                self.p_authentication_complete(handle, result, listener)
            }

            ControllerEvent::LtkRequested { handle, div } => self.p_ltk_requested(handle, div, controller),

            ControllerEvent::ServiceChangedConfirmed { handle } => self.p_service_changed_confirmed(handle),
        }
    }

    /// Drive the in-flight bond commit one write forward
    ///
    /// Call repeatedly (for example from idle time) until it returns `false`, meaning no commit
    /// is in flight.
    pub fn poll_commit<C, L>(&mut self, controller: &mut C, listener: &mut L) -> Result<bool, Status>
    where
        C: ControllerCommands,
        L: BondEventListener,
    {
        let mut commit = match self.commit.take() {
            Some(commit) => commit,
            None => return Ok(false),
        };

        match commit.advance(&mut self.bonds) {
            Ok(CommitProgress::Continue) => {
                self.commit = Some(commit);

                Ok(true)
            }

            Ok(CommitProgress::Done) => {
                let slot = commit.slot();

                if self.config.auto_sync_white_list {
                    self.sync_white_list(controller)?;
                }

                self.update_privacy_permission()?;

                let handle = self.find_session_by_slot(slot).map(|session| {
                    session.state = PairingState::Bonded;

                    session.handle
                });

                if let Some(handle) = handle {
                    if let Some(link) = self.links.find_mut(handle) {
                        link.state |= LinkState::BONDED;
                    }

                    listener.pairing_state_changed(handle, PairingState::Bonded, Ok(()));
                }

                Ok(false)
            }

            Err(e) => {
                // abort, leaving the consistent prefix on flash with the completeness clear
                let slot = commit.slot();

                log::error!("(GBM) bond commit for slot {} aborted: {}", slot.0, e);

                if let Some(session) = self.find_session_by_slot(slot) {
                    let handle = session.handle;

                    listener.pairing_state_changed(handle, PairingState::Encrypted, Err(PairingFailure::Local(e)));
                }

                Err(e)
            }
        }
    }

    /// The application's answer to [`passcode_requested`](BondEventListener::passcode_requested)
    pub fn passcode_response<C>(
        &mut self,
        handle: ConnectionHandle,
        response: Result<u32, Status>,
        controller: &mut C,
    ) -> Result<(), Status>
    where
        C: ControllerCommands,
    {
        let session = self.find_session(handle).ok_or(Status::NotConnected)?;

        if !session.awaiting_passcode {
            return Err(Status::CommandDisallowed);
        }

        session.awaiting_passcode = false;

        match response {
            Ok(passcode) if passcode <= PASSCODE_MAX => {
                controller.passkey_reply(handle, passcode);

                Ok(())
            }
            Ok(_) => Err(Status::InvalidParameter),
            Err(_) => {
                controller.reject_pairing(handle, PairingFailedReason::PasskeyEntryFailed);

                session.state = PairingState::Idle;

                Ok(())
            }
        }
    }

    /// Set or clear the owed service changed indication
    ///
    /// With `handle` of `None` the flag is changed on every stored bond; otherwise on the bond of
    /// that connection.
    pub fn service_change_indicate(&mut self, handle: Option<ConnectionHandle>, set: bool) -> Result<(), Status> {
        match handle {
            Some(handle) => {
                let slot = self
                    .find_session(handle)
                    .and_then(|s| s.slot)
                    .ok_or(Status::NotConnected)?;

                self.bonds.set_service_changed(slot, set)
            }
            None => {
                for i in 0..self.bonds.capacity() {
                    let slot = BondSlot(i);

                    if self.bonds.core(slot)?.is_some() {
                        self.bonds.set_service_changed(slot, set)?;
                    }
                }

                Ok(())
            }
        }
    }

    /// Advance the sign counter of `handle` by one
    ///
    /// Called after a signed write was sent over the link. The new value is returned and, when
    /// the link belongs to a stored bond, written back to the bond record so it survives the
    /// disconnect.
    pub fn sign_counter_increment(&mut self, handle: ConnectionHandle) -> Result<u32, Status> {
        let counter = {
            let link = self.links.find_mut(handle).ok_or(Status::NotConnected)?;

            // the connection never exchanged a signing key
            let security = link.security.as_mut().ok_or(Status::InactiveConnection)?;

            security.sign_counter = security.sign_counter.wrapping_add(1);

            security.sign_counter
        };

        self.store_sign_counter(handle, counter)?;

        Ok(counter)
    }

    /// Verify a signed write received from the peer of `handle`
    ///
    /// `message` is the signed payload, `sign_counter` the counter the peer sent along with it
    /// and `mac` the 64-bit message authentication code of the signature. The signature covers
    /// the message followed by the little endian counter, keyed with the peer's stored signing
    /// key.
    ///
    /// A counter below the expected value is a replay and is rejected before any cryptography
    /// runs. On success the expected counter moves past `sign_counter` and is written back to
    /// the bond record.
    pub fn verify_signed_data(
        &mut self,
        handle: ConnectionHandle,
        message: &[u8],
        sign_counter: u32,
        mac: u64,
    ) -> Result<(), Status> {
        let (csrk, expected) = {
            let link = self.links.find(handle).ok_or(Status::NotConnected)?;

            let security = link.security.ok_or(Status::InactiveConnection)?;

            (security.csrk, security.sign_counter)
        };

        if sign_counter < expected {
            log::warn!(
                "(GBM) replayed sign counter {} on link {:#x}, expected at least {}",
                sign_counter,
                handle,
                expected
            );

            return Err(Status::InvalidParameter);
        }

        let mut signed = Vec::with_capacity(message.len() + 4);

        signed.extend_from_slice(message);
        signed.extend_from_slice(&sign_counter.to_le_bytes());

        // the signature of a signed write is the least significant 64 bits of the CMAC
        if aes_cmac_generate(csrk, &signed) as u64 != mac {
            log::warn!("(GBM) signature check failed on link {:#x}", handle);

            return Err(Status::NotAuthenticated);
        }

        let counter = sign_counter.wrapping_add(1);

        if let Some(link) = self.links.find_mut(handle) {
            if let Some(security) = link.security.as_mut() {
                security.sign_counter = counter;
            }
        }

        self.store_sign_counter(handle, counter)
    }

    fn store_sign_counter(&mut self, handle: ConnectionHandle, counter: u32) -> Result<(), Status> {
        if let Some(slot) = self.find_session(handle).and_then(|s| s.slot) {
            if self.bonds.core(slot)?.is_some() {
                self.bonds.write_sign_counter(slot, counter)?;
            }
        }

        Ok(())
    }

    /// The pairing timer of `handle` expired
    ///
    /// The timer itself is external; its expiration callback calls this.
    pub fn pairing_timeout<C, L>(&mut self, handle: ConnectionHandle, controller: &mut C, listener: &mut L)
    where
        C: ControllerCommands,
        L: BondEventListener,
    {
        let in_progress = matches!(
            self.find_session(handle).map(|s| s.state),
            Some(PairingState::PairingRequested) | Some(PairingState::KeyExchange) | Some(PairingState::EncryptionPending)
        );

        if !in_progress {
            return;
        }

        log::warn!("(GBM) pairing timed out on link {:#x}", handle);

        if let Some(session) = self.find_session(handle) {
            session.state = PairingState::Terminated;

            session.awaiting_passcode = false;
        }

        controller.terminate_connection(handle);

        listener.pairing_state_changed(handle, PairingState::Terminated, Err(PairingFailure::Timeout));
    }

    fn p_connection_established<C>(
        &mut self,
        handle: ConnectionHandle,
        role: Role,
        peer_address: BluetoothDeviceAddress,
        peer_address_type: AddressType,
        conn_interval: u16,
        controller: &mut C,
    ) -> Result<(), Status>
    where
        C: ControllerCommands,
    {
        self.links
            .add(handle, 0, LinkState::CONNECTED, peer_address, peer_address_type, conn_interval)?;

        let resolved = self.bonds.resolve_address(peer_address_type, peer_address)?;

        let mut session = Session {
            handle,
            role,
            state: PairingState::Idle,
            slot: None,
            awaiting_passcode: false,
        };

        if let Some((slot, identity)) = resolved {
            session.slot = Some(slot);

            if !peer_address_type.is_identity() {
                self.bonds.set_reconnection_address(slot, peer_address)?;
            }

            let flags = self.bonds.state_flags(slot)?;

            if flags.contains(BondFlags::COMPLETE) {
                log::info!("(GBM) link {:#x} matches bond slot {} ({})", handle, slot.0, identity);

                // the reconnection fast path, encryption starts from the stored key
                match role {
                    Role::Central => {
                        if let Some(ltk) = self.bonds.local_ltk(slot)? {
                            controller.start_encryption(handle, &ltk);

                            session.state = PairingState::EncryptionPending;
                        }
                    }
                    Role::Peripheral => {
                        // wait for the long term key request from the controller
                        session.state = PairingState::EncryptionPending;
                    }
                }
            } else {
                // a partial bond is recognized but its keys are not trusted for reconnection
                log::warn!("(GBM) link {:#x} matches incomplete bond slot {}, re-pairing needed", handle, slot.0);
            }
        }

        if session.state == PairingState::Idle {
            if let (PairingPolicy::InitiatePairing, Role::Central) = (self.config.pairing_policy, role) {
                controller.send_pairing_request(handle);

                session.state = PairingState::PairingRequested;
            }
        }

        self.sessions.push(session);

        Ok(())
    }

    fn p_connection_terminated<C>(&mut self, handle: ConnectionHandle, controller: &mut C) -> Result<(), Status>
    where
        C: ControllerCommands,
    {
        // a commit for this link's bond is cancelled, leaving the consistent prefix
        if let Some(slot) = self.find_session(handle).and_then(|s| s.slot) {
            if self.commit.map(|c| c.slot()) == Some(slot) {
                log::warn!("(GBM) link {:#x} dropped with bond commit in flight, commit discarded", handle);

                self.commit = None;
            }
        }

        self.sessions.retain(|s| s.handle != handle);

        self.links.remove(handle)?;

        if self.deferred_erase_all && self.links.active_count() == 0 {
            self.deferred_erase_all = false;

            log::info!("(GBM) running deferred erase of all bonds");

            self.bonds.erase_all()?;

            if self.config.auto_sync_white_list {
                self.sync_white_list(controller)?;
            }

            self.update_privacy_permission()?;
        }

        Ok(())
    }

    fn p_encryption_change<C, L>(
        &mut self,
        handle: ConnectionHandle,
        encrypted: bool,
        key_size: u8,
        controller: &mut C,
        listener: &mut L,
    ) -> Result<(), Status>
    where
        C: ControllerCommands,
        L: BondEventListener,
    {
        let link = self.links.find_mut(handle).ok_or(Status::NotConnected)?;

        if encrypted {
            link.state |= LinkState::ENCRYPTED;

            link.key_size = key_size;
        } else {
            link.state = link.state & !LinkState::ENCRYPTED;
        }

        let (session_state, session_slot) = match self.find_session(handle) {
            Some(session) => (session.state, session.slot),
            None => return Ok(()),
        };

        if encrypted && session_state == PairingState::EncryptionPending {
            if let Some(session) = self.find_session(handle) {
                session.state = PairingState::Encrypted;
            }

            if let Some(slot) = session_slot {
                // the fast path reconnection is fully restored now
                let authenticated = self.bonds_flags_authenticated(slot);

                if let Some(link) = self.links.find_mut(handle) {
                    link.state |= LinkState::BONDED;

                    if authenticated {
                        link.state |= LinkState::AUTHENTICATED;
                    }
                }

                self.load_link_security(handle, slot)?;

                if self.bonds.state_flags(slot)?.contains(BondFlags::SERVICE_CHANGED) {
                    controller.send_service_changed(handle);
                }
            }

            listener.pairing_state_changed(handle, PairingState::Encrypted, Ok(()));
        }

        Ok(())
    }

    fn bonds_flags_authenticated(&mut self, slot: BondSlot) -> bool {
        self.bonds
            .state_flags(slot)
            .map(|f| f.contains(BondFlags::AUTHENTICATED))
            .unwrap_or(false)
    }

    /// Mirror the stored signing material into the link's transient security info
    fn load_link_security(&mut self, handle: ConnectionHandle, slot: BondSlot) -> Result<(), Status> {
        let csrk = self.bonds.csrk(slot)?;

        let counter = self.bonds.sign_counter(slot)?.unwrap_or(0);

        if let (Some(csrk), Some(link)) = (csrk, self.links.find_mut(handle)) {
            link.security = Some(SignInfo {
                csrk,
                sign_counter: counter,
            });
        }

        Ok(())
    }

    fn p_encryption_failed<C, L>(
        &mut self,
        handle: ConnectionHandle,
        key_missing: bool,
        controller: &mut C,
        listener: &mut L,
    ) -> Result<(), Status>
    where
        C: ControllerCommands,
        L: BondEventListener,
    {
        let link = self.links.find_mut(handle).ok_or(Status::NotConnected)?;

        link.state = link.state & !(LinkState::ENCRYPTED | LinkState::BONDED);

        if let Some(session) = self.find_session(handle) {
            session.state = PairingState::Idle;
        }

        listener.pairing_state_changed(
            handle,
            PairingState::Idle,
            Err(PairingFailure::Local(Status::NotEncrypted)),
        );

        if !key_missing {
            return Ok(());
        }

        log::warn!("(GBM) peer on link {:#x} lost its key, applying bond fail action", handle);

        match self.config.bond_fail_action {
            BondFailAction::NoAction => (),

            BondFailAction::Repair => {
                controller.send_pairing_request(handle);

                if let Some(session) = self.find_session(handle) {
                    session.state = PairingState::PairingRequested;
                }
            }

            BondFailAction::TerminateLink => controller.terminate_connection(handle),

            BondFailAction::TerminateLinkAndEraseAllBonds => {
                controller.terminate_connection(handle);

                // the erase runs once the termination completes and this was the last link
                self.deferred_erase_all = true;
            }
        }

        Ok(())
    }

    fn p_pairing_request<C, L>(
        &mut self,
        handle: ConnectionHandle,
        peer_io_capability: IoCapability,
        peer_mitm: bool,
        controller: &mut C,
        listener: &mut L,
    ) -> Result<(), Status>
    where
        C: ControllerCommands,
        L: BondEventListener,
    {
        let peer_address = self
            .links
            .find(handle)
            .map(|l| l.peer_address)
            .ok_or(Status::NotConnected)?;

        self.find_session(handle).ok_or(Status::NotConnected)?;

        let config = self.config;

        if config.auto_fail_pairing {
            if let Some(session) = self.find_session(handle) {
                session.state = PairingState::AutoFail;
            }

            controller.reject_pairing(handle, config.auto_fail_reason);

            listener.pairing_state_changed(
                handle,
                PairingState::AutoFail,
                Err(PairingFailure::Protocol(config.auto_fail_reason)),
            );

            return Ok(());
        }

        if config.pairing_policy == PairingPolicy::NoPairing {
            controller.reject_pairing(handle, PairingFailedReason::PairingNotSupported);

            return Ok(());
        }

        if let Some(session) = self.find_session(handle) {
            session.state = PairingState::KeyExchange;
        }

        controller.accept_pairing(handle);

        listener.pairing_state_changed(handle, PairingState::PairingRequested, Ok(()));

        // a passkey is only involved when both sides can take part in one
        let passkey_needed = (config.mitm_protection || peer_mitm)
            && !config.io_capability.no_io_capability()
            && !peer_io_capability.no_io_capability();

        if passkey_needed {
            if config.passcode_prompt {
                if let Some(session) = self.find_session(handle) {
                    session.awaiting_passcode = true;
                }

                listener.passcode_requested(
                    peer_address,
                    handle,
                    config.io_capability.is_input_capable(),
                    config.io_capability.is_output_capable(),
                );
            } else {
                controller.passkey_reply(handle, config.default_passcode);
            }
        }

        Ok(())
    }

    fn p_authentication_complete<L>(
        &mut self,
        handle: ConnectionHandle,
        result: Result<DistributedKeys, PairingFailedReason>,
        listener: &mut L,
    ) -> Result<(), Status>
    where
        L: BondEventListener,
    {
        self.links.find(handle).ok_or(Status::NotConnected)?;

        let keys = match result {
            Ok(keys) => keys,
            Err(reason) => {
                // a failed re-pairing demotes the link, the flags are no longer true
                let link = self.links.find_mut(handle).ok_or(Status::NotConnected)?;

                link.state = link.state & !(LinkState::ENCRYPTED | LinkState::BONDED);

                if let Some(session) = self.find_session(handle) {
                    session.state = PairingState::Idle;
                }

                listener.pairing_state_changed(handle, PairingState::Idle, Err(PairingFailure::Protocol(reason)));

                return Ok(());
            }
        };

        {
            let link = self.links.find_mut(handle).ok_or(Status::NotConnected)?;

            if keys.authenticated {
                link.state |= LinkState::AUTHENTICATED;
            }

            link.key_size = keys.key_size;

            if let Some((csrk, counter)) = keys.keys.csrk {
                link.security = Some(SignInfo {
                    csrk,
                    sign_counter: counter,
                });
            }
        }

        if let Some(session) = self.find_session(handle) {
            session.state = PairingState::Encrypted;
        }

        listener.pairing_state_changed(handle, PairingState::Encrypted, Ok(()));

        if !(keys.bonding && self.config.bonding_enabled) {
            return Ok(());
        }

        // single in-flight commit invariant, a second bonding pairing cannot start persisting
        // until the first one finished
        if self.commit.is_some() {
            log::error!("(GBM) authentication complete on link {:#x} with a commit already in flight", handle);

            listener.pairing_state_changed(
                handle,
                PairingState::Encrypted,
                Err(PairingFailure::Local(Status::CommandDisallowed)),
            );

            return Err(Status::CommandDisallowed);
        }

        let (peer_address, peer_address_type) = {
            let link = self.links.find(handle).ok_or(Status::NotConnected)?;

            (link.peer_address, link.peer_address_type)
        };

        let identity = match keys.identity {
            Some((_, identity)) => identity,
            None if peer_address_type.is_identity() => peer_address,
            None => {
                log::error!("(GBM) no identity for private peer on link {:#x}, bond not stored", handle);

                listener.pairing_state_changed(
                    handle,
                    PairingState::Encrypted,
                    Err(PairingFailure::Local(Status::InvalidParameter)),
                );

                return Err(Status::InvalidParameter);
            }
        };

        let slot = self.bonds.add_or_update(identity, keys.authenticated)?;

        if !peer_address_type.is_identity() {
            self.bonds.set_reconnection_address(slot, peer_address)?;
        }

        if let Some(session) = self.find_session(handle) {
            session.slot = Some(slot);
        }

        self.commit = Some(BondCommit::new(slot, keys.keys));

        Ok(())
    }

    fn p_ltk_requested<C>(&mut self, handle: ConnectionHandle, div: u16, controller: &mut C) -> Result<(), Status>
    where
        C: ControllerCommands,
    {
        let slot = self.find_session(handle).and_then(|s| s.slot);

        let ltk = match slot {
            Some(slot) => {
                if self.bonds.state_flags(slot)?.contains(BondFlags::COMPLETE) {
                    match self.bonds.local_ltk(slot)? {
                        Some(ltk) if ltk.div == div => Some(ltk.ltk),
                        _ => None,
                    }
                } else {
                    None
                }
            }
            None => None,
        };

        if ltk.is_none() {
            log::warn!("(GBM) no long term key for request on link {:#x}, negative reply", handle);
        }

        controller.long_term_key_reply(handle, ltk);

        Ok(())
    }

    fn p_service_changed_confirmed(&mut self, handle: ConnectionHandle) -> Result<(), Status> {
        let slot = self
            .find_session(handle)
            .and_then(|s| s.slot)
            .ok_or(Status::NotConnected)?;

        // clear-on-acknowledge, the flag stays owed until the peer confirmed receipt
        self.bonds.set_service_changed(slot, false)
    }

    fn erase_all_bonds<C>(&mut self, controller: &mut C) -> Result<(), Status>
    where
        C: ControllerCommands,
    {
        if self.links.active_count() > 0 {
            if self.deferred_erase_all {
                return Err(Status::AlreadyInRequestedMode);
            }

            // deferred until the last disconnect
            self.deferred_erase_all = true;

            log::warn!("(GBM) erase of all bonds deferred, {} connection(s) active", self.links.active_count());

            return Err(Status::CommandDisallowed);
        }

        self.bonds.erase_all()?;

        if self.config.auto_sync_white_list {
            self.sync_white_list(controller)?;
        }

        self.update_privacy_permission()?;

        Ok(())
    }

    fn erase_bond<C>(
        &mut self,
        address_type: AddressType,
        address: BluetoothDeviceAddress,
        controller: &mut C,
    ) -> Result<(), Status>
    where
        C: ControllerCommands,
    {
        let (slot, _) = self
            .bonds
            .resolve_address(address_type, address)?
            .ok_or(Status::InvalidParameter)?;

        // an in-flight commit into this slot would resurrect stale parts, cancel it first
        if self.commit.map(|c| c.slot()) == Some(slot) {
            self.commit = None;
        }

        for session in self.sessions.iter_mut().filter(|s| s.slot == Some(slot)) {
            session.slot = None;
        }

        self.bonds.erase_one(slot)?;

        if self.config.auto_sync_white_list {
            self.sync_white_list(controller)?;
        }

        self.update_privacy_permission()?;

        Ok(())
    }

    /// Rebuild the controller white list from the bond table
    fn sync_white_list<C>(&mut self, controller: &mut C) -> Result<(), Status>
    where
        C: ControllerCommands,
    {
        controller.clear_white_list();

        for i in 0..self.bonds.capacity() {
            let slot = BondSlot(i);

            if let Some(core) = self.bonds.core(slot)? {
                let address_type = if core.peer_address.is_static_random() {
                    AddressType::StaticRandom
                } else {
                    AddressType::Public
                };

                controller.add_to_white_list(address_type, core.peer_address);
            }
        }

        Ok(())
    }

    fn update_privacy_permission(&mut self) -> Result<(), Status> {
        let writable = self.bonds.count_present()? <= 1;

        if writable != self.privacy_flag_writable {
            self.privacy_flag_writable = writable;

            log::info!(
                "(GBM) privacy flag is now {}",
                if writable { "writable" } else { "read only" }
            );
        }

        Ok(())
    }

    fn find_session(&mut self, handle: ConnectionHandle) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.handle == handle)
    }

    fn find_session_by_slot(&mut self, slot: BondSlot) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.slot == Some(slot))
    }
}
