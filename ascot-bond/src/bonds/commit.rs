//! Multi-step bond persistence
//!
//! Key distribution delivers each key of a pairing as its own message, so a new bond is persisted
//! one record at a time rather than in a single write. [`BondCommit`] holds the keys still to be
//! written and walks them in a fixed order, one flash write per [`advance`](BondCommit::advance)
//! call. After an interruption (disconnect, erase, flash failure) the writes done so far always
//! form a consistent prefix of that order, with the core record present from the start.
//!
//! Only one commit may be in flight at a time; enforcing that is up to the owner of the commit.

use super::{BondSlot, BondStore, LtkRecord};
use crate::Status;
use embedded_storage::nor_flash::NorFlash;

/// The next part the commit will persist
///
/// The order is the order the key distribution messages arrive in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommitState {
    LocalLtk,
    PeerLtk,
    Irk,
    Csrk,
    Complete,
}

/// The keys a pairing produced, as delivered by its key distribution
///
/// A `None` means the key type was not exchanged in this pairing and its record stays at the
/// empty marker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PendingKeys {
    pub local_ltk: Option<LtkRecord>,
    pub peer_ltk: Option<LtkRecord>,
    pub irk: Option<u128>,
    /// The peer's signing key together with its initial sign counter
    pub csrk: Option<(u128, u32)>,
}

/// The result of one [`advance`](BondCommit::advance) step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitProgress {
    /// A part was written, call again
    Continue,
    /// Every exchanged key is persisted and the bond is marked complete
    Done,
}

/// An in-flight persistence of one bond
///
/// Created after the bond's core record was claimed through
/// [`add_or_update`](BondStore::add_or_update).
#[derive(Debug, Clone, Copy)]
pub struct BondCommit {
    slot: BondSlot,
    state: CommitState,
    keys: PendingKeys,
}

impl BondCommit {
    pub fn new(slot: BondSlot, keys: PendingKeys) -> Self {
        BondCommit {
            slot,
            state: CommitState::LocalLtk,
            keys,
        }
    }

    /// The slot this commit is writing into
    pub fn slot(&self) -> BondSlot {
        self.slot
    }

    /// Persist the next exchanged key, or finish the commit
    ///
    /// Exactly one record is written per call. A write failure aborts the commit permanently,
    /// leaving the parts written so far on flash and the completeness flag clear.
    pub fn advance<F: NorFlash>(&mut self, store: &mut BondStore<F>) -> Result<CommitProgress, Status> {
        loop {
            match self.state {
                CommitState::LocalLtk => {
                    self.state = CommitState::PeerLtk;

                    if let Some(ltk) = self.keys.local_ltk {
                        store.write_local_ltk(self.slot, &ltk)?;

                        return Ok(CommitProgress::Continue);
                    }
                }

                CommitState::PeerLtk => {
                    self.state = CommitState::Irk;

                    if let Some(ltk) = self.keys.peer_ltk {
                        store.write_peer_ltk(self.slot, &ltk)?;

                        return Ok(CommitProgress::Continue);
                    }
                }

                CommitState::Irk => {
                    self.state = CommitState::Csrk;

                    if let Some(irk) = self.keys.irk {
                        store.write_irk(self.slot, irk)?;

                        return Ok(CommitProgress::Continue);
                    }
                }

                CommitState::Csrk => {
                    self.state = CommitState::Complete;

                    if let Some((csrk, counter)) = self.keys.csrk {
                        store.write_csrk(self.slot, csrk)?;

                        store.write_sign_counter(self.slot, counter)?;

                        return Ok(CommitProgress::Continue);
                    }
                }

                CommitState::Complete => {
                    store.mark_complete(self.slot)?;

                    log::info!("(GBM) bond slot {} commit complete", self.slot.0);

                    return Ok(CommitProgress::Done);
                }
            }
        }
    }
}
