//! Test doubles
//!
//! [`MemFlash`] is an in-memory NOR flash with the fault hooks the persistence tests need: a
//! write budget for simulating power loss, a one-shot bit corrupter and a silently failing erase.

use alloc::vec;
use alloc::vec::Vec;
use embedded_storage::nor_flash::{ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash};

#[derive(Debug)]
pub(crate) struct MemFlashError;

impl NorFlashError for MemFlashError {
    fn kind(&self) -> NorFlashErrorKind {
        NorFlashErrorKind::Other
    }
}

/// An in-memory NOR flash
///
/// Writes have NOR semantics, a bit can only be cleared by a write and only an erase sets it
/// back. The fault hooks default to off.
pub(crate) struct MemFlash {
    mem: Vec<u8>,
    /// Remaining writes and erases to apply; once zero every further one is silently dropped
    pub write_budget: Option<u32>,
    /// Corrupt the data of the next write (one shot)
    pub corrupt_next_write: bool,
    /// Report success for erases without erasing anything
    pub erase_noop: bool,
}

impl MemFlash {
    pub fn new(capacity: usize) -> Self {
        assert_eq!(capacity % Self::ERASE_SIZE, 0);

        MemFlash {
            mem: vec![0xFF; capacity],
            write_budget: None,
            corrupt_next_write: false,
            erase_noop: false,
        }
    }

    fn spend_budget(&mut self) -> bool {
        match self.write_budget {
            None => true,
            Some(0) => false,
            Some(ref mut n) => {
                *n -= 1;
                true
            }
        }
    }
}

impl ErrorType for MemFlash {
    type Error = MemFlashError;
}

impl ReadNorFlash for MemFlash {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let offset = offset as usize;

        if offset + bytes.len() > self.mem.len() {
            return Err(MemFlashError);
        }

        bytes.copy_from_slice(&self.mem[offset..offset + bytes.len()]);

        Ok(())
    }

    fn capacity(&self) -> usize {
        self.mem.len()
    }
}

impl NorFlash for MemFlash {
    const WRITE_SIZE: usize = 4;

    const ERASE_SIZE: usize = 1024;

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let offset = offset as usize;

        if offset % Self::WRITE_SIZE != 0
            || bytes.len() % Self::WRITE_SIZE != 0
            || offset + bytes.len() > self.mem.len()
        {
            return Err(MemFlashError);
        }

        if !self.spend_budget() {
            return Ok(());
        }

        for (i, byte) in bytes.iter().enumerate() {
            let mut byte = *byte;

            if self.corrupt_next_write && i == 0 {
                byte ^= 0x55;
            }

            self.mem[offset + i] &= byte;
        }

        self.corrupt_next_write = false;

        Ok(())
    }

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        let (from, to) = (from as usize, to as usize);

        if from % Self::ERASE_SIZE != 0 || to % Self::ERASE_SIZE != 0 || from > to || to > self.mem.len() {
            return Err(MemFlashError);
        }

        if self.erase_noop || !self.spend_budget() {
            return Ok(());
        }

        self.mem[from..to].fill(0xFF);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_have_nor_semantics() {
        let mut flash = MemFlash::new(1024);

        flash.write(0, &[0xF0, 0xFF, 0x0F, 0xFF]).unwrap();
        flash.write(0, &[0x0F, 0xFF, 0xF0, 0xFF]).unwrap();

        let mut buf = [0u8; 4];

        flash.read(0, &mut buf).unwrap();

        assert_eq!(buf, [0x00, 0xFF, 0x00, 0xFF]);

        flash.erase(0, 1024).unwrap();

        flash.read(0, &mut buf).unwrap();

        assert_eq!(buf, [0xFF; 4]);
    }

    #[test]
    fn unaligned_write_is_rejected() {
        let mut flash = MemFlash::new(1024);

        assert!(flash.write(2, &[0; 4]).is_err());
        assert!(flash.write(0, &[0; 3]).is_err());
    }
}
