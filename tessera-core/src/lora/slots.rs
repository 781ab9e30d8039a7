use std::fmt;

use crate::LoraError;

/// Number of adapters the pipeline can hold at once.
pub const SLOT_COUNT: usize = 26;

/// The name of an adapter slot, `a` through `z`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AdapterName(u8);

impl AdapterName {
    pub fn index(&self) -> usize {
        self.0 as usize
    }

    pub fn as_char(&self) -> char {
        (b'a' + self.0) as char
    }
}

impl fmt::Display for AdapterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Hands out slot names in order for one load pass.
#[derive(Debug, Default)]
pub struct SlotPool {
    next: usize,
}

impl SlotPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails before anything is fetched if `requested` can never fit.
    pub fn check_capacity(requested: usize) -> Result<(), LoraError> {
        if requested > SLOT_COUNT {
            return Err(LoraError::SlotsExhausted {
                requested,
                available: SLOT_COUNT,
            });
        }
        Ok(())
    }

    pub fn assign(&mut self) -> Result<AdapterName, LoraError> {
        if self.next >= SLOT_COUNT {
            return Err(LoraError::SlotsExhausted {
                requested: self.next + 1,
                available: SLOT_COUNT,
            });
        }
        let name = AdapterName(self.next as u8);
        self.next += 1;
        Ok(name)
    }

    pub fn assigned(&self) -> usize {
        self.next
    }
}
