//! Bounded ring of in-flight request slots
//!
//! Each session multiplexes up to `capacity` requests. A slot is either free,
//! bound to a prepared buffer (keyed by the first input fd), carrying a
//! request in flight, or cancelled (its caller gave up after a timeout).
//!
//! ```text
//!            allocate()           bind(fd)
//!   Free ───────────────▶ InFlight    Free ─────────▶ Bound{fd}
//!    ▲                       │                          │  ▲
//!    │  complete()           │ cancel()        occupy() │  │ complete()
//!    └───────────────────────┤                          ▼  │
//!    ▲                       ▼                       InFlight{bound}
//!    └────── complete() ── Cancelled
//! ```

use crate::error::{AccelError, Result};
use std::os::unix::io::RawFd;

/// State of one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Available
    Free,
    /// Prepared buffers, idle
    Bound {
        /// Correlation fd recorded at prepare
        key: RawFd,
    },
    /// A request is queued on the hardware
    InFlight {
        /// Frame id of the request
        frame_id: u32,
        /// Correlation fd if the slot was prepared
        bound: Option<RawFd>,
    },
    /// The request's caller timed out; completion only frees the slot
    Cancelled {
        /// Correlation fd if the slot was prepared
        bound: Option<RawFd>,
    },
}

/// What completing a slot released
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
    /// A live request finished
    Request {
        /// Its frame id
        frame_id: u32,
    },
    /// The request had been cancelled
    Deleted,
    /// Nothing occupied the slot
    Empty,
}

/// Fixed-capacity slot ring
#[derive(Debug, Clone)]
pub struct RequestSlotRing {
    slots: Vec<SlotState>,
    cursor: usize,
}

impl RequestSlotRing {
    /// Create a ring with `capacity` free slots
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![SlotState::Free; capacity],
            cursor: 0,
        }
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slot state
    pub fn state(&self, slot: usize) -> Option<SlotState> {
        self.slots.get(slot).copied()
    }

    fn find_free(&self) -> Result<usize> {
        let cap = self.slots.len();
        (0..cap)
            .map(|step| (self.cursor + step) % cap)
            .find(|&i| self.slots[i] == SlotState::Free)
            .ok_or(AccelError::BufferFull { capacity: cap })
    }

    /// Claim a free slot for a request, scanning from the last used index
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::BufferFull`] when every slot is taken.
    pub fn allocate(&mut self, frame_id: u32) -> Result<usize> {
        let slot = self.find_free()?;
        self.slots[slot] = SlotState::InFlight {
            frame_id,
            bound: None,
        };
        self.cursor = (slot + 1) % self.slots.len();
        Ok(slot)
    }

    /// Reserve a free slot for prepared buffers keyed by `key`
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::BufferFull`] when every slot is taken.
    pub fn bind(&mut self, key: RawFd) -> Result<usize> {
        let slot = self.find_free()?;
        self.slots[slot] = SlotState::Bound { key };
        self.cursor = (slot + 1) % self.slots.len();
        Ok(slot)
    }

    /// Slot bound to `key`
    pub fn resolve(&self, key: RawFd) -> Option<usize> {
        self.slots.iter().position(|s| match *s {
            SlotState::Bound { key: k } => k == key,
            SlotState::InFlight { bound, .. } | SlotState::Cancelled { bound } => {
                bound == Some(key)
            }
            SlotState::Free => false,
        })
    }

    /// Start a request on a bound slot
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::BufferFull`] if the slot already carries a
    /// request, or invalid state if it is not bound.
    pub fn occupy(&mut self, slot: usize, frame_id: u32) -> Result<()> {
        let capacity = self.slots.len();
        match self.slots.get(slot).copied() {
            Some(SlotState::Bound { key }) => {
                self.slots[slot] = SlotState::InFlight {
                    frame_id,
                    bound: Some(key),
                };
                Ok(())
            }
            Some(SlotState::InFlight { .. } | SlotState::Cancelled { .. }) => {
                Err(AccelError::BufferFull { capacity })
            }
            _ => Err(AccelError::invalid_state(format!("slot {slot} is not bound"))),
        }
    }

    /// Mark the request in `slot` as abandoned by its caller
    pub fn cancel(&mut self, slot: usize) {
        if let Some(SlotState::InFlight { bound, .. }) = self.slots.get(slot).copied() {
            self.slots[slot] = SlotState::Cancelled { bound };
        }
    }

    /// Release whatever occupies `slot`; a prepared slot returns to bound
    pub fn complete(&mut self, slot: usize) -> Released {
        let Some(state) = self.slots.get(slot).copied() else {
            return Released::Empty;
        };
        let (released, bound) = match state {
            SlotState::InFlight { frame_id, bound } => (Released::Request { frame_id }, bound),
            SlotState::Cancelled { bound } => (Released::Deleted, bound),
            SlotState::Bound { .. } | SlotState::Free => return Released::Empty,
        };
        self.slots[slot] = match bound {
            Some(key) => SlotState::Bound { key },
            None => SlotState::Free,
        };
        released
    }

    /// Set `slot` back to free, dropping any binding
    pub fn release(&mut self, slot: usize) {
        if let Some(s) = self.slots.get_mut(slot) {
            *s = SlotState::Free;
        }
    }

    /// Free every slot, prepared or not
    pub fn clear(&mut self) {
        self.slots.fill(SlotState::Free);
        self.cursor = 0;
    }

    /// Slots not free
    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| **s != SlotState::Free).count()
    }
}
