//! Per-process logical variable store.
//!
//! Every process owns a fixed table of 32 variable slots. Slot `i` is
//! addressed by the 5-digit uppercase hex string of `2 * i` (each variable
//! is conceptually two bytes wide), so the addresses read `00000`,
//! `00002`, `00004`, … Insertion always takes the lowest free slot;
//! lookups are linear. Values are unsigned 16-bit and wrap on arithmetic
//! overflow (the executor computes with wrapping operations).

/// Number of variable slots in every logical store.
pub const STORE_SLOTS: usize = 32;

/// Outcome of declaring a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclareOutcome {
    /// The name was inserted into the lowest free slot.
    Inserted,
    /// The name already exists; the store is unchanged.
    AlreadyPresent,
    /// Every slot is occupied; the store is unchanged.
    Full,
}

/// Fixed-capacity ordered variable table.
#[derive(Debug, Clone)]
pub struct LogicalStore {
    slots: Vec<Option<(String, u16)>>,
}

impl LogicalStore {
    /// Create an empty store with all [`STORE_SLOTS`] slots free.
    pub fn new() -> Self {
        Self {
            slots: vec![None; STORE_SLOTS],
        }
    }

    /// Declare `name` with value zero in the lowest free slot.
    pub fn declare(&mut self, name: &str) -> DeclareOutcome {
        if self.position_of(name).is_some() {
            return DeclareOutcome::AlreadyPresent;
        }

        match self.slots.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some((name.to_string(), 0));
                DeclareOutcome::Inserted
            }
            None => DeclareOutcome::Full,
        }
    }

    /// Declare `name` and, if it was inserted, set its initial value.
    /// An already-present name keeps its current value.
    pub fn insert_with_value(&mut self, name: &str, value: u16) -> DeclareOutcome {
        let outcome = self.declare(name);
        if outcome == DeclareOutcome::Inserted {
            self.set_value(name, value);
        }
        outcome
    }

    /// The slot address of `name` as a 5-digit hex string.
    pub fn address_of(&self, name: &str) -> Option<String> {
        self.position_of(name).map(|i| format!("{:05X}", i * 2))
    }

    /// Current value of `name`.
    pub fn value_of(&self, name: &str) -> Option<u16> {
        self.slots
            .iter()
            .flatten()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }

    /// Overwrite the value of an existing variable. Fails if `name` was
    /// never declared.
    pub fn set_value(&mut self, name: &str, value: u16) -> bool {
        for slot in self.slots.iter_mut().flatten() {
            if slot.0 == name {
                slot.1 = value;
                return true;
            }
        }
        false
    }

    /// Whether every slot is occupied.
    pub fn is_full(&self) -> bool {
        self.slots.iter().all(|slot| slot.is_some())
    }

    fn position_of(&self, name: &str) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| matches!(slot, Some((n, _)) if n == name))
    }
}

impl Default for LogicalStore {
    fn default() -> Self {
        Self::new()
    }
}
