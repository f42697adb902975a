//! Last-writer-wins registers.

use serde::{Deserialize, Serialize};

use crate::clock::Stamp;

/// A single-valued field resolved by last-writer-wins on its [`Stamp`].
///
/// Merging is commutative, associative and idempotent: the write with the
/// greatest stamp wins regardless of the order writes are observed in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LwwRegister<T> {
    value: T,
    stamp: Option<Stamp>,
}

impl<T: Clone> LwwRegister<T> {
    /// A register holding `initial` that any stamped write overrides.
    pub fn new(initial: T) -> Self {
        Self {
            value: initial,
            stamp: None,
        }
    }

    /// Apply a write. Returns `true` if it became the winning value.
    pub fn set(&mut self, value: T, stamp: Stamp) -> bool {
        let wins = match &self.stamp {
            None => true,
            Some(current) => stamp > *current,
        };
        if wins {
            self.value = value;
            self.stamp = Some(stamp);
        }
        wins
    }

    /// Merge another replica of the same register.
    pub fn merge(&mut self, other: &LwwRegister<T>) -> bool {
        match &other.stamp {
            Some(stamp) => self.set(other.value.clone(), stamp.clone()),
            None => false,
        }
    }

    /// The winning value.
    pub fn get(&self) -> &T {
        &self.value
    }

    /// The winning stamp, if the register was ever written.
    pub fn stamp(&self) -> Option<&Stamp> {
        self.stamp.as_ref()
    }
}

impl<T: Clone + Default> Default for LwwRegister<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
