//! Per-variable logical time.
//!
//! A vector clock maps [`VarUuid`] to a non-negative counter, defaulting
//! to zero for unseen keys. Two representations are carried through the
//! system: [`VectorClock`], the frozen form that travels inside ballots
//! and outcomes (cheap to clone, serialisable), and [`VectorClockMut`],
//! the working form the reducers and frames mutate. The local-variable
//! element of a clock is the strictly increasing frame number for that
//! variable.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::ids::VarUuid;

/// Frozen vector clock.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    #[serde(with = "arc_map")]
    elems: Arc<BTreeMap<VarUuid, u64>>,
}

impl VectorClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lookup-at-key, defaulting to zero.
    #[must_use]
    pub fn at(&self, var: &VarUuid) -> u64 {
        self.elems.get(var).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.elems.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&VarUuid, u64)> {
        self.elems.iter().map(|(var, elem)| (var, *elem))
    }

    /// Thaw into the working form.
    #[must_use]
    pub fn to_mut(&self) -> VectorClockMut {
        VectorClockMut {
            elems: (*self.elems).clone(),
        }
    }
}

impl FromIterator<(VarUuid, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (VarUuid, u64)>>(iter: I) -> Self {
        Self {
            elems: Arc::new(iter.into_iter().filter(|(_, elem)| *elem != 0).collect()),
        }
    }
}

/// Mutable working form of a vector clock.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VectorClockMut {
    elems: BTreeMap<VarUuid, u64>,
}

impl VectorClockMut {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn at(&self, var: &VarUuid) -> u64 {
        self.elems.get(var).copied().unwrap_or(0)
    }

    /// Raise the slot to `elem` if that is higher. Returns whether the
    /// clock changed.
    pub fn set_max(&mut self, var: VarUuid, elem: u64) -> bool {
        if elem == 0 {
            return false;
        }
        let slot = self.elems.entry(var).or_insert(0);
        if elem > *slot {
            *slot = elem;
            true
        } else {
            false
        }
    }

    /// Add `n` to the slot.
    pub fn bump(&mut self, var: VarUuid, n: u64) {
        *self.elems.entry(var).or_insert(0) += n;
    }

    /// Pairwise max-merge of `other` into `self`.
    pub fn merge_max(&mut self, other: &VectorClock) {
        for (var, elem) in other.iter() {
            self.set_max(*var, elem);
        }
    }

    pub fn delete(&mut self, var: &VarUuid) {
        self.elems.remove(var);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.elems.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    #[must_use]
    pub fn freeze(self) -> VectorClock {
        VectorClock {
            elems: Arc::new(self.elems),
        }
    }
}

impl FromIterator<(VarUuid, u64)> for VectorClockMut {
    fn from_iter<I: IntoIterator<Item = (VarUuid, u64)>>(iter: I) -> Self {
        Self {
            elems: iter.into_iter().filter(|(_, elem)| *elem != 0).collect(),
        }
    }
}

/// Serde helper: serialise the `Arc`-backed map as a plain map.
mod arc_map {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::ids::VarUuid;

    pub fn serialize<S: Serializer>(
        value: &Arc<BTreeMap<VarUuid, u64>>,
        ser: S,
    ) -> Result<S::Ok, S::Error> {
        value.as_ref().serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        de: D,
    ) -> Result<Arc<BTreeMap<VarUuid, u64>>, D::Error> {
        BTreeMap::deserialize(de).map(Arc::new)
    }
}
