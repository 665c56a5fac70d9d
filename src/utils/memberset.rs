//! Member set data structure helper.

use std::fmt;

use crate::member::MemberId;

use fixedbitset::FixedBitSet;

/// Compact, growable set of member IDs backed by a bitset. Member ID 0 is
/// never a valid member and is ignored by all mutators.
#[derive(Clone, Default)]
pub struct MemberSet(FixedBitSet);

impl MemberSet {
    /// Creates a new empty member set.
    pub fn new() -> Self {
        MemberSet(FixedBitSet::new())
    }

    /// Creates a new member set from a list of IDs.
    pub fn from_ids(ids: impl IntoIterator<Item = MemberId>) -> Self {
        let mut set = Self::new();
        for id in ids {
            set.insert(id);
        }
        set
    }

    /// Adds a member ID. Returns true if it was not present before.
    #[inline]
    pub fn insert(&mut self, id: MemberId) -> bool {
        if id == 0 {
            return false;
        }
        let idx = id as usize;
        if idx >= self.0.len() {
            self.0.grow(idx + 1);
        }
        !self.0.put(idx)
    }

    /// Removes a member ID. Returns true if it was present.
    #[inline]
    pub fn remove(&mut self, id: MemberId) -> bool {
        let idx = id as usize;
        if idx >= self.0.len() || !self.0[idx] {
            return false;
        }
        self.0.set(idx, false);
        true
    }

    /// Checks if the member ID is in the set.
    #[inline]
    pub fn contains(&self, id: MemberId) -> bool {
        self.0.contains(id as usize)
    }

    /// Checks if every member of `other` is also in this set.
    pub fn contains_all(&self, other: &MemberSet) -> bool {
        other.iter().all(|id| self.contains(id))
    }

    /// Returns the number of members in the set.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.count_ones(..)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_clear()
    }

    /// Removes all members.
    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Adds every member of `other` into this set.
    pub fn extend_from(&mut self, other: &MemberSet) {
        for id in other.iter() {
            self.insert(id);
        }
    }

    /// Iterates member IDs in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = MemberId> + '_ {
        self.0.ones().map(|idx| idx as MemberId)
    }

    /// Collects member IDs in ascending order into a vec.
    pub fn ids(&self) -> Vec<MemberId> {
        self.iter().collect()
    }
}

// Equality is on membership only; the backing bitset may have grown to
// different lengths.
impl PartialEq for MemberSet {
    fn eq(&self, other: &Self) -> bool {
        self.0.ones().eq(other.0.ones())
    }
}

impl Eq for MemberSet {}

impl FromIterator<MemberId> for MemberSet {
    fn from_iter<I: IntoIterator<Item = MemberId>>(iter: I) -> Self {
        Self::from_ids(iter)
    }
}

// Implement `Debug` trait manually for better trace printing.
impl fmt::Debug for MemberSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{{}; [", self.len())?;
        let mut first_idx = true;
        for id in self.iter() {
            if !first_idx {
                write!(f, ", {}", id)?;
            } else {
                write!(f, "{}", id)?;
                first_idx = false;
            }
        }
        write!(f, "]}}")
    }
}

#[cfg(test)]
mod memberset_tests {
    use super::*;

    #[test]
    fn memberset_insert_remove() {
        let mut set = MemberSet::new();
        assert!(set.is_empty());
        assert!(set.insert(3));
        assert!(!set.insert(3));
        assert!(set.insert(70));
        assert!(!set.insert(0));
        assert_eq!(set.len(), 2);
        assert!(set.contains(3));
        assert!(set.contains(70));
        assert!(!set.contains(4));
        assert!(!set.contains(1000));
        assert!(set.remove(3));
        assert!(!set.remove(3));
        assert!(!set.remove(999));
        assert_eq!(set.ids(), vec![70]);
    }

    #[test]
    fn memberset_contains_all() {
        let big = MemberSet::from_ids([1, 2, 5, 9]);
        let small = MemberSet::from_ids([2, 9]);
        assert!(big.contains_all(&small));
        assert!(!small.contains_all(&big));
        assert!(small.contains_all(&MemberSet::new()));
    }

    #[test]
    fn memberset_equality_ignores_capacity() {
        let mut a = MemberSet::from_ids([2, 100]);
        a.remove(100);
        let b = MemberSet::from_ids([2]);
        assert_eq!(a, b);
        assert_ne!(a, MemberSet::new());
    }

    #[test]
    fn memberset_debug() {
        let set = MemberSet::from_ids([4, 1, 7]);
        assert_eq!(format!("{:?}", set), "{3; [1, 4, 7]}");
    }
}
