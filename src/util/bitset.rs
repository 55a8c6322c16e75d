use std::collections::btree_map;
use std::collections::BTreeMap;

const WORD_BITS: usize = 64;

/// A sparse bit vector: only non-zero 64-bit words are stored, keyed by
/// word index. Iteration is in ascending order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SparseBitSet {
    words: BTreeMap<usize, u64>,
}

impl SparseBitSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the bit was not set before.
    pub fn insert(&mut self, index: usize) -> bool {
        let (word, mask) = split(index);
        let bits = self.words.entry(word).or_insert(0);
        let changed = *bits & mask == 0;
        *bits |= mask;
        changed
    }

    pub fn remove(&mut self, index: usize) -> bool {
        let (word, mask) = split(index);
        match self.words.get_mut(&word) {
            Some(bits) if *bits & mask != 0 => {
                *bits &= !mask;
                if *bits == 0 {
                    self.words.remove(&word);
                }
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        let (word, mask) = split(index);
        self.words.get(&word).map_or(false, |bits| bits & mask != 0)
    }

    pub fn len(&self) -> usize {
        self.words.values().map(|bits| bits.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn clear(&mut self) {
        self.words.clear();
    }

    /// `self |= other`; returns `true` if any bit was added.
    pub fn union_with(&mut self, other: &SparseBitSet) -> bool {
        let mut changed = false;
        for (&word, &bits) in &other.words {
            let entry = self.words.entry(word).or_insert(0);
            let merged = *entry | bits;
            if merged != *entry {
                *entry = merged;
                changed = true;
            }
        }
        changed
    }

    /// `self &= other`; returns `true` if any bit was dropped.
    pub fn intersect_with(&mut self, other: &SparseBitSet) -> bool {
        let mut changed = false;
        self.words.retain(|word, bits| {
            let kept = *bits & other.words.get(word).copied().unwrap_or(0);
            if kept != *bits {
                changed = true;
            }
            *bits = kept;
            kept != 0
        });
        changed
    }

    /// `self -= other`; returns `true` if any bit was dropped.
    pub fn subtract(&mut self, other: &SparseBitSet) -> bool {
        let mut changed = false;
        self.words.retain(|word, bits| {
            let kept = *bits & !other.words.get(word).copied().unwrap_or(0);
            if kept != *bits {
                changed = true;
            }
            *bits = kept;
            kept != 0
        });
        changed
    }

    pub fn intersects(&self, other: &SparseBitSet) -> bool {
        self.words
            .iter()
            .any(|(word, bits)| other.words.get(word).map_or(false, |o| o & bits != 0))
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            words: self.words.iter(),
            base: 0,
            current: 0,
        }
    }
}

fn split(index: usize) -> (usize, u64) {
    (index / WORD_BITS, 1u64 << (index % WORD_BITS))
}

pub struct Iter<'a> {
    words: btree_map::Iter<'a, usize, u64>,
    base: usize,
    current: u64,
}

impl Iterator for Iter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        while self.current == 0 {
            let (&word, &bits) = self.words.next()?;
            self.base = word * WORD_BITS;
            self.current = bits;
        }
        let bit = self.current.trailing_zeros() as usize;
        self.current &= self.current - 1;
        Some(self.base + bit)
    }
}

impl<'a> IntoIterator for &'a SparseBitSet {
    type Item = usize;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

impl FromIterator<usize> for SparseBitSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = SparseBitSet::new();
        set.extend(iter);
        set
    }
}

impl Extend<usize> for SparseBitSet {
    fn extend<I: IntoIterator<Item = usize>>(&mut self, iter: I) {
        for index in iter {
            self.insert(index);
        }
    }
}
