use std::{collections::HashMap, hash::Hash};

/// Union-find over arbitrary keys, stored as an index arena.
///
/// Path halving plus union by size keeps operations near-constant. Each root
/// also tracks the smallest key of its class, so the representative does
/// not depend on the order in which unions happen.
#[derive(Clone, Debug)]
pub struct EquivalenceSet<K> {
    index: HashMap<K, usize>,
    keys: Vec<K>,
    parent: Vec<usize>,
    size: Vec<u32>,
    least: Vec<usize>,
}

impl<K: Clone + Eq + Hash + Ord> Default for EquivalenceSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone + Eq + Hash + Ord> EquivalenceSet<K> {
    pub fn new() -> Self {
        Self {
            index: HashMap::new(),
            keys: Vec::new(),
            parent: Vec::new(),
            size: Vec::new(),
            least: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Adds `key` as a singleton class if it is new. Returns its slot.
    pub fn insert(&mut self, key: K) -> usize {
        if let Some(&slot) = self.index.get(&key) {
            return slot;
        }
        let slot = self.keys.len();
        self.index.insert(key.clone(), slot);
        self.keys.push(key);
        self.parent.push(slot);
        self.size.push(1);
        self.least.push(slot);
        slot
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn root(&self, mut x: usize) -> usize {
        while self.parent[x] != x {
            x = self.parent[x];
        }
        x
    }

    /// Declares `a` and `b` equivalent, inserting either if unseen.
    /// Returns `true` if two classes were merged.
    pub fn union(&mut self, a: K, b: K) -> bool {
        let a = self.insert(a);
        let b = self.insert(b);
        let mut a = self.find(a);
        let mut b = self.find(b);
        if a == b {
            return false;
        }
        if self.size[a] < self.size[b] {
            core::mem::swap(&mut a, &mut b);
        }
        self.parent[b] = a;
        self.size[a] += self.size[b];
        if self.keys[self.least[b]] < self.keys[self.least[a]] {
            self.least[a] = self.least[b];
        }
        true
    }

    /// Smallest key in the class of `key`.
    pub fn representative(&self, key: &K) -> Option<&K> {
        let slot = *self.index.get(key)?;
        Some(&self.keys[self.least[self.root(slot)]])
    }

    pub fn same_class(&self, a: &K, b: &K) -> bool {
        match (self.index.get(a), self.index.get(b)) {
            (Some(&a), Some(&b)) => self.root(a) == self.root(b),
            _ => a == b,
        }
    }

    /// Compresses every path. Later lookups then take one step.
    pub fn flatten(&mut self) {
        for x in 0..self.parent.len() {
            let root = self.find(x);
            self.parent[x] = root;
        }
    }

    /// Every key paired with its representative, sorted by key.
    pub fn assignments(&self) -> Vec<(K, K)> {
        let mut out: Vec<_> = self
            .keys
            .iter()
            .enumerate()
            .map(|(slot, key)| (key.clone(), self.keys[self.least[self.root(slot)]].clone()))
            .collect();
        out.sort();
        out
    }

    /// Classes as `(representative, sorted members)`, sorted by representative.
    pub fn classes(&self) -> Vec<(K, Vec<K>)> {
        let mut grouped: HashMap<usize, Vec<K>> = HashMap::new();
        for (slot, key) in self.keys.iter().enumerate() {
            grouped.entry(self.root(slot)).or_default().push(key.clone());
        }
        let mut out: Vec<_> = grouped
            .into_iter()
            .map(|(root, mut members)| {
                members.sort();
                (self.keys[self.least[root]].clone(), members)
            })
            .collect();
        out.sort();
        out
    }

    pub fn class_count(&self) -> usize {
        (0..self.parent.len()).filter(|&x| self.parent[x] == x).count()
    }
}
