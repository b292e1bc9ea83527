use crate::{
    BoundaryContact, ChunkId, ContactRule, EquivalenceSet, Face, FinalResult, GlobalLabel,
    PartialResult, Result, detect_contacts,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Whether contacts merge labels at all.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum StitchMode {
    #[default]
    Merge,
    /// Every local label stays its own object; only ids are made global.
    Disabled,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct StitchOptions {
    pub mode: StitchMode,
    pub rule: ContactRule,
    /// Contacts smaller than this are recorded but never merge.
    pub min_contact_voxels: u64,
    pub background: u64,
    /// Global ids start at `label_offset + 1`.
    pub label_offset: u64,
}

impl Default for StitchOptions {
    fn default() -> Self {
        Self {
            mode: StitchMode::Merge,
            rule: ContactRule::FaceAdjacency,
            min_contact_voxels: 1,
            background: 0,
            label_offset: 0,
        }
    }
}

/// Merges per-chunk labels into global objects.
///
/// Owned by one run and fed from a single task. The outcome depends only on
/// the set of partials and contacts added, never on their order: duplicate
/// contacts keep the largest voxel count, and class representatives are the
/// least [`GlobalLabel`] of the class.
#[derive(Debug)]
pub struct Stitcher {
    options: StitchOptions,
    set: EquivalenceSet<GlobalLabel>,
    /// Labels seen in some chunk core.
    observed: BTreeSet<GlobalLabel>,
    contacts: HashMap<(GlobalLabel, GlobalLabel), u64>,
}

impl Stitcher {
    pub fn new(options: StitchOptions) -> Self {
        Self {
            options,
            set: EquivalenceSet::new(),
            observed: BTreeSet::new(),
            contacts: HashMap::new(),
        }
    }

    pub const fn options(&self) -> &StitchOptions {
        &self.options
    }

    /// Registers every core label of `partial` as a singleton object.
    pub fn add_partial(&mut self, partial: &PartialResult) {
        for label in partial.labels.keys() {
            if *label == self.options.background {
                continue;
            }
            let key = GlobalLabel::new(partial.chunk, *label);
            self.observed.insert(key);
            self.set.insert(key);
        }
    }

    /// Records one contact. Returns `true` if it merged two classes.
    ///
    /// Contacts touching background are ignored. Reporting the same contact
    /// twice, from either side, has no further effect.
    pub fn add_contact(&mut self, contact: &BoundaryContact) -> bool {
        let background = self.options.background;
        if contact.label == background || contact.touching_label == background {
            return false;
        }
        let (a, b) = contact.canonical();
        self.set.insert(a);
        self.set.insert(b);

        let seen = self.contacts.entry((a, b)).or_default();
        *seen = (*seen).max(contact.voxels);
        if self.options.mode == StitchMode::Disabled || *seen < self.options.min_contact_voxels {
            return false;
        }
        self.set.union(a, b)
    }

    /// Detects and records contacts between `a` and its neighbor `b`.
    pub fn add_pair(&mut self, a: &PartialResult, b: &PartialResult) -> usize {
        let contacts = detect_contacts(a, b, self.options.rule, self.options.background);
        contacts.iter().filter(|c| self.add_contact(c)).count()
    }

    /// Registers all partials and stitches every neighboring pair once.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(chunks = partials.len())))]
    pub fn stitch_partials(&mut self, partials: &BTreeMap<ChunkId, PartialResult>) -> usize {
        for partial in partials.values() {
            self.add_partial(partial);
        }
        let mut merges = 0;
        for partial in partials.values() {
            for face in Face::UPPER {
                if let Some(neighbor) = partials.get(&partial.chunk.neighbor(face)) {
                    merges += self.add_pair(partial, neighbor);
                }
            }
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(merges, contacts = self.contacts.len(), "stitched partials");
        merges
    }

    pub fn contact_count(&self) -> usize {
        self.contacts.len()
    }

    pub fn same_object(&self, a: &GlobalLabel, b: &GlobalLabel) -> bool {
        self.set.same_class(a, b)
    }

    /// Freezes the current classes into a [`FinalResult`].
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] if `label_offset` leaves too few
    /// global ids for the objects found.
    pub fn finish(&self) -> Result<FinalResult> {
        let representatives = self
            .observed
            .iter()
            .map(|key| (*key, self.set.representative(key).copied().unwrap_or(*key)))
            .collect();
        FinalResult::new(representatives, self.options.background, self.options.label_offset)
    }
}
