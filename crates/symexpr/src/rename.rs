use std::collections::HashMap;

/// Renames unknown-variable identifiers to small first-use ordinals.
///
/// The global identifier counter advances with every analysis run, so raw
/// identifiers are unsuitable for output that must be comparable across runs
/// (regression baselines, state fingerprints). Rendering through one rename
/// map assigns `0, 1, 2, ...` in order of first appearance instead.
#[derive(Debug, Default, Clone)]
pub struct RenameMap {
    names: HashMap<u64, u64>,
}

impl RenameMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stable name for `id`, allocating the next ordinal on
    /// first use.
    pub fn rename(&mut self, id: u64) -> u64 {
        let next = self.names.len() as u64;
        *self.names.entry(id).or_insert(next)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
