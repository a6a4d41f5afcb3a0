use std::collections::HashMap;

use uuid::Uuid;

use crate::types::Grain;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrainDiff {
    /// Remote grains missing locally, in remote order.
    pub adds: Vec<Uuid>,
    /// Local grains the remote no longer has, in local order.
    pub deletes: Vec<Uuid>,
}

impl GrainDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.deletes.is_empty()
    }
}

/// Set difference over grain ids. Grains are immutable, so identity is the
/// id alone.
#[must_use]
pub fn diff_grains(remote: &[Grain], local: &[Grain]) -> GrainDiff {
    let mut matched: HashMap<Uuid, bool> = remote.iter().map(|g| (g.id, false)).collect();

    let mut deletes = Vec::new();
    for grain in local {
        match matched.get_mut(&grain.id) {
            Some(seen) => *seen = true,
            None => deletes.push(grain.id),
        }
    }

    let adds = remote
        .iter()
        .filter(|g| matched.get(&g.id) == Some(&false))
        .map(|g| g.id)
        .collect();

    GrainDiff { adds, deletes }
}
