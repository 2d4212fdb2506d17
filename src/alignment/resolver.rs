use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::model::{Lang, VerifiedPair};

/// Names confirmed (directly or transitively) to denote one real-world entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCluster {
    /// Member name → languages it was observed in.
    pub members: BTreeMap<String, BTreeSet<Lang>>,
    /// Languages contributing more than one distinct name; a sign of oracle disagreement.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub conflicts: BTreeMap<Lang, BTreeSet<String>>,
}

impl EntityCluster {
    /// Canonical id: the smallest member name.
    pub fn id(&self) -> &str {
        self.members.keys().next().map_or("", String::as_str)
    }

    fn from_members(members: BTreeMap<String, BTreeSet<Lang>>) -> Self {
        let mut by_lang: BTreeMap<Lang, BTreeSet<String>> = BTreeMap::new();
        for (name, langs) in &members {
            for lang in langs {
                by_lang.entry(*lang).or_default().insert(name.clone());
            }
        }
        by_lang.retain(|_, names| names.len() > 1);
        Self {
            members,
            conflicts: by_lang,
        }
    }
}

/// Cluster id → cluster, as written to `clusters.json`.
pub type ClusterTable = BTreeMap<String, EntityCluster>;

/// Union-find over entity names. Accepts every confirmed pair without re-verifying
/// transitive implications, so the final partition depends only on the set of pairs seen.
#[derive(Debug, Default)]
pub struct AlignmentResolver {
    ids: HashMap<String, usize>,
    names: Vec<String>,
    languages: Vec<BTreeSet<Lang>>,
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl AlignmentResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, pair: &VerifiedPair) {
        let a = self.intern(&pair.source, pair.source_lang);
        let b = self.intern(&pair.target, pair.target_lang);
        self.union(a, b);
    }

    pub fn extend<'p>(&mut self, pairs: impl IntoIterator<Item = &'p VerifiedPair>) {
        for pair in pairs {
            self.observe(pair);
        }
    }

    #[cfg(test)]
    pub fn same_cluster(&mut self, a: &str, b: &str) -> bool {
        match (self.ids.get(a).copied(), self.ids.get(b).copied()) {
            (Some(a), Some(b)) => self.find(a) == self.find(b),
            _ => false,
        }
    }

    /// One cluster per connected component, keyed by canonical id.
    pub fn clusters(&mut self) -> ClusterTable {
        let mut groups: HashMap<usize, BTreeMap<String, BTreeSet<Lang>>> = HashMap::new();
        for i in 0..self.names.len() {
            let root = self.find(i);
            groups
                .entry(root)
                .or_default()
                .insert(self.names[i].clone(), self.languages[i].clone());
        }

        groups
            .into_values()
            .map(EntityCluster::from_members)
            .map(|cluster| (cluster.id().to_string(), cluster))
            .collect()
    }

    fn intern(&mut self, name: &str, lang: Lang) -> usize {
        let id = match self.ids.get(name) {
            Some(&id) => id,
            None => {
                let id = self.names.len();
                self.ids.insert(name.to_string(), id);
                self.names.push(name.to_string());
                self.languages.push(BTreeSet::new());
                self.parent.push(id);
                self.rank.push(0);
                id
            }
        };
        self.languages[id].insert(lang);
        id
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

/// Resolves a complete pair set in one go.
pub fn resolve<'p>(pairs: impl IntoIterator<Item = &'p VerifiedPair>) -> ClusterTable {
    let mut resolver = AlignmentResolver::new();
    resolver.extend(pairs);
    resolver.clusters()
}
