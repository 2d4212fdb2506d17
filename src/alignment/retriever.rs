use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::RetrievalConfig;
use crate::model::{CandidateMatch, EntityRecord, EntityType, LangPair};

/// Candidates of one source entity, keyed by the language pair they were retrieved for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateEntry {
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub matches: BTreeMap<LangPair, Vec<CandidateMatch>>,
}

/// Persisted retrieval output: source entity name → candidates.
pub type CandidateMap = BTreeMap<String, CandidateEntry>;

/// Scales `v` to unit length. Zero vectors are returned unchanged.
pub fn l2_normalize(v: &[f32]) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm < f32::EPSILON {
        v.to_vec()
    } else {
        v.iter().map(|x| x / norm).collect()
    }
}

/// Cosine similarity clamped to [0, 1]. Mismatched or empty vectors score 0.
#[cfg(test)]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    unit_dot(&l2_normalize(a), &l2_normalize(b))
}

fn unit_dot(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    if dot.is_nan() { 0.0 } else { dot.clamp(0.0, 1.0) }
}

#[derive(Debug, Default)]
struct TypedVectors {
    names: Vec<String>,
    vectors: Vec<Vec<f32>>,
}

/// One language's entities grouped by type, vectors pre-normalized.
#[derive(Debug, Default)]
pub struct EntityIndex {
    by_type: HashMap<EntityType, TypedVectors>,
}

impl EntityIndex {
    pub fn build(records: &[EntityRecord]) -> Self {
        let mut by_type: HashMap<EntityType, TypedVectors> = HashMap::new();
        for record in records {
            let group = by_type.entry(record.entity_type).or_default();
            group.names.push(record.name.clone());
            group.vectors.push(l2_normalize(&record.vector));
        }
        Self { by_type }
    }

    pub fn count(&self, entity_type: EntityType) -> usize {
        self.by_type.get(&entity_type).map_or(0, |g| g.names.len())
    }
}

/// Top-`top_k` same-type entities of `target` at or above `threshold`, best first.
/// Ties keep the target collection's original order.
pub fn retrieve(
    source: &EntityRecord,
    target: &EntityIndex,
    config: &RetrievalConfig,
) -> Vec<CandidateMatch> {
    let Some(group) = target.by_type.get(&source.entity_type) else {
        return Vec::new();
    };

    let query = l2_normalize(&source.vector);
    let mut scored: Vec<(usize, f32)> = group
        .vectors
        .iter()
        .enumerate()
        .map(|(i, v)| (i, unit_dot(&query, v)))
        .collect();
    scored.sort_by(|a, b| match b.1.total_cmp(&a.1) {
        Ordering::Equal => a.0.cmp(&b.0),
        other => other,
    });

    scored
        .into_iter()
        .take(config.top_k)
        .take_while(|&(_, similarity)| similarity >= config.threshold)
        .map(|(i, similarity)| CandidateMatch {
            name: group.names[i].clone(),
            similarity,
            entity_type: source.entity_type,
        })
        .collect()
}

/// Retrieves candidates for every source entity of one language pair and merges them into `map`.
/// Sources without candidates are omitted. Returns the number of sources that got candidates.
pub fn retrieve_pair(
    sources: &[EntityRecord],
    target: &EntityIndex,
    pair: LangPair,
    config: &RetrievalConfig,
    map: &mut CandidateMap,
) -> usize {
    let mut matched = 0;
    for source in sources {
        let candidates = retrieve(source, target, config);
        if candidates.is_empty() {
            continue;
        }

        let entry = map
            .entry(source.name.clone())
            .or_insert_with(|| CandidateEntry {
                entity_type: source.entity_type,
                matches: BTreeMap::new(),
            });
        if entry.entity_type != source.entity_type {
            warn!(
                entity = %source.name,
                kept = %entry.entity_type,
                dropped = %source.entity_type,
                "source entity listed under two types; keeping the first"
            );
            continue;
        }

        entry.matches.entry(pair).or_default().extend(candidates);
        matched += 1;
    }
    debug!(%pair, sources = sources.len(), matched, "retrieval pass complete");
    matched
}
