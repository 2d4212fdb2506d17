use std::collections::{BTreeMap, BTreeSet};

use futures::StreamExt;
use futures::stream;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::article::{Article, PurifiedArticle};
use super::parser::{Extraction, parse_response};
use super::prompt::build_messages;
use crate::config::PurifyConfig;
use crate::llm::{ChatOracle, Message};
use crate::model::{EntityType, Triple};

/// Counts how many independent sources proposed each key. A source votes at most once per key.
#[derive(Debug, Clone)]
pub struct VoteTally<K> {
    counts: BTreeMap<K, usize>,
}

impl<K: Ord> Default for VoteTally<K> {
    fn default() -> Self {
        Self {
            counts: BTreeMap::new(),
        }
    }
}

impl<K: Ord> VoteTally<K> {
    pub fn add_source(&mut self, keys: impl IntoIterator<Item = K>) {
        let distinct: BTreeSet<K> = keys.into_iter().collect();
        for key in distinct {
            *self.counts.entry(key).or_default() += 1;
        }
    }

    #[cfg(test)]
    pub fn count(&self, key: &K) -> usize {
        self.counts.get(key).copied().unwrap_or(0)
    }

    pub fn accepted(&self, threshold: usize) -> impl Iterator<Item = &K> {
        self.counts
            .iter()
            .filter(move |(_, votes)| **votes >= threshold)
            .map(|(key, _)| key)
    }
}

/// Majority vote over the first-pass extraction and the successful sampling rounds.
/// The first pass is one source like any round.
pub fn tally(original: &Extraction, rounds: &[Extraction], threshold: usize) -> PurifiedArticle {
    let mut entities: VoteTally<(EntityType, &str)> = VoteTally::default();
    let mut triples: VoteTally<&Triple> = VoteTally::default();

    for source in std::iter::once(original).chain(rounds) {
        entities.add_source(
            source
                .entities
                .iter()
                .flat_map(|(t, names)| names.iter().map(move |n| (*t, n.as_str()))),
        );
        triples.add_source(source.triples.iter());
    }

    let mut purified_entities: BTreeMap<EntityType, BTreeSet<String>> =
        EntityType::ALL.into_iter().map(|t| (t, BTreeSet::new())).collect();
    for (entity_type, name) in entities.accepted(threshold) {
        purified_entities
            .entry(*entity_type)
            .or_default()
            .insert((*name).to_string());
    }

    let mut purified_triples: Vec<String> =
        triples.accepted(threshold).map(|t| t.to_string()).collect();
    purified_triples.sort();

    PurifiedArticle {
        purified_entities,
        purified_triples,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurifyReport {
    pub purified: PurifiedArticle,
    pub rounds_ok: usize,
    pub rounds_failed: usize,
}

/// Re-extracts each article several times and keeps only what enough sources agree on.
pub struct Purifier<'a, C> {
    oracle: &'a C,
    config: &'a PurifyConfig,
    gate: Semaphore,
}

impl<'a, C: ChatOracle> Purifier<'a, C> {
    pub fn new(oracle: &'a C, config: &'a PurifyConfig) -> Self {
        Self {
            oracle,
            config,
            gate: Semaphore::new(config.concurrency.max(1)),
        }
    }

    /// Never fails: rounds that exhaust their retries simply cast no votes.
    pub async fn purify(&self, article: &Article) -> PurifyReport {
        let messages = build_messages(article);
        let rounds: Vec<Option<Extraction>> = stream::iter(0..self.config.sampling_times)
            .map(|round| self.sample(&article.id, &messages, round))
            .buffer_unordered(self.config.sampling_times.max(1))
            .collect()
            .await;

        let rounds_failed = rounds.iter().filter(|r| r.is_none()).count();
        let rounds: Vec<Extraction> = rounds.into_iter().flatten().collect();
        let purified = tally(&article.original, &rounds, self.config.consistency_threshold);

        debug!(
            article = %article.id,
            rounds_ok = rounds.len(),
            rounds_failed,
            triples = purified.purified_triples.len(),
            "article tallied"
        );
        PurifyReport {
            purified,
            rounds_ok: rounds.len(),
            rounds_failed,
        }
    }

    async fn sample(&self, article_id: &str, messages: &[Message], round: usize) -> Option<Extraction> {
        let Ok(_permit) = self.gate.acquire().await else {
            warn!(article = %article_id, round, "admission gate closed");
            return None;
        };

        let label = format!("{article_id}#{round}");
        let oracle = self.oracle;
        let temperature = self.config.temperature;
        match self
            .config
            .retry
            .run(&label, move |_| oracle.complete(messages, temperature))
            .await
        {
            Ok(text) => Some(parse_response(&text)),
            Err(e) => {
                warn!(article = %article_id, round, error = %e, "sampling round failed; no votes cast");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use crate::model::Relation;
    use crate::retry::instant_policy;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn triple(s: &str, r: Relation, o: &str) -> Triple {
        Triple {
            subject: s.into(),
            relation: r,
            object: o.into(),
        }
    }

    fn with_triples(triples: &[Triple]) -> Extraction {
        Extraction {
            triples: triples.iter().cloned().collect(),
            ..Default::default()
        }
    }

    /// Fails the first `failures` calls, then answers every call with `response`.
    struct FlakyOracle {
        failures: AtomicUsize,
        response: String,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl FlakyOracle {
        fn new(failures: usize, response: &str) -> Self {
            Self {
                failures: AtomicUsize::new(failures),
                response: response.to_string(),
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    impl ChatOracle for FlakyOracle {
        async fn complete(&self, _messages: &[Message], _temperature: f32) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let fail = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                Err(LlmError::RateLimited)
            } else {
                Ok(self.response.clone())
            }
        }
    }

    fn config(concurrency: usize) -> PurifyConfig {
        PurifyConfig {
            concurrency,
            retry: instant_policy(0),
            ..Default::default()
        }
    }

    fn article(original: Extraction) -> Article {
        Article {
            id: "n-1".into(),
            content: "VinGroup thành lập VinSmart.".into(),
            original,
        }
    }

    #[test]
    fn a_source_votes_once_per_key() {
        let mut tally = VoteTally::default();
        tally.add_source(["a", "a", "b"]);
        tally.add_source(["a"]);
        assert_eq!(tally.count(&"a"), 2);
        assert_eq!(tally.count(&"b"), 1);
        assert_eq!(tally.count(&"c"), 0);
        assert_eq!(tally.accepted(2).collect::<Vec<_>>(), vec![&"a"]);
    }

    #[test]
    fn original_plus_two_rounds_is_accepted_two_votes_is_not() {
        let kept = triple("VinGroup", Relation::Branch, "VinSmart");
        let dropped = triple("VinGroup", Relation::Investment, "FutureTech");
        let newcomer = triple("Phạm Nhật Vượng", Relation::Executive, "VinGroup");

        let original = with_triples(&[kept.clone(), dropped.clone()]);
        let rounds = vec![
            with_triples(&[kept.clone(), newcomer.clone()]),
            with_triples(&[kept.clone(), dropped, newcomer.clone()]),
            with_triples(&[newcomer.clone()]),
            Extraction::default(),
            Extraction::default(),
        ];

        let purified = tally(&original, &rounds, 3);

        assert_eq!(
            purified.purified_triples,
            vec![newcomer.to_string(), kept.to_string()]
        );
    }

    #[test]
    fn entities_are_voted_per_type() {
        let mut original = Extraction::default();
        original.add_entity(EntityType::Enterprise, "VinGroup");
        original.add_entity(EntityType::Location, "Hà Nội");
        let mut round = Extraction::default();
        round.add_entity(EntityType::Enterprise, "VinGroup");
        round.add_entity(EntityType::Person, "Hà Nội");

        let purified = tally(&original, &[round.clone(), round], 3);

        assert_eq!(purified.purified_entities.len(), 4);
        assert_eq!(
            purified.purified_entities[&EntityType::Enterprise],
            BTreeSet::from(["VinGroup".to_string()])
        );
        assert!(purified.purified_entities[&EntityType::Location].is_empty());
        assert!(purified.purified_entities[&EntityType::Person].is_empty());
    }

    #[tokio::test]
    async fn failed_rounds_cast_no_votes() {
        let response = "enterprise: VinGroup\n(VinGroup, branch, VinSmart)";

        let oracle = FlakyOracle::new(2, response);
        let config = config(30);
        let report = Purifier::new(&oracle, &config)
            .purify(&article(Extraction::default()))
            .await;
        assert_eq!((report.rounds_ok, report.rounds_failed), (3, 2));
        assert_eq!(report.purified.purified_triples, vec!["(VinGroup, branch, VinSmart)"]);

        let oracle = FlakyOracle::new(3, response);
        let report = Purifier::new(&oracle, &config)
            .purify(&article(Extraction::default()))
            .await;
        assert_eq!((report.rounds_ok, report.rounds_failed), (2, 3));
        assert!(report.purified.purified_triples.is_empty());
    }

    #[tokio::test]
    async fn null_triples_never_survive() {
        let oracle = FlakyOracle::new(0, "(SJC,branch,null)\n(SJC, branch, SJC Đà Nẵng)");
        let config = config(30);
        let report = Purifier::new(&oracle, &config)
            .purify(&article(Extraction::default()))
            .await;
        assert_eq!(report.purified.purified_triples, vec!["(SJC, branch, SJC Đà Nẵng)"]);
    }

    #[tokio::test]
    async fn all_rounds_failing_leaves_only_the_original_vote() {
        let oracle = FlakyOracle::new(usize::MAX, "");
        let config = config(30);
        let original = with_triples(&[triple("A", Relation::Branch, "B")]);

        let report = Purifier::new(&oracle, &config).purify(&article(original)).await;

        assert_eq!(report.rounds_failed, 5);
        assert!(report.purified.purified_triples.is_empty());
        assert_eq!(report.purified.purified_entities.len(), 4);
    }

    #[tokio::test]
    async fn rounds_share_the_admission_gate() {
        let oracle = FlakyOracle::new(0, "");
        let config = config(2);
        Purifier::new(&oracle, &config)
            .purify(&article(Extraction::default()))
            .await;
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 5);
        assert!(oracle.peak.load(Ordering::SeqCst) <= 2);
    }
}
