use futures::future::join_all;
use futures::stream::{FuturesUnordered, Stream};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::prompt::{ParseError, build_messages, parse_matches};
use super::retriever::CandidateMap;
use crate::config::VerificationConfig;
use crate::llm::{ChatOracle, LlmError};
use crate::model::{CandidateMatch, EntityType, LangPair, VerifiedPair};

/// One verification request: a source entity and its candidates in one target language.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationUnit {
    pub source: String,
    pub entity_type: EntityType,
    pub pair: LangPair,
    pub candidates: Vec<CandidateMatch>,
}

impl VerificationUnit {
    /// Checkpoint key, e.g. `zh->vi:阿里巴巴集团`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.pair, self.source)
    }
}

/// Flattens a candidate map into units for the requested pairs, in map order.
pub fn units_from_candidates(map: &CandidateMap, pairs: &[LangPair]) -> Vec<VerificationUnit> {
    map.iter()
        .flat_map(|(source, entry)| {
            pairs.iter().filter_map(move |pair| {
                let candidates = entry.matches.get(pair)?;
                Some(VerificationUnit {
                    source: source.clone(),
                    entity_type: entry.entity_type,
                    pair: *pair,
                    candidates: candidates.clone(),
                })
            })
        })
        .collect()
}

/// Candidates worth asking about: same type, above the strict threshold, and free of digits
/// (tickers and numeric codes are never entity names).
pub fn prefilter(
    entity_type: EntityType,
    candidates: &[CandidateMatch],
    threshold: f32,
) -> Vec<CandidateMatch> {
    candidates
        .iter()
        .filter(|c| {
            c.entity_type == entity_type
                && c.similarity >= threshold
                && !c.name.chars().any(char::is_numeric)
        })
        .cloned()
        .collect()
}

#[derive(Debug, thiserror::Error)]
enum VerifyError {
    #[error(transparent)]
    Oracle(#[from] LlmError),

    #[error("unparseable oracle output: {0}")]
    Parse(#[from] ParseError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    Verified,
    /// Nothing survived the pre-filter; no oracle call was made.
    NoCandidates,
    /// Every attempt failed; the unit contributes no pairs.
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnitOutcome {
    pub key: String,
    pub pairs: Vec<VerifiedPair>,
    pub status: UnitStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutcome {
    pub index: usize,
    pub units: Vec<UnitOutcome>,
}

impl BatchOutcome {
    pub fn pair_count(&self) -> usize {
        self.units.iter().map(|u| u.pairs.len()).sum()
    }

    pub fn failed_count(&self) -> usize {
        self.units
            .iter()
            .filter(|u| u.status == UnitStatus::Failed)
            .count()
    }
}

/// Dispatches verification requests to the oracle with bounded concurrency and retry.
pub struct Scheduler<'a, C> {
    oracle: &'a C,
    config: &'a VerificationConfig,
    gate: Semaphore,
}

impl<'a, C: ChatOracle> Scheduler<'a, C> {
    pub fn new(oracle: &'a C, config: &'a VerificationConfig) -> Self {
        Self {
            oracle,
            config,
            gate: Semaphore::new(config.concurrency.max(1)),
        }
    }

    /// Verifies one unit. Never fails: exhausted retries yield an empty, `Failed` outcome.
    pub async fn verify(&self, unit: &VerificationUnit) -> UnitOutcome {
        let key = unit.key();
        let candidates = prefilter(unit.entity_type, &unit.candidates, self.config.threshold);
        if candidates.is_empty() {
            debug!(unit = %key, "no candidates after pre-filter");
            return UnitOutcome {
                key,
                pairs: Vec::new(),
                status: UnitStatus::NoCandidates,
            };
        }

        let messages = build_messages(&unit.source, unit.entity_type, unit.pair, &candidates);

        // Held across retries so backoff never lets another unit exceed the limit.
        let Ok(_permit) = self.gate.acquire().await else {
            warn!(unit = %key, "admission gate closed");
            return UnitOutcome {
                key,
                pairs: Vec::new(),
                status: UnitStatus::Failed,
            };
        };

        let messages = &messages;
        let unit_key = key.as_str();
        let result = self
            .config
            .retry
            .run(unit_key, |_| async move {
                let text = self
                    .oracle
                    .complete(messages, self.config.temperature)
                    .await?;
                parse_matches(&text, unit.pair).map_err(|e| {
                    debug!(unit = %unit_key, response = %text, "unparseable verification response");
                    VerifyError::from(e)
                })
            })
            .await;

        match result {
            Ok(pairs) => {
                debug!(unit = %key, candidates = candidates.len(), matches = pairs.len(), "unit verified");
                UnitOutcome {
                    key,
                    pairs,
                    status: UnitStatus::Verified,
                }
            }
            Err(e) => {
                warn!(unit = %key, error = %e, "verification failed; continuing without matches");
                UnitOutcome {
                    key,
                    pairs: Vec::new(),
                    status: UnitStatus::Failed,
                }
            }
        }
    }

    /// Groups `units` into progress batches and polls all of them concurrently.
    /// Batches complete in any order; only the gate limits how many calls are in flight.
    pub fn run<'s>(&'s self, units: &'s [VerificationUnit]) -> impl Stream<Item = BatchOutcome> + 's {
        units
            .chunks(self.config.batch_size.max(1))
            .enumerate()
            .map(|(index, batch)| async move {
                let units = join_all(batch.iter().map(|unit| self.verify(unit))).await;
                BatchOutcome { index, units }
            })
            .collect::<FuturesUnordered<_>>()
    }
}
