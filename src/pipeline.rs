//! Stage drivers: load inputs, run a component, checkpoint the results.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use futures::StreamExt;
use futures::stream;
use serde_json::Value;
use tracing::{info, warn};

use crate::alignment::{
    CandidateMap, EntityIndex, Scheduler, UnitStatus, VerificationUnit, resolve, retriever, scheduler,
};
use crate::config::{EmbedConfig, PurifyConfig, RetrievalConfig, VerificationConfig};
use crate::embed::{self, EntityListError};
use crate::llm::{ChatOracle, EmbeddingOracle};
use crate::model::{EntityRecord, EntityType, Lang, LangPair, VerifiedPair};
use crate::purify::{Article, ArticleError, Purifier, is_purified, write_back};
use crate::store::{AlignmentState, CheckpointDir, StoreError, read_json, read_json_if_exists, write_json_atomic};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no entity collection given for language '{0}'")]
    MissingCollection(Lang),

    #[error(transparent)]
    EntityList(#[from] EntityListError),

    #[error("article {index}: {source}")]
    Article {
        index: usize,
        #[source]
        source: ArticleError,
    },
}

// ---------------------------------------------------------------------------
// embed
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbedSummary {
    pub entities: usize,
    pub records: usize,
    pub failed: usize,
}

pub async fn run_embed<E: EmbeddingOracle>(
    oracle: &E,
    config: &EmbedConfig,
    input: &Path,
    output: &Path,
) -> Result<EmbedSummary, PipelineError> {
    let list: Value = read_json(input)?;
    let targets = embed::collect_targets(&list)?;
    info!(input = %input.display(), entities = targets.len(), "embedding entities");

    let report = embed::embed_all(oracle, config, &targets).await;
    write_json_atomic(output, &report.records)?;

    let summary = EmbedSummary {
        entities: targets.len(),
        records: report.records.len(),
        failed: report.failed.len(),
    };
    info!(
        output = %output.display(),
        records = summary.records,
        failed = summary.failed,
        "embedding complete"
    );
    Ok(summary)
}

// ---------------------------------------------------------------------------
// retrieve
// ---------------------------------------------------------------------------

/// Builds the candidate map for `pairs` from per-language entity collections and writes it.
pub fn run_retrieve(
    collections: &BTreeMap<Lang, PathBuf>,
    pairs: &[LangPair],
    config: &RetrievalConfig,
    output: &Path,
) -> Result<CandidateMap, PipelineError> {
    let mut records: BTreeMap<Lang, Vec<EntityRecord>> = BTreeMap::new();
    for lang in pairs.iter().flat_map(|p| [p.source, p.target]) {
        if records.contains_key(&lang) {
            continue;
        }
        let path = collections
            .get(&lang)
            .ok_or(PipelineError::MissingCollection(lang))?;
        let loaded: Vec<EntityRecord> = read_json(path)?;
        info!(lang = %lang, entities = loaded.len(), "loaded entity collection");
        records.insert(lang, loaded);
    }

    let indexes: BTreeMap<Lang, EntityIndex> = records
        .iter()
        .map(|(lang, records)| (*lang, EntityIndex::build(records)))
        .collect();

    let mut map = CandidateMap::new();
    for pair in pairs {
        let (Some(sources), Some(target)) = (records.get(&pair.source), indexes.get(&pair.target))
        else {
            continue;
        };
        for entity_type in EntityType::ALL {
            if target.count(entity_type) == 0 {
                info!(%pair, %entity_type, "no target entities of this type");
            }
        }
        let matched = retriever::retrieve_pair(sources, target, *pair, config, &mut map);
        info!(%pair, sources = sources.len(), matched, "retrieval done");
    }

    write_json_atomic(output, &map)?;
    info!(output = %output.display(), entities = map.len(), "candidate map written");
    Ok(map)
}

// ---------------------------------------------------------------------------
// align / resolve
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlignSummary {
    pub units: usize,
    pub skipped: usize,
    pub pairs: usize,
    pub failed: usize,
    pub batch_files: usize,
    pub clusters: usize,
}

/// Verified pairs waiting to be persisted together with the units that produced them.
struct PairBuffer<'s> {
    store: &'s CheckpointDir,
    state: AlignmentState,
    pairs: Vec<VerifiedPair>,
    done: Vec<String>,
    files_written: usize,
}

impl PairBuffer<'_> {
    /// Writes buffered pairs as the next batch file, then records their units as processed.
    fn flush(&mut self) -> Result<(), StoreError> {
        if !self.pairs.is_empty() {
            let path = self.store.write_batch(self.state.next_batch, &self.pairs)?;
            info!(file = %path.display(), pairs = self.pairs.len(), "flushed verified pairs");
            self.state.next_batch += 1;
            self.files_written += 1;
            self.pairs.clear();
        }
        if !self.done.is_empty() {
            self.state.processed.extend(self.done.drain(..));
            self.store.save_state(&self.state)?;
        }
        Ok(())
    }
}

/// Verifies every unprocessed unit of the candidate map, checkpointing as it goes, and
/// finally resolves all verified pairs on disk into clusters.
pub async fn run_align<C: ChatOracle>(
    oracle: &C,
    config: &VerificationConfig,
    candidates: &Path,
    pairs: &[LangPair],
    store: &CheckpointDir,
) -> Result<AlignSummary, PipelineError> {
    let map: CandidateMap = read_json(candidates)?;
    let state = store.load_state()?;

    let all_units = scheduler::units_from_candidates(&map, pairs);
    let total = all_units.len();
    let units: Vec<VerificationUnit> = all_units
        .into_iter()
        .filter(|unit| !state.processed.contains(&unit.key()))
        .collect();
    let skipped = total - units.len();
    let batch_total = units.len().div_ceil(config.batch_size.max(1));
    info!(
        units = units.len(),
        skipped,
        batches = batch_total,
        concurrency = config.concurrency,
        "starting verification"
    );

    let mut buffer = PairBuffer {
        store,
        state,
        pairs: Vec::new(),
        done: Vec::new(),
        files_written: 0,
    };
    let mut summary = AlignSummary {
        skipped,
        ..Default::default()
    };

    let scheduler = Scheduler::new(oracle, config);
    let mut batches = std::pin::pin!(scheduler.run(&units));
    let mut batches_done = 0;
    while let Some(batch) = batches.next().await {
        batches_done += 1;
        summary.pairs += batch.pair_count();
        summary.failed += batch.failed_count();
        summary.units += batch.units.len();

        for unit in batch.units {
            // Failed units stay unprocessed so the next run retries them.
            if unit.status != UnitStatus::Failed {
                buffer.done.push(unit.key);
            }
            buffer.pairs.extend(unit.pairs);
        }
        info!(
            batch = batch.index,
            done = batches_done,
            total = batch_total,
            pairs = summary.pairs,
            failed = summary.failed,
            "batch verified"
        );

        if buffer.pairs.len() >= config.flush_threshold
            || batches_done % config.checkpoint_batches.max(1) == 0
        {
            buffer.flush()?;
        }
    }
    buffer.flush()?;
    summary.batch_files = buffer.files_written;

    summary.clusters = run_resolve(store)?;
    info!(
        units = summary.units,
        pairs = summary.pairs,
        failed = summary.failed,
        clusters = summary.clusters,
        "alignment complete"
    );
    Ok(summary)
}

/// Rebuilds `clusters.json` from the batch files on disk. Returns the number of clusters.
pub fn run_resolve(store: &CheckpointDir) -> Result<usize, PipelineError> {
    let pairs = store.load_pairs()?;
    let clusters = resolve(&pairs);

    for (id, cluster) in &clusters {
        for (lang, names) in &cluster.conflicts {
            warn!(cluster = %id, %lang, names = ?names, "several names in one language merged");
        }
    }

    store.write_clusters(&clusters)?;
    info!(
        pairs = pairs.len(),
        clusters = clusters.len(),
        output = %store.clusters_path().display(),
        "clusters resolved"
    );
    Ok(clusters.len())
}

// ---------------------------------------------------------------------------
// purify
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurifySummary {
    pub articles: usize,
    pub already_purified: usize,
    pub missing_content: usize,
    pub purified: usize,
    pub failed_rounds: usize,
}

/// Purifies every article not yet purified. Resumes from `output` when it exists and
/// rewrites the whole dataset every `save_interval` newly purified articles.
pub async fn run_purify<C: ChatOracle>(
    oracle: &C,
    config: &PurifyConfig,
    input: &Path,
    output: &Path,
) -> Result<PurifySummary, PipelineError> {
    let mut articles: Vec<Value> = match read_json_if_exists(output)? {
        Some(resumed) => {
            info!(output = %output.display(), "resuming from previous output");
            resumed
        }
        None => read_json(input)?,
    };

    let mut summary = PurifySummary {
        articles: articles.len(),
        ..Default::default()
    };
    let mut pending = Vec::new();
    for (index, value) in articles.iter().enumerate() {
        if is_purified(value) {
            summary.already_purified += 1;
            continue;
        }
        match Article::from_value(value, index) {
            Ok(article) => pending.push((index, article)),
            Err(e) => {
                warn!(index, error = %e, "skipping article");
                summary.missing_content += 1;
            }
        }
    }
    info!(
        articles = summary.articles,
        pending = pending.len(),
        already_purified = summary.already_purified,
        sampling_times = config.sampling_times,
        "starting purification"
    );

    let purifier = Purifier::new(oracle, config);
    let in_parallel = (config.concurrency / config.sampling_times.max(1)).max(1);
    let pending_total = pending.len();
    let mut reports = stream::iter(&pending)
        .map(|(index, article)| {
            let purifier = &purifier;
            async move { (*index, purifier.purify(article).await) }
        })
        .buffer_unordered(in_parallel);

    while let Some((index, report)) = reports.next().await {
        write_back(&mut articles[index], &report.purified)
            .map_err(|source| PipelineError::Article { index, source })?;
        summary.purified += 1;
        summary.failed_rounds += report.rounds_failed;

        if summary.purified % config.save_interval.max(1) == 0 {
            write_json_atomic(output, &articles)?;
            info!(done = summary.purified, total = pending_total, "checkpoint saved");
        }
    }

    write_json_atomic(output, &articles)?;
    info!(
        output = %output.display(),
        purified = summary.purified,
        failed_rounds = summary.failed_rounds,
        skipped = summary.missing_content,
        "purification complete"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::ClusterTable;
    use crate::llm::{LlmError, Message};
    use crate::retry::instant_policy;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ZH_VI: LangPair = LangPair::new(Lang::Zh, Lang::Vi);

    /// Confirms every listed candidate; fails units whose source is `fail_source`.
    struct ConfirmAll {
        calls: AtomicUsize,
        fail_source: &'static str,
    }

    impl ConfirmAll {
        fn new(fail_source: &'static str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_source,
            }
        }
    }

    impl ChatOracle for ConfirmAll {
        async fn complete(&self, messages: &[Message], _temperature: f32) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let prompt = &messages[1].content;
            let source = prompt
                .lines()
                .next()
                .and_then(|l| l.split_once("): "))
                .map(|(_, s)| s.to_string())
                .unwrap_or_default();
            if source == self.fail_source {
                return Err(LlmError::RateLimited);
            }
            let matches: Vec<Value> = prompt
                .lines()
                .filter_map(|l| l.split_once(". "))
                .filter(|(n, _)| n.parse::<usize>().is_ok())
                .filter_map(|(_, rest)| rest.split_once(" (type:"))
                .map(|(name, _)| json!([source, "equal", name]))
                .collect();
            Ok(json!({ "matches": matches }).to_string())
        }
    }

    struct Constant {
        calls: AtomicUsize,
        response: &'static str,
    }

    impl ChatOracle for Constant {
        async fn complete(&self, _messages: &[Message], _temperature: f32) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.response.to_string())
        }
    }

    struct LengthEmbedder;

    impl EmbeddingOracle for LengthEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
            Ok(vec![text.len() as f32, 1.0])
        }
    }

    fn record(name: &str, entity_type: EntityType, vector: [f32; 2]) -> EntityRecord {
        EntityRecord {
            name: name.into(),
            entity_type,
            vector: vector.to_vec(),
        }
    }

    fn candidate_map() -> CandidateMap {
        serde_json::from_value(json!({
            "阿里巴巴集团": {"type": "enterprise", "matches": {"zh->vi": [
                {"entity": "Alibaba Group", "similarity": 0.91, "type": "enterprise"}
            ]}},
            "越南航空": {"type": "enterprise", "matches": {"zh->vi": [
                {"entity": "Vietnam Airlines", "similarity": 0.88, "type": "enterprise"}
            ]}},
            "杭州": {"type": "location", "matches": {"zh->vi": [
                {"entity": "Hàng Châu", "similarity": 0.95, "type": "location"}
            ]}}
        }))
        .unwrap()
    }

    fn verification(flush_threshold: usize) -> VerificationConfig {
        VerificationConfig {
            flush_threshold,
            batch_size: 2,
            retry: instant_policy(0),
            ..Default::default()
        }
    }

    #[test]
    fn retrieve_writes_candidate_map() {
        let dir = tempfile::tempdir().unwrap();
        let zh = dir.path().join("zh.json");
        let vi = dir.path().join("vi.json");
        write_json_atomic(
            &zh,
            &[
                record("阿里巴巴集团", EntityType::Enterprise, [1.0, 0.0]),
                record("杭州", EntityType::Location, [0.0, 1.0]),
            ],
        )
        .unwrap();
        write_json_atomic(
            &vi,
            &[
                record("Alibaba Group", EntityType::Enterprise, [0.9, 0.1]),
                record("Hàng Châu", EntityType::Enterprise, [0.0, 1.0]),
            ],
        )
        .unwrap();
        let output = dir.path().join("candidates.json");
        let collections = BTreeMap::from([(Lang::Zh, zh), (Lang::Vi, vi)]);

        let map = run_retrieve(&collections, &[ZH_VI], &RetrievalConfig::default(), &output).unwrap();

        assert_eq!(map.len(), 1);
        assert_eq!(map["阿里巴巴集团"].matches[&ZH_VI][0].name, "Alibaba Group");
        let on_disk: Value = read_json(&output).unwrap();
        assert_eq!(on_disk["阿里巴巴集团"]["matches"]["zh->vi"][0]["entity"], "Alibaba Group");
    }

    #[test]
    fn retrieve_requires_every_paired_collection() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_retrieve(
            &BTreeMap::new(),
            &[ZH_VI],
            &RetrievalConfig::default(),
            &dir.path().join("out.json"),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::MissingCollection(Lang::Zh)));
    }

    #[tokio::test]
    async fn align_checkpoints_and_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let candidates = dir.path().join("candidates.json");
        write_json_atomic(&candidates, &candidate_map()).unwrap();
        let store = CheckpointDir::open(dir.path().join("aligned")).unwrap();
        let oracle = ConfirmAll::new("");

        let summary = run_align(&oracle, &verification(1), &candidates, &[ZH_VI], &store)
            .await
            .unwrap();

        assert_eq!(summary.units, 3);
        assert_eq!(summary.pairs, 3);
        assert!(summary.batch_files >= 2);
        assert_eq!(summary.clusters, 3);

        let clusters: ClusterTable = read_json(&store.clusters_path()).unwrap();
        let alibaba = &clusters["Alibaba Group"];
        assert!(alibaba.members.contains_key("阿里巴巴集团"));

        let state = store.load_state().unwrap();
        assert_eq!(state.processed.len(), 3);
        assert!(state.processed.contains("zh->vi:阿里巴巴集团"));
    }

    #[tokio::test]
    async fn rerun_skips_processed_units() {
        let dir = tempfile::tempdir().unwrap();
        let candidates = dir.path().join("candidates.json");
        write_json_atomic(&candidates, &candidate_map()).unwrap();
        let store = CheckpointDir::open(dir.path().join("aligned")).unwrap();
        let config = verification(100);

        let first = ConfirmAll::new("");
        run_align(&first, &config, &candidates, &[ZH_VI], &store).await.unwrap();
        let clusters_before: ClusterTable = read_json(&store.clusters_path()).unwrap();

        let second = ConfirmAll::new("");
        let summary = run_align(&second, &config, &candidates, &[ZH_VI], &store)
            .await
            .unwrap();

        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
        assert_eq!(summary.skipped, 3);
        assert_eq!(summary.batch_files, 0);
        let clusters_after: ClusterTable = read_json(&store.clusters_path()).unwrap();
        assert_eq!(clusters_before, clusters_after);
    }

    /// Answers with no matches and records how many units the on-disk state held at each call.
    struct StateWatcher {
        store: CheckpointDir,
        seen: std::sync::Mutex<Vec<usize>>,
    }

    impl ChatOracle for StateWatcher {
        async fn complete(&self, _messages: &[Message], _temperature: f32) -> Result<String, LlmError> {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            let processed = self.store.load_state().map_or(0, |s| s.processed.len());
            self.seen.lock().unwrap().push(processed);
            Ok(r#"{"matches": []}"#.to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn progress_is_saved_without_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let candidates = dir.path().join("candidates.json");
        write_json_atomic(&candidates, &candidate_map()).unwrap();
        let store = CheckpointDir::open(dir.path().join("aligned")).unwrap();
        let config = VerificationConfig {
            concurrency: 1,
            batch_size: 1,
            checkpoint_batches: 1,
            ..verification(100)
        };
        let oracle = StateWatcher {
            store: CheckpointDir::open(dir.path().join("aligned")).unwrap(),
            seen: Default::default(),
        };

        let summary = run_align(&oracle, &config, &candidates, &[ZH_VI], &store)
            .await
            .unwrap();

        assert_eq!(summary.pairs, 0);
        assert_eq!(summary.batch_files, 0);
        assert_eq!(*oracle.seen.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(store.load_state().unwrap().processed.len(), 3);
    }

    #[tokio::test]
    async fn failed_units_are_retried_next_run() {
        let dir = tempfile::tempdir().unwrap();
        let candidates = dir.path().join("candidates.json");
        write_json_atomic(&candidates, &candidate_map()).unwrap();
        let store = CheckpointDir::open(dir.path().join("aligned")).unwrap();
        let config = verification(100);

        let flaky = ConfirmAll::new("越南航空");
        let summary = run_align(&flaky, &config, &candidates, &[ZH_VI], &store)
            .await
            .unwrap();
        assert_eq!(summary.failed, 1);
        assert!(!store.load_state().unwrap().processed.contains("zh->vi:越南航空"));

        let healthy = ConfirmAll::new("");
        let summary = run_align(&healthy, &config, &candidates, &[ZH_VI], &store)
            .await
            .unwrap();
        assert_eq!(healthy.calls.load(Ordering::SeqCst), 1);
        assert_eq!(summary.skipped, 2);
        assert_eq!(store.batch_files().unwrap().len(), 2);
        assert_eq!(summary.clusters, 3);
    }

    #[tokio::test]
    async fn purify_skips_done_and_contentless_articles_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("news.json");
        let output = dir.path().join("news_purified.json");
        write_json_atomic(
            &input,
            &json!([
                {"news_id": "1", "content": "VinGroup thành lập VinSmart.",
                 "entities": {"enterprise": ["VinGroup"]},
                 "triplet": ["(VinGroup, branch, VinSmart)"]},
                {"news_id": "2", "title": "no body"},
                {"news_id": "3", "content": "x",
                 "purified_entities": {"enterprise": []}, "purified_triples": []}
            ]),
        )
        .unwrap();
        let config = PurifyConfig {
            retry: instant_policy(0),
            save_interval: 1,
            ..Default::default()
        };
        let oracle = Constant {
            calls: AtomicUsize::new(0),
            response: "enterprise: VinGroup, VinSmart\n(VinGroup, branch, VinSmart)\n(SJC,branch,null)",
        };

        let summary = run_purify(&oracle, &config, &input, &output).await.unwrap();

        assert_eq!(summary.purified, 1);
        assert_eq!(summary.already_purified, 1);
        assert_eq!(summary.missing_content, 1);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 5);

        let written: Vec<Value> = read_json(&output).unwrap();
        assert_eq!(written[0]["purified_triples"], json!(["(VinGroup, branch, VinSmart)"]));
        assert_eq!(
            written[0]["purified_entities"]["enterprise"],
            json!(["VinGroup", "VinSmart"])
        );
        assert!(written[1].get("purified_triples").is_none());
        assert_eq!(written[2]["purified_triples"], json!([]));

        let again = Constant {
            calls: AtomicUsize::new(0),
            response: "",
        };
        let summary = run_purify(&again, &config, &input, &output).await.unwrap();
        assert_eq!(summary.purified, 0);
        assert_eq!(again.calls.load(Ordering::SeqCst), 0);
        let rewritten: Vec<Value> = read_json(&output).unwrap();
        assert_eq!(rewritten, written);
    }

    #[tokio::test]
    async fn embed_stage_writes_records() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("entities.json");
        let output = dir.path().join("vectors.json");
        write_json_atomic(
            &input,
            &json!([
                {"entity": "VinGroup", "types": ["enterprise", "project"]},
                {"entity": "null", "types": ["person"]}
            ]),
        )
        .unwrap();

        let summary = run_embed(&LengthEmbedder, &EmbedConfig::default(), &input, &output)
            .await
            .unwrap();

        assert_eq!(
            summary,
            EmbedSummary {
                entities: 1,
                records: 2,
                failed: 0
            }
        );
        let records: Vec<EntityRecord> = read_json(&output).unwrap();
        assert_eq!(records[1].entity_type, EntityType::Project);
        assert_eq!(records[1].vector, vec![8.0, 1.0]);
    }
}
