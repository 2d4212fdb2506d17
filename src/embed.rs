//! Embedding stage: turns the extracted entity list into typed vectors for retrieval.

use futures::StreamExt;
use futures::stream;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::EmbedConfig;
use crate::llm::EmbeddingOracle;
use crate::model::{EntityRecord, EntityType};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("entity list must be a JSON array, found {0}")]
pub struct EntityListError(&'static str);

/// A distinct entity string and every type it was extracted with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedTarget {
    pub entity: String,
    pub types: Vec<EntityType>,
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Reads `[{entity, types: [..]}]`, skipping blank or `null` entities and unknown types.
/// Repeated entities are merged so each string is embedded once.
pub fn collect_targets(list: &Value) -> Result<Vec<EmbedTarget>, EntityListError> {
    let items = list.as_array().ok_or_else(|| EntityListError(kind(list)))?;
    let mut targets: Vec<EmbedTarget> = Vec::new();

    for item in items {
        let Some(entity) = item.get("entity").and_then(Value::as_str).map(str::trim) else {
            continue;
        };
        if entity.is_empty() || entity.eq_ignore_ascii_case("null") {
            continue;
        }
        let types: Vec<EntityType> = item
            .get("types")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .filter_map(EntityType::parse)
            .collect();
        if types.is_empty() {
            continue;
        }

        match targets.iter_mut().find(|t| t.entity == entity) {
            Some(target) => target.types.extend(types),
            None => targets.push(EmbedTarget {
                entity: entity.to_string(),
                types,
            }),
        }
    }

    for target in &mut targets {
        target.types.sort();
        target.types.dedup();
    }
    Ok(targets)
}

#[derive(Debug, Default)]
pub struct EmbedReport {
    pub records: Vec<EntityRecord>,
    pub failed: Vec<String>,
}

/// Embeds every target once and emits one record per (entity, type), in input order.
pub async fn embed_all<E: EmbeddingOracle>(
    oracle: &E,
    config: &EmbedConfig,
    targets: &[EmbedTarget],
) -> EmbedReport {
    let total = targets.len();
    let mut results: Vec<(usize, Option<Vec<f32>>)> = stream::iter(targets.iter().enumerate())
        .map(|(i, target)| async move {
            let vector = config
                .retry
                .run(&target.entity, |_| oracle.embed(&target.entity))
                .await;
            match vector {
                Ok(vector) => {
                    debug!(entity = %target.entity, progress = i + 1, total, "embedded");
                    (i, Some(vector))
                }
                Err(e) => {
                    warn!(entity = %target.entity, error = %e, "embedding failed; entity dropped");
                    (i, None)
                }
            }
        })
        .buffer_unordered(config.concurrency.max(1))
        .collect()
        .await;
    results.sort_by_key(|(i, _)| *i);

    let mut report = EmbedReport::default();
    for (i, vector) in results {
        let target = &targets[i];
        let Some(vector) = vector else {
            report.failed.push(target.entity.clone());
            continue;
        };
        for entity_type in &target.types {
            report.records.push(EntityRecord {
                name: target.entity.clone(),
                entity_type: *entity_type,
                vector: vector.clone(),
            });
        }
    }
    report
}
