//! Article records as stored in the news dataset, tolerant of the field layouts earlier
//! extraction runs produced.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

use super::parser::{Extraction, find_triples, parse_response, split_names, triple_from_fields};
use crate::model::EntityType;

const ID_FIELDS: [&str; 3] = ["news_id", "article_id", "id"];
const TRIPLE_FIELDS: [&str; 2] = ["triplet", "triples"];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ArticleError {
    #[error("article is not a JSON object")]
    NotAnObject,

    #[error("missing field '{0}'")]
    MissingField(&'static str),
}

/// Output of purification, merged back into the article object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurifiedArticle {
    pub purified_entities: BTreeMap<EntityType, BTreeSet<String>>,
    /// Canonical `(s, r, o)` strings, sorted.
    pub purified_triples: Vec<String>,
}

/// An article ready for purification.
#[derive(Debug, Clone, PartialEq)]
pub struct Article {
    pub id: String,
    pub content: String,
    /// First-pass extraction, already validated.
    pub original: Extraction,
}

impl Article {
    /// Reads an article from its stored JSON. `position` is the fallback id when the record
    /// carries none of the usual identifier fields.
    pub fn from_value(value: &Value, position: usize) -> Result<Self, ArticleError> {
        let object = value.as_object().ok_or(ArticleError::NotAnObject)?;
        let content = object
            .get("content")
            .and_then(Value::as_str)
            .ok_or(ArticleError::MissingField("content"))?;

        Ok(Self {
            id: article_id(object, position),
            content: content.to_string(),
            original: original_extraction(object),
        })
    }
}

fn article_id(object: &Map<String, Value>, position: usize) -> String {
    ID_FIELDS
        .iter()
        .find_map(|field| match object.get(*field)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_else(|| format!("#{position}"))
}

/// True once both purified fields have been written back.
pub fn is_purified(value: &Value) -> bool {
    value.get("purified_entities").is_some() && value.get("purified_triples").is_some()
}

/// Writes the purified fields into the stored article, replacing any previous ones.
pub fn write_back(value: &mut Value, purified: &PurifiedArticle) -> Result<(), ArticleError> {
    let object = value.as_object_mut().ok_or(ArticleError::NotAnObject)?;
    let entities = purified
        .purified_entities
        .iter()
        .map(|(entity_type, names)| {
            let names = names.iter().cloned().map(Value::String).collect();
            (entity_type.as_str().to_string(), Value::Array(names))
        })
        .collect();
    let triples = purified
        .purified_triples
        .iter()
        .cloned()
        .map(Value::String)
        .collect();

    object.insert("purified_entities".into(), Value::Object(entities));
    object.insert("purified_triples".into(), Value::Array(triples));
    Ok(())
}

fn original_extraction(object: &Map<String, Value>) -> Extraction {
    match object.get("entity_relationship") {
        Some(Value::Object(nested)) => extraction_from_fields(nested),
        Some(Value::String(text)) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(nested)) => extraction_from_fields(&nested),
            // Raw first-pass model output.
            _ => extraction_from_text(text),
        },
        _ => extraction_from_fields(object),
    }
}

fn extraction_from_fields(object: &Map<String, Value>) -> Extraction {
    let mut extraction = Extraction::default();
    if let Some(entities) = object.get("entities") {
        collect_entities(entities, &mut extraction);
    }
    if let Some(triples) = TRIPLE_FIELDS.iter().find_map(|f| object.get(*f)) {
        collect_triples(triples, &mut extraction);
    }
    extraction
}

fn extraction_from_text(text: &str) -> Extraction {
    let mut extraction = parse_response(text);
    extraction.triples.extend(find_triples(text));
    extraction
}

fn collect_entities(value: &Value, extraction: &mut Extraction) {
    match value {
        Value::Object(by_type) => {
            for (key, names) in by_type {
                let Some(entity_type) = EntityType::parse(key) else {
                    continue;
                };
                match names {
                    Value::Array(items) => {
                        for name in items.iter().filter_map(Value::as_str) {
                            extraction.add_entity(entity_type, name);
                        }
                    }
                    Value::String(list) => {
                        for name in split_names(list) {
                            extraction.add_entity(entity_type, name);
                        }
                    }
                    _ => {}
                }
            }
        }
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(parsed @ Value::Object(_)) => collect_entities(&parsed, extraction),
            _ => {
                for (entity_type, names) in parse_response(text).entities {
                    extraction.entities.entry(entity_type).or_default().extend(names);
                }
            }
        },
        _ => {}
    }
}

fn collect_triples(value: &Value, extraction: &mut Extraction) {
    match value {
        Value::Array(items) => {
            for item in items {
                let triple = match item {
                    Value::String(line) => find_triples(line).into_iter().next(),
                    Value::Array(fields) => {
                        let fields: Vec<&str> = fields.iter().filter_map(Value::as_str).collect();
                        triple_from_fields(&fields)
                    }
                    _ => None,
                };
                extraction.triples.extend(triple);
            }
        }
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(parsed @ Value::Array(_)) => collect_triples(&parsed, extraction),
            _ => extraction.triples.extend(find_triples(text)),
        },
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Relation, Triple};
    use serde_json::json;

    fn triple(s: &str, r: Relation, o: &str) -> Triple {
        Triple {
            subject: s.into(),
            relation: r,
            object: o.into(),
        }
    }

    #[test]
    fn reads_top_level_fields() {
        let value = json!({
            "news_id": "n-1",
            "content": "VinGroup thành lập VinSmart.",
            "entities": {"enterprise": ["VinGroup", "VinSmart", "null"], "organisation": ["X"]},
            "triplet": ["(VinGroup, branch, VinSmart)", "(SJC,branch,null)", "(A, acquired, B)"]
        });

        let article = Article::from_value(&value, 0).unwrap();

        assert_eq!(article.id, "n-1");
        assert_eq!(
            article.original.entities[&EntityType::Enterprise],
            BTreeSet::from(["VinGroup".to_string(), "VinSmart".to_string()])
        );
        assert_eq!(article.original.entities.len(), 1);
        assert_eq!(
            article.original.triples,
            BTreeSet::from([triple("VinGroup", Relation::Branch, "VinSmart")])
        );
    }

    #[test]
    fn reads_entity_relationship_object_and_json_string() {
        let nested = json!({
            "entities": {"person": ["张勇"]},
            "triplet": [["阿里巴巴集团", "executive", "张勇"]]
        });
        let as_object = json!({"id": 7, "content": "c", "entity_relationship": nested.clone()});
        let as_string = json!({"id": 7, "content": "c", "entity_relationship": nested.to_string()});

        let a = Article::from_value(&as_object, 0).unwrap();
        let b = Article::from_value(&as_string, 0).unwrap();

        assert_eq!(a.id, "7");
        assert_eq!(a.original, b.original);
        assert_eq!(
            a.original.triples,
            BTreeSet::from([triple("阿里巴巴集团", Relation::Executive, "张勇")])
        );
    }

    #[test]
    fn reparses_free_text_entity_relationship() {
        let value = json!({
            "article_id": "a-9",
            "content": "c",
            "entity_relationship": "[enterprise:阿里巴巴集团, 银泰商业集团,\nperson:张勇,\nproject:null,\ntriplet:(阿里巴巴集团, acquisition, 银泰商业集团),(阿里巴巴集团, executive, 张勇)]"
        });

        let article = Article::from_value(&value, 0).unwrap();

        assert_eq!(article.id, "a-9");
        assert_eq!(article.original.entities[&EntityType::Enterprise].len(), 2);
        assert!(!article.original.entities.contains_key(&EntityType::Project));
        assert_eq!(article.original.triples.len(), 2);
    }

    #[test]
    fn unparseable_drift_falls_back_to_empty() {
        let value = json!({"content": "c", "entities": 42, "triples": "nothing here"});
        let article = Article::from_value(&value, 3).unwrap();
        assert!(article.original.is_empty());
        assert_eq!(article.id, "#3");
    }

    #[test]
    fn missing_content_is_an_error() {
        assert_eq!(
            Article::from_value(&json!({"news_id": "x"}), 0),
            Err(ArticleError::MissingField("content"))
        );
        assert_eq!(Article::from_value(&json!([1]), 0), Err(ArticleError::NotAnObject));
    }

    #[test]
    fn write_back_marks_article_purified() {
        let mut value = json!({"news_id": "n-1", "content": "c"});
        assert!(!is_purified(&value));

        let purified = PurifiedArticle {
            purified_entities: EntityType::ALL.into_iter().map(|t| (t, BTreeSet::new())).collect(),
            purified_triples: vec!["(A, branch, B)".into()],
        };
        write_back(&mut value, &purified).unwrap();

        assert!(is_purified(&value));
        assert_eq!(value["content"], "c");
        assert_eq!(value["purified_triples"], json!(["(A, branch, B)"]));
        assert_eq!(value["purified_entities"]["project"], json!([]));
    }
}
