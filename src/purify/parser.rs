//! Parsers for free-text extractor output: entity lines and relation triples.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;

use crate::model::{EntityType, Relation, Triple};

static TRIPLE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\(([^,]+?),\s*([^,]+?),\s*([^,)]+?)\)$").expect("triple line pattern is valid")
});

static TRIPLE_ANYWHERE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\(([^,()]+?),\s*([^,()]+?),\s*([^,()]+?)\)").expect("triple scan pattern is valid")
});

const NAME_SEPARATORS: [char; 3] = [',', '，', '、'];

/// Entities by type plus triples recovered from one extractor response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub entities: BTreeMap<EntityType, BTreeSet<String>>,
    pub triples: BTreeSet<Triple>,
}

impl Extraction {
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.triples.is_empty() && self.entities.values().all(BTreeSet::is_empty)
    }

    pub fn add_entity(&mut self, entity_type: EntityType, name: &str) {
        if let Some(name) = clean_field(name) {
            self.entities.entry(entity_type).or_default().insert(name.to_string());
        }
    }
}

fn clean_field(raw: &str) -> Option<&str> {
    let field = raw.trim();
    (!field.is_empty() && !field.eq_ignore_ascii_case("null")).then_some(field)
}

fn triple_from_parts(subject: &str, relation: &str, object: &str) -> Option<Triple> {
    Some(Triple {
        subject: clean_field(subject)?.to_string(),
        relation: Relation::from_tag(relation.trim())?,
        object: clean_field(object)?.to_string(),
    })
}

/// Validates a whole line as `(subject, relation, object)`.
///
/// Rejects lines with extra text, fewer or more than three fields, empty or `null` fields,
/// and relations outside the allowed set.
pub fn parse_triple(line: &str) -> Option<Triple> {
    let caps = TRIPLE_LINE.captures(line.trim())?;
    triple_from_parts(&caps[1], &caps[2], &caps[3])
}

/// Builds a triple from already-separated fields, e.g. a stored `[s, r, o]` array.
pub fn triple_from_fields(fields: &[&str]) -> Option<Triple> {
    match fields {
        [subject, relation, object] => triple_from_parts(subject, relation, object),
        _ => None,
    }
}

/// Scans arbitrary text for parenthesised triples; used on first-pass output stored as one blob.
pub fn find_triples(text: &str) -> Vec<Triple> {
    TRIPLE_ANYWHERE
        .captures_iter(text)
        .filter_map(|caps| triple_from_parts(&caps[1], &caps[2], &caps[3]))
        .collect()
}

/// Parses `enterprise: A, B` style lines. Leading list markers and brackets are ignored.
pub fn parse_entity_line(line: &str) -> Option<(EntityType, Vec<String>)> {
    let line = line
        .trim()
        .trim_start_matches(['[', '-', '*', ' '])
        .trim_end_matches([']', ',']);
    let (prefix, rest) = line.split_once([':', '：'])?;
    let entity_type = EntityType::parse(prefix)?;
    let names = rest
        .split(NAME_SEPARATORS)
        .filter_map(clean_field)
        .map(str::to_string)
        .collect();
    Some((entity_type, names))
}

/// Splits a bare `A, B，C` list into cleaned names.
pub fn split_names(list: &str) -> impl Iterator<Item = &str> {
    list.split(NAME_SEPARATORS).filter_map(clean_field)
}

/// Parses an extractor response line by line. Unrecognised lines are ignored, so a response
/// with nothing usable yields an empty extraction.
pub fn parse_response(text: &str) -> Extraction {
    let mut extraction = Extraction::default();
    for line in text.lines() {
        if let Some(triple) = parse_triple(line) {
            extraction.triples.insert(triple);
        } else if let Some((entity_type, names)) = parse_entity_line(line) {
            for name in names {
                extraction.add_entity(entity_type, &name);
            }
        }
    }
    extraction
}
