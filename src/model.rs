//! Shared domain types: entity kinds, languages, embedded records, triples and verified pairs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Entity kinds recognised by extraction, retrieval and purification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Enterprise,
    Person,
    Location,
    Project,
}

impl EntityType {
    pub const ALL: [EntityType; 4] = [
        EntityType::Enterprise,
        EntityType::Person,
        EntityType::Location,
        EntityType::Project,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Enterprise => "enterprise",
            EntityType::Person => "person",
            EntityType::Location => "location",
            EntityType::Project => "project",
        }
    }

    /// Lenient lookup used on extractor output: trims and ignores case.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(raw))
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lang {
    Zh,
    Vi,
    Th,
}

impl Lang {
    pub fn code(self) -> &'static str {
        match self {
            Lang::Zh => "zh",
            Lang::Vi => "vi",
            Lang::Th => "th",
        }
    }

    /// English language name used in oracle prompts.
    pub fn display_name(self) -> &'static str {
        match self {
            Lang::Zh => "Chinese",
            Lang::Vi => "Vietnamese",
            Lang::Th => "Thai",
        }
    }
}

impl fmt::Display for Lang {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LangParseError {
    #[error("unknown language tag '{0}' (expected zh, vi or th)")]
    UnknownLang(String),

    #[error("invalid language pair '{0}' (expected e.g. 'zh->vi')")]
    InvalidPair(String),
}

impl FromStr for Lang {
    type Err = LangParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zh" => Ok(Lang::Zh),
            "vi" => Ok(Lang::Vi),
            "th" | "thai" => Ok(Lang::Th),
            other => Err(LangParseError::UnknownLang(other.to_string())),
        }
    }
}

/// Directed language pair, written `zh->vi`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LangPair {
    pub source: Lang,
    pub target: Lang,
}

impl LangPair {
    pub const DEFAULTS: [LangPair; 3] = [
        LangPair::new(Lang::Zh, Lang::Vi),
        LangPair::new(Lang::Zh, Lang::Th),
        LangPair::new(Lang::Vi, Lang::Th),
    ];

    pub const fn new(source: Lang, target: Lang) -> Self {
        Self { source, target }
    }
}

impl fmt::Display for LangPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.source, self.target)
    }
}

impl FromStr for LangPair {
    type Err = LangParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (source, target) = s
            .split_once("->")
            .ok_or_else(|| LangParseError::InvalidPair(s.to_string()))?;
        let pair = LangPair::new(source.parse()?, target.parse()?);
        if pair.source == pair.target {
            return Err(LangParseError::InvalidPair(s.to_string()));
        }
        Ok(pair)
    }
}

impl Serialize for LangPair {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LangPair {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// An embedded entity as persisted by the embedding stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    #[serde(rename = "entity")]
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub vector: Vec<f32>,
}

/// A same-type entity in another language proposed as a duplicate of a source entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateMatch {
    #[serde(rename = "entity")]
    pub name: String,
    pub similarity: f32,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
}

/// Marker for the only relation the verification step keeps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Equal {
    #[default]
    Equal,
}

/// A cross-lingual equivalence confirmed by the verification oracle.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VerifiedPair {
    pub source: String,
    #[serde(default)]
    pub relation: Equal,
    pub target: String,
    pub source_lang: Lang,
    pub target_lang: Lang,
}

impl VerifiedPair {
    pub fn new(source: impl Into<String>, target: impl Into<String>, pair: LangPair) -> Self {
        Self {
            source: source.into(),
            relation: Equal::Equal,
            target: target.into(),
            source_lang: pair.source,
            target_lang: pair.target,
        }
    }
}

/// Closed set of relation tags a purified triple may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Relation {
    Cooperation,
    Lawsuit,
    Investment,
    Acquisition,
    Branch,
    LegalRepresentative,
    Executive,
    Shareholder,
    RegisteredAddress,
    BranchAddress,
    WorkAddress,
    Belong,
    Participate,
}

impl Relation {
    pub const ALL: [Relation; 13] = [
        Relation::Cooperation,
        Relation::Lawsuit,
        Relation::Investment,
        Relation::Acquisition,
        Relation::Branch,
        Relation::LegalRepresentative,
        Relation::Executive,
        Relation::Shareholder,
        Relation::RegisteredAddress,
        Relation::BranchAddress,
        Relation::WorkAddress,
        Relation::Belong,
        Relation::Participate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Relation::Cooperation => "cooperation",
            Relation::Lawsuit => "lawsuit",
            Relation::Investment => "investment",
            Relation::Acquisition => "acquisition",
            Relation::Branch => "branch",
            Relation::LegalRepresentative => "legal_representative",
            Relation::Executive => "executive",
            Relation::Shareholder => "shareholder",
            Relation::RegisteredAddress => "registered_address",
            Relation::BranchAddress => "branch_address",
            Relation::WorkAddress => "work_address",
            Relation::Belong => "belong",
            Relation::Participate => "participate",
        }
    }

    /// Exact tag lookup. Relations outside the set (including case variants) are rejected.
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.as_str() == tag)
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated `(subject, relation, object)` relation instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Triple {
    pub subject: String,
    pub relation: Relation,
    pub object: String,
}

impl fmt::Display for Triple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.subject, self.relation, self.object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lang_pair_round_trips_through_display() {
        let pair: LangPair = "zh->vi".parse().unwrap();
        assert_eq!(pair, LangPair::new(Lang::Zh, Lang::Vi));
        assert_eq!(pair.to_string(), "zh->vi");
    }

    #[test]
    fn lang_pair_rejects_same_language_and_garbage() {
        assert!(matches!(
            "zh->zh".parse::<LangPair>(),
            Err(LangParseError::InvalidPair(_))
        ));
        assert!(matches!(
            "zh-vi".parse::<LangPair>(),
            Err(LangParseError::InvalidPair(_))
        ));
        assert!(matches!(
            "zh->fr".parse::<LangPair>(),
            Err(LangParseError::UnknownLang(_))
        ));
    }

    #[test]
    fn entity_type_parse_is_lenient() {
        assert_eq!(EntityType::parse(" Enterprise "), Some(EntityType::Enterprise));
        assert_eq!(EntityType::parse("organisation"), None);
    }

    #[test]
    fn relation_lookup_is_exact() {
        assert_eq!(Relation::from_tag("work_address"), Some(Relation::WorkAddress));
        assert_eq!(Relation::from_tag("Work_Address"), None);
        assert_eq!(Relation::from_tag("acquired"), None);
        assert_eq!(Relation::ALL.len(), 13);
    }

    #[test]
    fn verified_pair_serializes_equal_relation() {
        let pair = VerifiedPair::new("阿里巴巴集团", "Alibaba Group", LangPair::new(Lang::Zh, Lang::Vi));
        let json = serde_json::to_value(&pair).unwrap();
        assert_eq!(json["relation"], "equal");
        assert_eq!(json["source_lang"], "zh");
        assert_eq!(json["target_lang"], "vi");
    }

    #[test]
    fn entity_record_uses_persisted_field_names() {
        let record: EntityRecord = serde_json::from_value(serde_json::json!({
            "entity": "VinGroup",
            "type": "enterprise",
            "vector": [0.5, 0.5]
        }))
        .unwrap();
        assert_eq!(record.name, "VinGroup");
        assert_eq!(record.entity_type, EntityType::Enterprise);
    }

    #[test]
    fn triple_display_is_canonical() {
        let triple = Triple {
            subject: "VinGroup".into(),
            relation: Relation::Branch,
            object: "VinSmart".into(),
        };
        assert_eq!(triple.to_string(), "(VinGroup, branch, VinSmart)");
    }
}
