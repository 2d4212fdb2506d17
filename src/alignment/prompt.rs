use serde_json::Value;

use crate::llm::Message;
use crate::model::{CandidateMatch, EntityType, LangPair, VerifiedPair};

const SYSTEM_PROMPT: &str = "You are a multilingual entity alignment expert. \
Confirm only candidates that denote exactly the same real-world entity as the source: \
an official translation or standard transliteration, the same entity type and matching core attributes. \
Reject look-alike spellings and unrelated entities with similar sounds. Never guess. \
Reply with JSON only, in the form {\"matches\": [[\"source entity\", \"equal\", \"target entity\"]]}. \
Reply {\"matches\": []} when nothing matches.";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("no JSON object in response")]
    NoJsonObject,

    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("response has no \"matches\" list")]
    MissingMatches,
}

pub fn build_messages(
    source: &str,
    entity_type: EntityType,
    pair: LangPair,
    candidates: &[CandidateMatch],
) -> Vec<Message> {
    let candidate_list = candidates
        .iter()
        .enumerate()
        .map(|(i, c)| {
            format!(
                "{}. {} (type: {}, similarity: {:.4})",
                i + 1,
                c.name,
                c.entity_type,
                c.similarity
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let user = format!(
        "Source entity ({source_lang}): {source}\n\
         Type: {entity_type}\n\
         Target language: {target_lang}\n\
         Candidates:\n{candidate_list}\n\n\
         List every candidate that is the same entity as the source.",
        source_lang = pair.source.display_name(),
        target_lang = pair.target.display_name(),
    );

    vec![Message::system(SYSTEM_PROMPT), Message::user(user)]
}

/// Extracts `equal` triples from a verification response.
///
/// The JSON object is located between the first `{` and the last `}` so that prose or code
/// fences around it are tolerated. Entries that are not three strings with `equal` in the
/// middle are dropped; a response without a decodable `matches` list is an error.
pub fn parse_matches(response: &str, pair: LangPair) -> Result<Vec<VerifiedPair>, ParseError> {
    let (Some(start), Some(end)) = (response.find('{'), response.rfind('}')) else {
        return Err(ParseError::NoJsonObject);
    };
    if end < start {
        return Err(ParseError::NoJsonObject);
    }

    let data: Value = serde_json::from_str(&response[start..=end])
        .map_err(|e| ParseError::InvalidJson(e.to_string()))?;
    let matches = data
        .get("matches")
        .and_then(Value::as_array)
        .ok_or(ParseError::MissingMatches)?;

    Ok(matches
        .iter()
        .filter_map(|item| match item.as_array()?.as_slice() {
            [Value::String(source), Value::String(relation), Value::String(target)]
                if relation == "equal" =>
            {
                let (source, target) = (source.trim(), target.trim());
                (!source.is_empty() && !target.is_empty())
                    .then(|| VerifiedPair::new(source, target, pair))
            }
            _ => None,
        })
        .collect())
}
