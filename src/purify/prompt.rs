use std::fmt::Write;

use super::article::Article;
use crate::llm::Message;
use crate::model::{EntityType, Relation};

fn system_prompt() -> String {
    let relations = Relation::ALL.map(Relation::as_str).join(", ");
    format!(
        "You extract business entities and relations from news text. \
         Entity types: enterprise, person, location, project. \
         Allowed relations: {relations}. \
         Review the previous extraction against the text, keep what the text supports and add what is missing. \
         Answer with one line per entity type, e.g. `enterprise: A, B`, followed by one triple per line \
         in the form `(subject, relation, object)`. Never output null or empty fields and no other text."
    )
}

pub fn build_messages(article: &Article) -> Vec<Message> {
    let mut user = format!("Text:\n{}\n\nPrevious entities:\n", article.content.trim());
    for entity_type in EntityType::ALL {
        let names = article
            .original
            .entities
            .get(&entity_type)
            .map(|names| names.iter().map(String::as_str).collect::<Vec<_>>().join(", "))
            .unwrap_or_default();
        let _ = writeln!(user, "{entity_type}: {names}");
    }
    user.push_str("\nPrevious triples:\n");
    for triple in &article.original.triples {
        let _ = writeln!(user, "{triple}");
    }

    vec![Message::system(system_prompt()), Message::user(user)]
}
