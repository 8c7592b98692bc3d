//! Query enhancement: intent labeling and entity extraction.
//!
//! A bypassable layer in front of hybrid search. The enhanced query may
//! spawn auxiliary single-term searches whose candidates are merged into
//! the keyword set; the raw hybrid path stays the ground truth and is
//! what runs when enhancement is off.

/// Coarse intent of a search query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryIntent {
    Search,
    Filter,
    Question,
    Command,
}

#[derive(Debug, Clone)]
pub struct EnhancedQuery {
    pub original: String,
    pub intent: QueryIntent,
    /// Capitalized tokens, email addresses, and quoted phrases.
    pub entities: Vec<String>,
    /// Single terms worth an auxiliary search pass.
    pub auxiliary_terms: Vec<String>,
}

const COMMAND_VERBS: &[&str] = &[
    "create", "delete", "remove", "send", "remind", "schedule", "add", "update", "cancel",
];

const QUESTION_WORDS: &[&str] = &["who", "what", "when", "where", "why", "how", "which"];

const FILTER_MARKERS: &[&str] = &["from:", "to:", "kind:", "source:", "before:", "after:"];

pub fn enhance(query: &str) -> EnhancedQuery {
    let trimmed = query.trim();
    let lower = trimmed.to_lowercase();
    let first_word = lower.split_whitespace().next().unwrap_or("");

    let intent = if FILTER_MARKERS.iter().any(|m| lower.contains(m)) {
        QueryIntent::Filter
    } else if COMMAND_VERBS.contains(&first_word) {
        QueryIntent::Command
    } else if trimmed.ends_with('?') || QUESTION_WORDS.contains(&first_word) {
        QueryIntent::Question
    } else {
        QueryIntent::Search
    };

    let entities = extract_entities(trimmed);
    let auxiliary_terms = entities
        .iter()
        .filter(|e| !e.contains(' '))
        .take(3)
        .cloned()
        .collect();

    EnhancedQuery {
        original: trimmed.to_string(),
        intent,
        entities,
        auxiliary_terms,
    }
}

fn extract_entities(query: &str) -> Vec<String> {
    let mut entities = Vec::new();

    // Quoted phrases first; they are the strongest signal.
    let mut rest = query;
    while let Some(open) = rest.find('"') {
        let tail = &rest[open + 1..];
        let Some(close) = tail.find('"') else { break };
        let phrase = tail[..close].trim();
        if !phrase.is_empty() {
            entities.push(phrase.to_string());
        }
        rest = &tail[close + 1..];
    }

    for token in query.split_whitespace() {
        let cleaned = token.trim_matches(|c: char| !c.is_alphanumeric() && c != '@' && c != '.');
        if cleaned.is_empty() {
            continue;
        }
        let is_email = cleaned.contains('@') && cleaned.contains('.');
        let is_capitalized = cleaned.chars().next().is_some_and(|c| c.is_uppercase())
            && cleaned.chars().any(|c| c.is_lowercase());
        if (is_email || is_capitalized) && !entities.iter().any(|e| e == cleaned) {
            entities.push(cleaned.to_string());
        }
    }

    entities
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_labels() {
        assert_eq!(enhance("find the Apollo notes").intent, QueryIntent::Search);
        assert_eq!(enhance("remind me to call Jane").intent, QueryIntent::Command);
        assert_eq!(enhance("when is the standup?").intent, QueryIntent::Question);
        assert_eq!(enhance("from:jane@example.com budget").intent, QueryIntent::Filter);
    }

    #[test]
    fn entities_include_names_and_emails() {
        let enhanced = enhance("emails from Jane Roe about jane@example.com");
        assert!(enhanced.entities.iter().any(|e| e == "Jane"));
        assert!(enhanced.entities.iter().any(|e| e == "Roe"));
        assert!(enhanced.entities.iter().any(|e| e == "jane@example.com"));
    }

    #[test]
    fn quoted_phrases_are_entities() {
        let enhanced = enhance(r#"notes about "Project Apollo" budget"#);
        assert!(enhanced.entities.iter().any(|e| e == "Project Apollo"));
        // Multi-word phrases are not auxiliary single-term searches.
        assert!(enhanced.auxiliary_terms.iter().all(|t| !t.contains(' ')));
    }

    #[test]
    fn auxiliary_terms_are_capped() {
        let enhanced = enhance("Alpha Beta Gamma Delta Epsilon");
        assert!(enhanced.auxiliary_terms.len() <= 3);
    }
}
