use std::collections::HashSet;
use std::sync::OnceLock;

use super::models::Candidate;
use crate::registry::ToolEntry;

const NAME_TOKEN_WEIGHT: f64 = 2.0;
const NAMESPACE_HINT_BOOST: f64 = 1.5;

fn stopwords() -> &'static HashSet<&'static str> {
    static STOPWORDS: OnceLock<HashSet<&'static str>> = OnceLock::new();
    STOPWORDS.get_or_init(|| {
        [
            "a", "an", "and", "the", "of", "to", "in", "on", "for", "with", "is", "are", "be",
            "this", "that", "it", "or", "as", "at", "by", "from",
        ]
        .into_iter()
        .collect()
    })
}

/// Tokenize on underscores and any non-alphanumeric boundary, lowercase,
/// drop stopwords and single-character tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| c == '_' || !c.is_alphanumeric())
        .filter(|t| t.len() > 1 && !stopwords().contains(t))
        .map(String::from)
        .collect()
}

/// TF-IDF-style keyword retriever over the tool catalog.
///
/// Name tokens count double toward term frequency (a query term hitting the
/// tool's own name is a much stronger signal than hitting its description).
/// A caller-supplied namespace hint (e.g. the server the user just
/// mentioned) multiplies matching tools' score by a flat boost rather than
/// folding into term frequency, since it's a structural signal, not a
/// lexical one.
pub struct Retriever;

impl Retriever {
    /// Score every entry in `pool` against `query`, returning only tools
    /// with a nonzero score.
    pub fn search(
        query: &str,
        pool: &[(String, ToolEntry)],
        namespace_hint: Option<&str>,
    ) -> Vec<Candidate> {
        let query_terms = tokenize(query);
        if query_terms.is_empty() {
            return Vec::new();
        }

        let docs: Vec<(String, ToolEntry, Vec<String>, Vec<String>)> = pool
            .iter()
            .map(|(key, entry)| {
                let name_tokens = tokenize(&entry.name);
                let desc_tokens = tokenize(&entry.description);
                (key.clone(), entry.clone(), name_tokens, desc_tokens)
            })
            .collect();

        let n = docs.len().max(1) as f64;
        let mut df: std::collections::HashMap<&str, f64> = std::collections::HashMap::new();
        for term in &query_terms {
            let count = docs
                .iter()
                .filter(|(_, _, name, desc)| name.iter().chain(desc).any(|t| t == term))
                .count();
            df.insert(term.as_str(), count as f64);
        }

        let mut results = Vec::new();
        for (key, entry, name_tokens, desc_tokens) in docs {
            let mut score = 0.0;
            for term in &query_terms {
                let name_hits = name_tokens.iter().filter(|t| *t == term).count() as f64;
                let desc_hits = desc_tokens.iter().filter(|t| *t == term).count() as f64;
                if name_hits == 0.0 && desc_hits == 0.0 {
                    continue;
                }
                let tf = name_hits * NAME_TOKEN_WEIGHT + desc_hits;
                let doc_freq = df.get(term.as_str()).copied().unwrap_or(1.0);
                let idf = ((n + 1.0) / (doc_freq + 1.0)).ln() + 1.0;
                score += tf * idf;
            }

            if score <= 0.0 {
                continue;
            }

            // Normalize against the theoretical max for this query (every
            // term hitting the name) so scores land in a comparable range
            // before the namespace boost and the final clamp.
            let max_possible: f64 = query_terms
                .iter()
                .map(|t| {
                    let doc_freq = df.get(t.as_str()).copied().unwrap_or(1.0);
                    let idf = ((n + 1.0) / (doc_freq + 1.0)).ln() + 1.0;
                    NAME_TOKEN_WEIGHT * idf
                })
                .sum();
            let mut normalized = if max_possible > 0.0 { score / max_possible } else { 0.0 };

            if let Some(hint) = namespace_hint
                && entry.backend_name.eq_ignore_ascii_case(hint)
            {
                normalized *= NAMESPACE_HINT_BOOST;
            }

            let clamped = normalized.clamp(0.0, 1.0);

            results.push(Candidate {
                key,
                name: entry.name.clone(),
                backend_name: entry.backend_name.clone(),
                description: entry.description.clone(),
                input_schema: entry.input_schema.clone(),
                score: clamped,
            });
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(name: &str, desc: &str, backend: &str) -> ToolEntry {
        ToolEntry {
            name: name.to_string(),
            description: desc.to_string(),
            backend_name: backend.to_string(),
            input_schema: json!({}),
            enabled: true,
            stale: false,
        }
    }

    #[test]
    fn test_tokenize_drops_stopwords_and_single_chars() {
        let tokens = tokenize("get_the_current_time_a");
        assert_eq!(tokens, vec!["get", "current", "time"]);
    }

    #[test]
    fn test_empty_query_returns_nothing() {
        let pool = vec![("exa__web_search".to_string(), entry("web_search", "Search the web", "exa"))];
        assert!(Retriever::search("the a", &pool, None).is_empty());
    }

    #[test]
    fn test_name_match_scores_higher_than_description_only() {
        let pool = vec![
            ("exa__web_search".to_string(), entry("web_search", "Does lookups", "exa")),
            ("exa__lookup".to_string(), entry("lookup", "Search the web for info", "exa")),
        ];
        let results = Retriever::search("search", &pool, None);
        let web_search_score = results.iter().find(|c| c.key == "exa__web_search").map(|c| c.score);
        let lookup_score = results.iter().find(|c| c.key == "exa__lookup").map(|c| c.score);
        assert!(web_search_score.is_none() || lookup_score.is_none() || web_search_score > lookup_score);
    }

    #[test]
    fn test_namespace_hint_boosts_matching_backend() {
        let pool = vec![
            ("exa__search".to_string(), entry("search", "Search", "exa")),
            ("tavily__search".to_string(), entry("search", "Search", "tavily")),
        ];
        let results = Retriever::search("search", &pool, Some("tavily"));
        let exa = results.iter().find(|c| c.key == "exa__search").unwrap();
        let tavily = results.iter().find(|c| c.key == "tavily__search").unwrap();
        assert!(tavily.score >= exa.score);
    }

    #[test]
    fn test_scores_clamped_to_unit_interval() {
        let pool = vec![("exa__search".to_string(), entry("search", "search search search", "exa"))];
        let results = Retriever::search("search", &pool, Some("exa"));
        assert!(results[0].score <= 1.0);
    }
}
