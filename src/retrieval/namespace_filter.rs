/// Detect an explicit namespace hint in a free-text query, e.g. a user
/// writing "exa: find similar pages" or mentioning a backend name directly.
/// Returns the matched backend name if any configured backend name appears
/// as a whole word in the query.
pub fn detect_namespace_hint(query: &str, known_backends: &[String]) -> Option<String> {
    let lowered = query.to_lowercase();
    known_backends
        .iter()
        .find(|name| {
            let name_lower = name.to_lowercase();
            lowered
                .split(|c: char| !c.is_alphanumeric())
                .any(|word| word == name_lower)
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_mentioned_backend() {
        let backends = vec!["exa".to_string(), "tavily".to_string()];
        assert_eq!(
            detect_namespace_hint("use exa to find similar pages", &backends),
            Some("exa".to_string())
        );
    }

    #[test]
    fn test_no_match_returns_none() {
        let backends = vec!["exa".to_string()];
        assert_eq!(detect_namespace_hint("search the web", &backends), None);
    }

    #[test]
    fn test_substring_is_not_a_match() {
        let backends = vec!["exa".to_string()];
        assert_eq!(detect_namespace_hint("example.com", &backends), None);
    }
}
