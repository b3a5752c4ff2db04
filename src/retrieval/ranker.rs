use super::models::Candidate;

/// Score deltas smaller than this are treated as a tie, broken by schema
/// richness and then lexically — this keeps ranking stable across runs
/// instead of at the mercy of floating-point noise between near-identical
/// scores.
const TIE_THRESHOLD: f64 = 0.05;

/// Sort candidates by relevance, descending. Ties (|Δscore| < 0.05) are
/// broken first by how many top-level properties the tool's input schema
/// declares (richer tools surface first), then by key ascending for
/// determinism.
pub fn rank(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        let delta = b.score - a.score;
        if delta.abs() < TIE_THRESHOLD {
            schema_property_count(&b.input_schema)
                .cmp(&schema_property_count(&a.input_schema))
                .then_with(|| a.key.cmp(&b.key))
        } else {
            delta.partial_cmp(&0.0).unwrap_or(std::cmp::Ordering::Equal)
        }
    });
    candidates
}

fn schema_property_count(schema: &serde_json::Value) -> usize {
    schema
        .get("properties")
        .and_then(|p| p.as_object())
        .map(|o| o.len())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn candidate(key: &str, score: f64, properties: usize) -> Candidate {
        let mut props = serde_json::Map::new();
        for i in 0..properties {
            props.insert(format!("p{i}"), json!({"type": "string"}));
        }
        Candidate {
            key: key.to_string(),
            name: key.to_string(),
            backend_name: "x".to_string(),
            description: "d".to_string(),
            input_schema: json!({"properties": props}),
            score,
        }
    }

    #[test]
    fn test_sorts_descending() {
        let ranked = rank(vec![candidate("a", 0.2, 0), candidate("b", 0.9, 0)]);
        assert_eq!(ranked[0].key, "b");
    }

    #[test]
    fn test_tie_breaks_by_schema_richness() {
        let ranked = rank(vec![candidate("a", 0.5, 1), candidate("b", 0.52, 3)]);
        // scores within 0.05 of each other -> tie, richer schema wins
        assert_eq!(ranked[0].key, "b");
    }

    #[test]
    fn test_final_tiebreak_by_key() {
        let ranked = rank(vec![candidate("zeta", 0.5, 0), candidate("alpha", 0.51, 0)]);
        assert_eq!(ranked[0].key, "alpha");
    }
}
