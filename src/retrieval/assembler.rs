use serde_json::Value;

use super::models::{AssembledTool, Candidate};

/// Assembles the final tool list sent to the client: the top `full_tier`
/// candidates are announced verbatim; everything after gets its
/// description truncated to the first sentence (or 80 characters) and every
/// nested `description` field recursively stripped from its input schema,
/// to keep the announced catalog's token footprint small when many tools
/// are in play.
pub struct TieredAssembler {
    pub full_tier: usize,
}

impl TieredAssembler {
    pub fn new(full_tier: usize) -> Self {
        Self { full_tier }
    }

    pub fn assemble(&self, ranked: Vec<Candidate>) -> Vec<AssembledTool> {
        ranked
            .into_iter()
            .enumerate()
            .map(|(i, c)| {
                if i < self.full_tier {
                    AssembledTool {
                        key: c.key,
                        name: c.name,
                        description: c.description,
                        input_schema: c.input_schema,
                    }
                } else {
                    AssembledTool {
                        key: c.key,
                        name: c.name,
                        description: summarize(&c.description),
                        input_schema: strip_descriptions(c.input_schema),
                    }
                }
            })
            .collect()
    }
}

/// First sentence, or the first 80 characters with an ellipsis, whichever
/// is shorter — long descriptions with no sentence break would otherwise
/// pass through untruncated.
fn summarize(description: &str) -> String {
    let first_sentence = description.split(['.', '\n']).next().unwrap_or(description).trim();

    if first_sentence.chars().count() <= 80 {
        if first_sentence.len() == description.trim().len() {
            first_sentence.to_string()
        } else {
            format!("{first_sentence}...")
        }
    } else {
        let truncated: String = first_sentence.chars().take(80).collect();
        format!("{}...", truncated.trim_end())
    }
}

fn strip_descriptions(mut schema: Value) -> Value {
    strip_descriptions_in_place(&mut schema);
    schema
}

fn strip_descriptions_in_place(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.remove("description");
            for v in map.values_mut() {
                strip_descriptions_in_place(v);
            }
        }
        Value::Array(items) => {
            for item in items {
                strip_descriptions_in_place(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn candidate(key: &str, description: &str) -> Candidate {
        Candidate {
            key: key.to_string(),
            name: key.to_string(),
            backend_name: "x".to_string(),
            description: description.to_string(),
            input_schema: json!({
                "type": "object",
                "description": "top level",
                "properties": {
                    "q": {"type": "string", "description": "the query"}
                }
            }),
            score: 1.0,
        }
    }

    #[test]
    fn test_full_tier_preserves_description() {
        let assembler = TieredAssembler::new(1);
        let out = assembler.assemble(vec![candidate("a", "Full description. More detail here.")]);
        assert_eq!(out[0].description, "Full description. More detail here.");
        assert!(out[0].input_schema.get("description").is_some());
    }

    #[test]
    fn test_summary_tier_truncates_and_strips() {
        let assembler = TieredAssembler::new(0);
        let out = assembler.assemble(vec![candidate("a", "Full description. More detail here.")]);
        assert_eq!(out[0].description, "Full description...");
        assert!(out[0].input_schema.get("description").is_none());
        assert!(
            out[0].input_schema["properties"]["q"].get("description").is_none()
        );
    }

    #[test]
    fn test_summarize_long_single_sentence_truncates_at_80_chars() {
        let long = "a".repeat(120);
        let summary = summarize(&long);
        assert!(summary.chars().count() <= 84);
        assert!(summary.ends_with("..."));
    }

    #[test]
    fn test_summarize_short_description_no_ellipsis() {
        assert_eq!(summarize("short"), "short");
    }
}
