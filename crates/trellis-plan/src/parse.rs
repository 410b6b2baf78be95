use serde_json::Value;

use trellis_core::{ArtifactGraph, ArtifactSpec};

/// What came back from a plan-generation call. A malformed response is
/// ordinary data, not an error: the caller decides whether to drop the
/// candidate or fail the run.
#[derive(Debug)]
pub enum ParseOutcome {
    Parsed(ArtifactGraph),
    Malformed(String),
}

impl ParseOutcome {
    pub fn is_parsed(&self) -> bool {
        matches!(self, ParseOutcome::Parsed(_))
    }
}

/// Parse a model response into an artifact graph.
///
/// Accepts a bare JSON array of artifacts or an object with an
/// `artifacts` array, optionally wrapped in markdown code fences. Runs
/// exactly one repair pass (trailing-comma removal) before giving up;
/// unknown `requires` ids survive parsing so the health check can flag
/// them, but duplicate ids are malformed.
pub fn parse_plan(text: &str) -> ParseOutcome {
    let json = extract_json(text);
    match build_graph(json) {
        Ok(graph) => ParseOutcome::Parsed(graph),
        Err(first_error) => {
            let repaired = strip_trailing_commas(json);
            match build_graph(&repaired) {
                Ok(graph) => ParseOutcome::Parsed(graph),
                Err(_) => ParseOutcome::Malformed(first_error),
            }
        }
    }
}

fn build_graph(json: &str) -> Result<ArtifactGraph, String> {
    let value: Value = serde_json::from_str(json).map_err(|e| e.to_string())?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("artifacts") {
            Some(Value::Array(items)) => items,
            _ => return Err("object response has no 'artifacts' array".to_string()),
        },
        _ => return Err("response is neither an array nor an object".to_string()),
    };
    if items.is_empty() {
        return Err("plan contains no artifacts".to_string());
    }
    let mut graph = ArtifactGraph::new();
    for item in items {
        let spec: ArtifactSpec = serde_json::from_value(item).map_err(|e| e.to_string())?;
        graph.add(spec).map_err(|e| e.to_string())?;
    }
    Ok(graph)
}

/// Extract the JSON payload from a response that may carry code fences or
/// surrounding prose.
pub(crate) fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    let obj = trimmed.find('{');
    let arr = trimmed.find('[');
    let start = match (obj, arr) {
        (Some(o), Some(a)) => Some(o.min(a)),
        (Some(o), None) => Some(o),
        (None, Some(a)) => Some(a),
        (None, None) => None,
    };
    if let Some(start) = start {
        let close = if trimmed.as_bytes()[start] == b'{' { '}' } else { ']' };
        if let Some(end) = trimmed.rfind(close) {
            if end > start {
                return &trimmed[start..=end];
            }
        }
    }
    trimmed
}

/// Remove commas that sit directly before a closing brace or bracket.
/// String contents are left untouched.
fn strip_trailing_commas(json: &str) -> String {
    let chars: Vec<char> = json.chars().collect();
    let mut out = String::with_capacity(json.len());
    let mut in_string = false;
    let mut escaped = false;
    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            ',' => {
                let mut j = i + 1;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                if j < chars.len() && (chars[j] == '}' || chars[j] == ']') {
                    continue;
                }
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}
