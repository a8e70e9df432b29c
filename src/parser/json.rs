use regex::Regex;
use serde::de::DeserializeOwned;

/// Parse a model response into `T`, tolerating code fences and surrounding prose
pub fn parse_lenient<T: DeserializeOwned>(raw: &str) -> Option<T> {
    let json_str = extract_json(raw)?;
    match serde_json::from_str::<T>(&json_str) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!("Failed to parse response JSON: {}", e);
            None
        }
    }
}

/// Extract a JSON object or array from a string that might contain markdown code blocks
pub fn extract_json(s: &str) -> Option<String> {
    let trimmed = s.trim();

    // First try: the whole string is valid JSON
    if (trimmed.starts_with('{') || trimmed.starts_with('['))
        && serde_json::from_str::<serde_json::Value>(trimmed).is_ok()
    {
        return Some(trimmed.to_string());
    }

    // Second try: extract from markdown code block
    let re = Regex::new(r"```(?:json)?\s*\n?([\s\S]*?)\n?```").ok()?;
    for cap in re.captures_iter(s) {
        let potential_json = cap.get(1)?.as_str().trim();
        if serde_json::from_str::<serde_json::Value>(potential_json).is_ok() {
            return Some(potential_json.to_string());
        }
    }

    // Third try: first balanced object, then first balanced array
    balanced_slice(s, '{', '}').or_else(|| balanced_slice(s, '[', ']'))
}

fn balanced_slice(s: &str, open: char, close: char) -> Option<String> {
    let start = s.find(open)?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    let mut end = None;

    for (i, c) in s[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    end = Some(start + i + c.len_utf8());
                    break;
                }
            }
            _ => {}
        }
    }

    let potential_json = &s[start..end?];
    serde_json::from_str::<serde_json::Value>(potential_json)
        .ok()
        .map(|_| potential_json.to_string())
}
