//! JSON decoding with contextual error reporting.

use anyhow::Result;

/// Decode a JSON body and, on failure, include the serde path (when one
/// exists) plus a snippet of the offending line with a column indicator.
pub fn decode_json<T: serde::de::DeserializeOwned>(body: &str) -> Result<T> {
    let jd = &mut serde_json::Deserializer::from_str(body);
    match serde_path_to_error::deserialize(jd) {
        Ok(value) => Ok(value),
        Err(err) => {
            let inner = err.inner();
            let (line, column) = (inner.line(), inner.column());
            let path = err.path().to_string();

            let msg = inner.to_string();
            let loc = format!(" at line {line} column {column}");
            let msg = msg.strip_suffix(&loc).unwrap_or(&msg).to_string();

            let mut out = String::new();
            if !path.is_empty() && path != "." {
                out.push_str(&format!("at path '{path}': "));
            }
            out.push_str(&format!(
                "{msg} (line {line} col {column})\n{}",
                snippet_at(body, line, column)
            ));

            Err(anyhow::anyhow!(out))
        }
    }
}

/// Build a `...slice...` excerpt of the failing line with a `^` under the
/// error column.
///
/// The body is arbitrary upstream bytes, so every slice offset is clamped
/// to a char boundary before indexing.
fn snippet_at(body: &str, line: usize, column: usize) -> String {
    let target = body.lines().nth(line.saturating_sub(1)).unwrap_or("");
    if target.is_empty() {
        return "(empty line)".to_string();
    }

    // column is 1-based
    let error_idx = floor_char_boundary(target, column.saturating_sub(1));
    let start = floor_char_boundary(target, error_idx.saturating_sub(10));
    let end = ceil_char_boundary(target, error_idx + 10);

    let indicator = " ".repeat(target[start..error_idx].chars().count()) + "^";
    format!("...{}...\n   {indicator}", &target[start..end])
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn decodes_valid_json() {
        let value: Value = decode_json(r#"{"client.dll": {"dwViewMatrix": 26173600}}"#).unwrap();
        assert_eq!(value["client.dll"]["dwViewMatrix"], 26173600);
    }

    #[test]
    fn malformed_json_includes_location_snippet() {
        let result: Result<Value> = decode_json(r#"{"client.dll": {"dwViewMatrix": }}"#);
        let msg = result.unwrap_err().to_string();
        assert!(msg.contains("line 1"));
        assert!(msg.contains('^'));
    }

    #[test]
    fn truncated_body_reports_error() {
        let result: Result<Value> = decode_json(r#"{"client.dll":"#);
        assert!(result.is_err());
    }

    #[test]
    fn multibyte_body_near_error_does_not_panic() {
        // Error column lands inside a run of multibyte characters.
        let result: Result<Value> = decode_json(r#"{"ééééééé": }"#);
        let msg = result.unwrap_err().to_string();
        assert!(msg.contains('^'));

        // Upstream serving a non-ASCII HTML error page instead of JSON.
        let result: Result<Value> = decode_json("<html>página no encontrada — über alles</html>");
        assert!(result.is_err());
    }
}
