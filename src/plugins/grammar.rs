//! Parses a plugin's first line of stdout into a status text plus a list of
//! reportable points, in either the native (JSON) or nagios (perf-data)
//! grammar.
//!
//! Grounded on `original_source/src/apps/agent/plugin-check.go`'s perf-data
//! tokenizer (quoted keys, unit stripping) and the native JSON envelope from
//! `plugin.go`.

use crate::error::PluginGrammarError;
use crate::model::OutputGrammar;
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct ParsedPoint {
    pub name: String,
    pub value: f64,
    pub context: Option<String>,
    pub dimensions: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct ParsedOutput {
    pub status_text: String,
    pub points: Vec<ParsedPoint>,
}

#[derive(Debug, Deserialize)]
struct NativeWrite {
    name: String,
    points: Vec<NativePoint>,
}

#[derive(Debug, Deserialize)]
struct NativePoint {
    value: f64,
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    dimensions: Vec<(String, String)>,
}

pub fn parse_first_line(grammar: OutputGrammar, first_line: &str) -> Result<ParsedOutput, PluginGrammarError> {
    match grammar {
        OutputGrammar::Native => parse_native(first_line),
        OutputGrammar::Nagios => parse_nagios(first_line),
    }
}

fn parse_native(line: &str) -> Result<ParsedOutput, PluginGrammarError> {
    let (status_text, rest) = split_once_pipe(line)?;
    let writes: Vec<NativeWrite> = serde_json::from_str(rest.trim()).map_err(|_| PluginGrammarError::UnparseableLine(line.to_string()))?;
    let mut points = Vec::new();
    for write in writes {
        for p in write.points {
            points.push(ParsedPoint {
                name: write.name.clone(),
                value: p.value,
                context: p.context,
                dimensions: p.dimensions,
            });
        }
    }
    Ok(ParsedOutput { status_text, points })
}

fn parse_nagios(line: &str) -> Result<ParsedOutput, PluginGrammarError> {
    let (status_text, rest) = split_once_pipe(line)?;
    let points = tokenize_perf_data(rest.trim())
        .into_iter()
        .filter_map(|(key, value_raw)| parse_perf_value(&value_raw).map(|value| ParsedPoint { name: key, value, context: None, dimensions: Vec::new() }))
        .collect();
    Ok(ParsedOutput { status_text, points })
}

fn split_once_pipe(line: &str) -> Result<(String, &str), PluginGrammarError> {
    let idx = line.find('|').ok_or_else(|| PluginGrammarError::UnparseableLine(line.to_string()))?;
    Ok((line[..idx].trim().to_string(), &line[idx + 1..]))
}

/// Splits nagios perf-data into `(key, raw_value)` pairs. Keys may be
/// single-quoted, with `''` inside a quoted key meaning a literal `'`.
fn tokenize_perf_data(data: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for token in data.split_whitespace() {
        let Some(eq) = find_unquoted_eq(token) else { continue };
        let (key_raw, value_raw) = (&token[..eq], &token[eq + 1..]);
        let key = unquote_key(key_raw);
        out.push((key, value_raw.to_string()));
    }
    out
}

fn find_unquoted_eq(token: &str) -> Option<usize> {
    let bytes = token.as_bytes();
    let mut in_quote = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => in_quote = !in_quote,
            b'=' if !in_quote => return Some(i),
            _ => {}
        }
        i += 1;
    }
    None
}

fn unquote_key(raw: &str) -> String {
    if raw.starts_with('\'') && raw.ends_with('\'') && raw.len() >= 2 {
        raw[1..raw.len() - 1].replace("''", "'")
    } else {
        raw.to_string()
    }
}

const UNITS: &[&str] = &["us", "ms", "KB", "MB", "GB", "s", "B", "%", "c"];

/// Strips the first trailing unit and any `;...` warn/crit/min/max suffix,
/// then parses the remaining numeric prefix.
fn parse_perf_value(raw: &str) -> Option<f64> {
    let value_part = raw.split(';').next().unwrap_or(raw);
    let stripped = UNITS.iter().find_map(|unit| value_part.strip_suffix(unit)).unwrap_or(value_part);
    stripped.parse::<f64>().ok()
}

/// Maps a subprocess exit code to the canonical plugin state name.
pub fn state_name(exit_code: i32) -> Result<&'static str, PluginGrammarError> {
    match exit_code {
        0 => Ok("ok"),
        1 => Ok("warning"),
        2 => Ok("critical"),
        3 => Ok("unknown"),
        other => Err(PluginGrammarError::UnknownStateCode(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nagios_perf_data_with_units_and_thresholds() {
        let out = parse_nagios("OK - disk usage | 'disk usage'=72%;80;90;0;100 load=1.5").unwrap();
        assert_eq!(out.status_text, "OK - disk usage");
        let usage = out.points.iter().find(|p| p.name == "disk usage").unwrap();
        assert_eq!(usage.value, 72.0);
        let load = out.points.iter().find(|p| p.name == "load").unwrap();
        assert_eq!(load.value, 1.5);
    }

    #[test]
    fn drops_unparseable_perf_entries() {
        let out = parse_nagios("status | bogus=notanumber good=5c").unwrap();
        assert_eq!(out.points.len(), 1);
        assert_eq!(out.points[0].name, "good");
        assert_eq!(out.points[0].value, 5.0);
    }

    #[test]
    fn parses_native_json_writes() {
        let line = r#"healthy | [{"name":"latency","points":[{"value":12.5,"context":"p99"}]}]"#;
        let out = parse_native(line).unwrap();
        assert_eq!(out.status_text, "healthy");
        assert_eq!(out.points.len(), 1);
        assert_eq!(out.points[0].value, 12.5);
        assert_eq!(out.points[0].context.as_deref(), Some("p99"));
    }

    #[test]
    fn maps_exit_codes_to_state_names() {
        assert_eq!(state_name(0).unwrap(), "ok");
        assert_eq!(state_name(2).unwrap(), "critical");
        assert!(state_name(7).is_err());
    }
}
