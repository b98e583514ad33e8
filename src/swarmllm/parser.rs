//! Tool-call extraction from free-form model output.
//!
//! Local models emit tool invocations in whatever shape their fine-tune
//! favours. This module recognizes the three wire formats the engine
//! supports and funnels them into one [`ParsedCall`] shape:
//!
//! 1. **Tagged XML** — `<server.tool><arg>value</arg></server.tool>`. Only
//!    tags whose name contains a dot are considered, which keeps free-form
//!    XML in prose from matching. Argument values are type-coerced and
//!    nested tags are re-parsed recursively into objects.
//! 2. **JSON object** — a `{"name": ..., "arguments": {...}}` literal,
//!    possibly fenced or embedded in prose. The `name` must be a known tool.
//!    Regions already claimed by the tagged form are blanked out first so a
//!    JSON blob inside an XML argument is not matched twice.
//! 3. **Python fence** — a ```` ```python ```` code block becomes one
//!    synthetic `builtin.execute_python_code` call.
//!
//! [`CompositeParser`] tries the formats in that order (most specific
//! first) and dedupes the results by `(name, sha256(canonical args))`.
//! An empty return means the response is terminal; malformed candidates are
//! silently dropped — callers rely only on the empty/non-empty distinction.
//!
//! # Example
//!
//! ```rust
//! use swarmllm::parser::CompositeParser;
//!
//! let parser = CompositeParser::new().with_known_tools(["builtin.read_file"]);
//!
//! let calls = parser.parse(
//!     "I'll read the file first.\n<builtin.read_file><path>notes.txt</path></builtin.read_file>",
//! );
//! assert_eq!(calls.len(), 1);
//! assert_eq!(calls[0].name, "builtin.read_file");
//! assert_eq!(calls[0].args["path"], "notes.txt");
//! ```

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::ops::Range;

/// One extracted tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCall {
    /// Fully-qualified tool name.
    pub name: String,
    /// JSON-shaped argument map.
    pub args: Map<String, Value>,
}

impl ParsedCall {
    /// Build a call from name and arguments.
    pub fn new(name: impl Into<String>, args: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Dedup fingerprint: sha256 over the name and the canonical (key-sorted)
    /// JSON rendering of the arguments.
    pub fn fingerprint(&self) -> String {
        let mut canonical = String::new();
        canonical_json(&Value::Object(self.args.clone()), &mut canonical);
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update(b"\n");
        hasher.update(canonical.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// A single wire-format recognizer.
///
/// Implementations extract every candidate they can see and drop malformed
/// ones silently; ordering and deduplication are the composite's job.
pub trait CallParser: Send + Sync {
    /// Short identifier for traces.
    fn name(&self) -> &'static str;

    /// Extract zero or more calls from a model response.
    fn try_parse(&self, response: &str) -> Vec<ParsedCall>;
}

/// Recognizer for the tagged XML form.
pub struct TaggedXmlParser;

impl CallParser for TaggedXmlParser {
    fn name(&self) -> &'static str {
        "tagged_xml"
    }

    fn try_parse(&self, response: &str) -> Vec<ParsedCall> {
        parse_tagged(response).into_iter().map(|(_, call)| call).collect()
    }
}

/// Recognizer for the JSON object form.
pub struct JsonObjectParser {
    known_tools: HashSet<String>,
}

impl JsonObjectParser {
    /// Parser that accepts only the given tool names.
    pub fn new(known_tools: HashSet<String>) -> Self {
        Self { known_tools }
    }
}

impl CallParser for JsonObjectParser {
    fn name(&self) -> &'static str {
        "json_object"
    }

    fn try_parse(&self, response: &str) -> Vec<ParsedCall> {
        parse_json_objects(response, &self.known_tools)
    }
}

/// Recognizer for fenced Python blocks.
pub struct PythonBlockParser;

impl CallParser for PythonBlockParser {
    fn name(&self) -> &'static str {
        "python_block"
    }

    fn try_parse(&self, response: &str) -> Vec<ParsedCall> {
        parse_python_blocks(response)
    }
}

/// The composite pipeline: tagged XML, then JSON, then Python fences,
/// deduplicated by `(name, args-hash)`.
pub struct CompositeParser {
    known_tools: HashSet<String>,
}

impl CompositeParser {
    /// Composite with an empty known-tool set (JSON candidates then match
    /// any name; useful in tests).
    pub fn new() -> Self {
        Self {
            known_tools: HashSet::new(),
        }
    }

    /// Restrict the JSON form to the given tool names (builder pattern).
    ///
    /// The engine refreshes this from the backend snapshot at run start.
    pub fn with_known_tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known_tools = names.into_iter().map(Into::into).collect();
        self
    }

    /// Extract every tool call from `response`.
    ///
    /// An empty result means the response is terminal.
    pub fn parse(&self, response: &str) -> Vec<ParsedCall> {
        let tagged = parse_tagged(response);

        // Blank tagged spans so the JSON pass cannot re-match a payload that
        // was already consumed as an XML argument.
        let mut blanked: Vec<u8> = response.as_bytes().to_vec();
        for (span, _) in &tagged {
            for byte in &mut blanked[span.clone()] {
                *byte = b' ';
            }
        }
        let blanked = String::from_utf8(blanked).unwrap_or_else(|_| response.to_string());

        let mut calls: Vec<ParsedCall> = tagged.into_iter().map(|(_, call)| call).collect();
        calls.extend(parse_json_objects(&blanked, &self.known_tools));
        calls.extend(parse_python_blocks(response));

        let mut seen = HashSet::new();
        calls.retain(|call| seen.insert(call.fingerprint()));
        calls
    }
}

impl Default for CompositeParser {
    fn default() -> Self {
        Self::new()
    }
}

impl CallParser for CompositeParser {
    fn name(&self) -> &'static str {
        "composite"
    }

    fn try_parse(&self, response: &str) -> Vec<ParsedCall> {
        self.parse(response)
    }
}

// ── Tagged XML form ──────────────────────────────────────────────────────

fn is_tag_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.'
}

/// Scan for `<server.tool>...</server.tool>` blocks; returns each call with
/// the byte span it occupies.
fn parse_tagged(text: &str) -> Vec<(Range<usize>, ParsedCall)> {
    let mut results = Vec::new();
    let bytes = text.as_bytes();
    let mut pos = 0;

    while let Some(open) = text[pos..].find('<') {
        let start = pos + open;
        let name_start = start + 1;
        let mut name_end = name_start;
        while name_end < bytes.len() && is_tag_char(bytes[name_end] as char) {
            name_end += 1;
        }
        // Require `<name>` with a dotted name; anything else is prose.
        if name_end == name_start
            || name_end >= bytes.len()
            || bytes[name_end] != b'>'
            || !text[name_start..name_end].contains('.')
        {
            pos = start + 1;
            continue;
        }
        let tag = &text[name_start..name_end];
        let body_start = name_end + 1;
        let closing = format!("</{}>", tag);
        match text[body_start..].find(&closing) {
            Some(rel) => {
                let body = &text[body_start..body_start + rel];
                let args = parse_arg_pairs(body)
                    .into_iter()
                    .map(|(key, raw)| (key, coerce_value(&raw)))
                    .collect();
                let end = body_start + rel + closing.len();
                results.push((start..end, ParsedCall::new(tag, args)));
                pos = end;
            }
            None => {
                // Unterminated block: drop it and keep scanning.
                pos = start + 1;
            }
        }
    }
    results
}

/// Extract `<key>value</key>` pairs from a tag body.
fn parse_arg_pairs(body: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let bytes = body.as_bytes();
    let mut pos = 0;

    while let Some(open) = body[pos..].find('<') {
        let start = pos + open;
        let name_start = start + 1;
        let mut name_end = name_start;
        while name_end < bytes.len() && is_tag_char(bytes[name_end] as char) {
            name_end += 1;
        }
        if name_end == name_start || name_end >= bytes.len() || bytes[name_end] != b'>' {
            pos = start + 1;
            continue;
        }
        let key = &body[name_start..name_end];
        let value_start = name_end + 1;
        let closing = format!("</{}>", key);
        match body[value_start..].find(&closing) {
            Some(rel) => {
                pairs.push((key.to_string(), body[value_start..value_start + rel].to_string()));
                pos = value_start + rel + closing.len();
            }
            None => {
                pos = start + 1;
            }
        }
    }
    pairs
}

/// Type-coerce one XML argument value.
///
/// Nested tags become an object (recursively coerced); `true`/`false`/`null`
/// and bare numerics become their JSON types; anything that parses as JSON
/// becomes its parsed form; everything else stays a (trimmed) string.
fn coerce_value(raw: &str) -> Value {
    let trimmed = raw.trim();

    if trimmed.starts_with('<') {
        let nested = parse_arg_pairs(trimmed);
        if !nested.is_empty() {
            let map: Map<String, Value> = nested
                .into_iter()
                .map(|(key, value)| (key, coerce_value(&value)))
                .collect();
            return Value::Object(map);
        }
    }

    match trimmed {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" => return Value::Null,
        _ => {}
    }

    if let Ok(int) = trimmed.parse::<i64>() {
        return Value::from(int);
    }
    if let Ok(float) = trimmed.parse::<f64>() {
        if float.is_finite() {
            return Value::from(float);
        }
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return value;
    }
    Value::String(trimmed.to_string())
}

// ── JSON object form ─────────────────────────────────────────────────────

/// Scan for balanced top-level JSON objects carrying `name` + `arguments`.
///
/// When `known_tools` is non-empty the `name` must be in it; candidates
/// inside a matched object are skipped because the scan resumes past it.
fn parse_json_objects(text: &str, known_tools: &HashSet<String>) -> Vec<ParsedCall> {
    let mut calls = Vec::new();
    let mut pos = 0;

    while let Some(open) = text[pos..].find('{') {
        let start = pos + open;
        match balanced_object_end(&text[start..]) {
            Some(len) => {
                let candidate = &text[start..start + len];
                match extract_json_call(candidate, known_tools) {
                    Some(call) => {
                        calls.push(call);
                        pos = start + len;
                    }
                    None => {
                        pos = start + 1;
                    }
                }
            }
            None => break,
        }
    }
    calls
}

/// Length of the balanced `{...}` starting at byte 0, honoring strings and
/// escapes. `None` when unterminated. Also used by the planner to lift the
/// first JSON object out of a prose-wrapped plan response.
pub(crate) fn balanced_object_end(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (index, c) in text.char_indices() {
        if in_string {
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
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(index + c.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

fn extract_json_call(candidate: &str, known_tools: &HashSet<String>) -> Option<ParsedCall> {
    let value: Value = serde_json::from_str(candidate).ok()?;
    let object = value.as_object()?;
    let name = object.get("name")?.as_str()?.trim();
    let arguments = object.get("arguments")?.as_object()?;
    if name.is_empty() {
        return None;
    }
    if !known_tools.is_empty() && !known_tools.contains(name) {
        return None;
    }
    Some(ParsedCall::new(name, arguments.clone()))
}

// ── Python fence form ────────────────────────────────────────────────────

/// Each ```` ```python ```` block becomes one synthetic
/// `builtin.execute_python_code` call.
fn parse_python_blocks(text: &str) -> Vec<ParsedCall> {
    let mut calls = Vec::new();
    let mut pos = 0;

    while let Some(open) = text[pos..].find("```") {
        let fence_start = pos + open + 3;
        let rest = &text[fence_start..];
        let newline = match rest.find('\n') {
            Some(index) => index,
            None => break,
        };
        let lang = rest[..newline].trim();
        let body_start = fence_start + newline + 1;
        let close = match text[body_start..].find("```") {
            Some(index) => index,
            None => break,
        };
        let body = &text[body_start..body_start + close];
        pos = body_start + close + 3;

        if !(lang.eq_ignore_ascii_case("python") || lang.eq_ignore_ascii_case("py")) {
            continue;
        }
        let code = body.trim_end_matches('\n');
        if code.trim().is_empty() {
            continue;
        }
        let mut args = Map::new();
        args.insert("code".to_string(), Value::String(code.to_string()));
        calls.push(ParsedCall::new("builtin.execute_python_code", args));
    }
    calls
}

// ── Canonical JSON for fingerprints ──────────────────────────────────────

/// Deterministic JSON rendering: object keys sorted, no whitespace. Used
/// only for dedup hashing, never for wire output.
fn canonical_json(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (index, key) in keys.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("string serializes"));
                out.push(':');
                canonical_json(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                canonical_json(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    // Renderers used only by the round-trip tests below.
    fn render_tagged(call: &ParsedCall) -> String {
        let mut out = format!("<{}>", call.name);
        for (key, value) in &call.args {
            let raw = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.push_str(&format!("<{}>{}</{}>", key, raw, key));
        }
        out.push_str(&format!("</{}>", call.name));
        out
    }

    fn render_json(call: &ParsedCall) -> String {
        json!({"name": call.name, "arguments": Value::Object(call.args.clone())}).to_string()
    }

    #[test]
    fn tagged_form_with_coercion() {
        let parser = TaggedXmlParser;
        let calls = parser.try_parse(
            "Sure.\n<fs.copy><src>a.txt</src><count>3</count><force>true</force>\
             <ratio>0.5</ratio><meta>{\"k\": 1}</meta></fs.copy>",
        );
        assert_eq!(calls.len(), 1);
        let call = &calls[0];
        assert_eq!(call.name, "fs.copy");
        assert_eq!(call.args["src"], "a.txt");
        assert_eq!(call.args["count"], 3);
        assert_eq!(call.args["force"], true);
        assert_eq!(call.args["ratio"], 0.5);
        assert_eq!(call.args["meta"], json!({"k": 1}));
    }

    #[test]
    fn tagged_form_requires_dotted_name() {
        let calls = TaggedXmlParser.try_parse("<note>this is not a tool call</note>");
        assert!(calls.is_empty());
    }

    #[test]
    fn tagged_form_parses_nested_xml_recursively() {
        let calls = TaggedXmlParser.try_parse(
            "<db.insert><record><id>7</id><label>seven</label></record></db.insert>",
        );
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].args["record"], json!({"id": 7, "label": "seven"}));
    }

    #[test]
    fn unterminated_tagged_block_is_dropped() {
        let calls = TaggedXmlParser.try_parse("<fs.copy><src>a.txt</src>");
        assert!(calls.is_empty());
    }

    #[test]
    fn json_form_embedded_in_prose_and_fences() {
        let known: HashSet<String> = ["builtin.list_files".to_string()].iter().cloned().collect();
        let parser = JsonObjectParser::new(known);
        let calls = parser.try_parse(
            "Let me list the directory:\n```json\n\
             {\"name\": \"builtin.list_files\", \"arguments\": {\"path\": \"src\"}}\n```\nDone.",
        );
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "builtin.list_files");
        assert_eq!(calls[0].args["path"], "src");
    }

    #[test]
    fn json_form_rejects_unknown_names() {
        let known: HashSet<String> = ["builtin.list_files".to_string()].iter().cloned().collect();
        let parser = JsonObjectParser::new(known);
        let calls =
            parser.try_parse("{\"name\": \"builtin.rm_rf\", \"arguments\": {\"path\": \"/\"}}");
        assert!(calls.is_empty());
    }

    #[test]
    fn json_form_ignores_plain_objects() {
        let parser = JsonObjectParser::new(HashSet::new());
        assert!(parser
            .try_parse("{\"result\": 42, \"status\": \"ok\"}")
            .is_empty());
    }

    #[test]
    fn python_fence_becomes_synthetic_call() {
        let calls = PythonBlockParser.try_parse("Run this:\n```python\nprint('hi')\n```\n");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "builtin.execute_python_code");
        assert_eq!(calls[0].args["code"], "print('hi')");
    }

    #[test]
    fn non_python_fences_ignored() {
        let calls = PythonBlockParser.try_parse("```rust\nfn main() {}\n```");
        assert!(calls.is_empty());
    }

    #[test]
    fn composite_dedupes_across_formats() {
        let parser = CompositeParser::new().with_known_tools(["fs.copy"]);
        // Same call expressed twice: tagged and JSON.
        let response = "<fs.copy><src>a.txt</src></fs.copy>\n\
                        {\"name\": \"fs.copy\", \"arguments\": {\"src\": \"a.txt\"}}";
        let calls = parser.parse(response);
        assert_eq!(calls.len(), 1);
    }

    #[test]
    fn composite_does_not_rematch_json_inside_tagged_args() {
        let parser = CompositeParser::new().with_known_tools(["queue.push"]);
        // The JSON literal is an XML argument; only the tagged call counts.
        let response = "<queue.push><item>{\"name\": \"queue.push\", \"arguments\": {\"item\": 1}}</item></queue.push>";
        let calls = parser.parse(response);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "queue.push");
        // The argument kept its parsed JSON shape.
        assert!(calls[0].args["item"].is_object());
    }

    #[test]
    fn empty_and_prose_responses_are_terminal() {
        let parser = CompositeParser::new();
        assert!(parser.parse("").is_empty());
        assert!(parser.parse("The answer is 42. No tools needed.").is_empty());
    }

    #[test]
    fn preserves_emission_order_within_one_response() {
        let parser = CompositeParser::new().with_known_tools(["fs.read", "fs.stat"]);
        let response = "<fs.read><path>a</path></fs.read>\n<fs.stat><path>b</path></fs.stat>";
        let calls = parser.parse(response);
        let names: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["fs.read", "fs.stat"]);
    }

    #[test]
    fn round_trip_all_three_formats() {
        let canonical_calls = vec![
            ParsedCall::new("builtin.read_file", args(&[("path", json!("src/main.rs"))])),
            ParsedCall::new(
                "builtin.patch_file",
                args(&[
                    ("path", json!("a.txt")),
                    ("changes", json!([{"search": "x", "replace": "y"}])),
                ]),
            ),
            ParsedCall::new(
                "builtin.execute_bash_command",
                args(&[("command", json!("ls -la"))]),
            ),
        ];
        let known: Vec<String> = canonical_calls.iter().map(|c| c.name.clone()).collect();
        let parser = CompositeParser::new().with_known_tools(known);

        for call in &canonical_calls {
            // Tagged XML round trip.
            let parsed = parser.parse(&render_tagged(call));
            assert_eq!(parsed.len(), 1, "tagged: {}", call.name);
            assert_eq!(parsed[0].fingerprint(), call.fingerprint(), "tagged: {}", call.name);

            // JSON object round trip.
            let parsed = parser.parse(&render_json(call));
            assert_eq!(parsed.len(), 1, "json: {}", call.name);
            assert_eq!(parsed[0].fingerprint(), call.fingerprint(), "json: {}", call.name);
        }

        // Python fence round trip for the one tool the format can express.
        let python = ParsedCall::new(
            "builtin.execute_python_code",
            args(&[("code", json!("import os\nprint(os.getcwd())"))]),
        );
        let rendered = format!("```python\n{}\n```", python.args["code"].as_str().unwrap());
        let parsed = parser.parse(&rendered);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].fingerprint(), python.fingerprint());
    }

    #[test]
    fn fingerprint_ignores_key_order() {
        let a = ParsedCall::new("t.x", args(&[("a", json!(1)), ("b", json!(2))]));
        let mut reversed = Map::new();
        reversed.insert("b".to_string(), json!(2));
        reversed.insert("a".to_string(), json!(1));
        let b = ParsedCall::new("t.x", reversed);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }
}
