//! Textual scanner for `@skill_command` decorated functions.
//!
//! Command metadata is extracted straight from the script source; no
//! interpreter is ever started. The decorator kwargs carry the command
//! record; the function signature yields the JSON-Schema input contract
//! (annotations map to JSON types, parameters without defaults become
//! `required`, internal parameters are excluded).

use std::collections::HashMap;
use std::path::Path;

use omnihive_schema::ToolRecord;
use serde_json::json;

use crate::bundle::SkillManifest;

const DECORATOR: &str = "@skill_command";
const INTERNAL_PARAMS: &[&str] = &["self", "cls", "ctx"];

/// Scan one script module for decorated commands. A command that cannot
/// be parsed is skipped with a warning; the rest of the module survives.
pub fn scan_script(manifest: &SkillManifest, script: &Path, source: &str) -> Vec<ToolRecord> {
    let mut records = Vec::new();
    let mut search_from = 0;

    while let Some(offset) = source[search_from..].find(DECORATOR) {
        let deco_start = search_from + offset;
        match parse_command_at(manifest, script, source, deco_start) {
            Ok((record, next)) => {
                records.push(record);
                search_from = next;
            }
            Err(reason) => {
                tracing::warn!(
                    "skipping command in {} at byte {deco_start}: {reason}",
                    script.display()
                );
                search_from = deco_start + DECORATOR.len();
            }
        }
    }
    records
}

fn parse_command_at(
    manifest: &SkillManifest,
    script: &Path,
    source: &str,
    deco_start: usize,
) -> Result<(ToolRecord, usize), String> {
    let after_deco = deco_start + DECORATOR.len();

    // Decorator kwargs are optional: `@skill_command` alone is legal.
    let (kwargs, sig_search_start) = match next_non_ws(source, after_deco) {
        Some((idx, '(')) => {
            let close = find_balanced(source, idx).ok_or("unbalanced decorator parens")?;
            (parse_kwargs(&source[idx + 1..close]), close + 1)
        }
        _ => (HashMap::new(), after_deco),
    };

    let def_idx = find_def(source, sig_search_start).ok_or("no function definition follows")?;
    let open_paren = source[def_idx..]
        .find('(')
        .map(|i| def_idx + i)
        .ok_or("function definition has no parameter list")?;
    let fn_name = source[def_idx..open_paren]
        .trim_start_matches("async")
        .trim()
        .trim_start_matches("def")
        .trim()
        .to_string();
    if fn_name.is_empty() {
        return Err("could not read function name".into());
    }
    let close_paren = find_balanced(source, open_paren).ok_or("unbalanced signature parens")?;
    let params_src = &source[open_paren + 1..close_paren];

    let inject_root = kwargs
        .get("inject_root")
        .map(|v| v == "True")
        .unwrap_or(false);
    let inject_settings: Vec<String> = kwargs
        .get("inject_settings")
        .map(|v| parse_string_list(v))
        .unwrap_or_default();

    let input_schema = build_input_schema(params_src, inject_root, &inject_settings);

    let command_name = kwargs
        .get("name")
        .map(|v| unquote(v))
        .unwrap_or_else(|| fn_name.clone());

    let record = ToolRecord {
        skill_name: manifest.name.clone(),
        command_name,
        description: kwargs.get("description").map(|v| unquote(v)).unwrap_or_default(),
        input_schema,
        routing_keywords: manifest.routing_keywords.clone(),
        intents: manifest.intents.clone(),
        category: kwargs.get("category").map(|v| unquote(v)),
        file_path: script.display().to_string(),
        weight: kwargs
            .get("weight")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1.0),
        cache_ttl_seconds: kwargs
            .get("cache_ttl")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        pure: kwargs.get("pure").map(|v| v == "True").unwrap_or(false),
        isolated: kwargs.get("isolated").map(|v| v == "True").unwrap_or(true),
    };
    Ok((record, close_paren + 1))
}

fn build_input_schema(
    params_src: &str,
    inject_root: bool,
    inject_settings: &[String],
) -> serde_json::Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();

    for raw in split_top_level(params_src) {
        let param = raw.trim();
        if param.is_empty() || param.starts_with('*') {
            continue;
        }
        let (head, default) = match split_once_top_level(param, '=') {
            Some((head, default)) => (head.trim(), Some(default.trim())),
            None => (param, None),
        };
        let (name, annotation) = match split_once_top_level(head, ':') {
            Some((name, annotation)) => (name.trim(), Some(annotation.trim())),
            None => (head.trim(), None),
        };

        if INTERNAL_PARAMS.contains(&name)
            || inject_settings.iter().any(|s| s == name)
            || (inject_root && (name == "root" || name == "project_root"))
        {
            continue;
        }

        let json_type = annotation.map(python_type_to_json).unwrap_or("string");
        properties.insert(name.to_string(), json!({ "type": json_type }));
        if default.is_none() {
            required.push(serde_json::Value::String(name.to_string()));
        }
    }

    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Map a Python annotation to a JSON-Schema type name. `Optional[X]`
/// unwraps to X; unknown annotations default to string.
fn python_type_to_json(annotation: &str) -> &'static str {
    let trimmed = annotation.trim();
    let base = trimmed
        .strip_prefix("Optional[")
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(trimmed);
    let head = base.split(['[', '.']).next().unwrap_or(base).trim();
    match head {
        "str" => "string",
        "int" => "integer",
        "float" => "number",
        "bool" => "boolean",
        "list" | "List" | "tuple" | "Tuple" => "array",
        "dict" | "Dict" => "object",
        "None" => "null",
        _ => "string",
    }
}

fn next_non_ws(source: &str, from: usize) -> Option<(usize, char)> {
    source[from..]
        .char_indices()
        .find(|(_, c)| !c.is_whitespace())
        .map(|(i, c)| (from + i, c))
}

/// Find the next `def` / `async def` at the start of a line, skipping
/// stacked decorators and comments in between.
fn find_def(source: &str, from: usize) -> Option<usize> {
    let mut idx = from;
    for line in source[from..].lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("def ") || trimmed.starts_with("async def ") {
            let indent = line.len() - trimmed.len();
            return Some(idx + indent);
        }
        // Another @skill_command before any def means this one is orphaned.
        if trimmed.starts_with(DECORATOR) && idx > from {
            return None;
        }
        idx += line.len() + 1;
    }
    None
}

/// Index of the `)` balancing the `(` at `open_idx`, string-aware.
fn find_balanced(source: &str, open_idx: usize) -> Option<usize> {
    let bytes = source.as_bytes();
    let mut depth = 0usize;
    let mut in_string: Option<u8> = None;
    let mut i = open_idx;
    while i < bytes.len() {
        let c = bytes[i];
        if let Some(quote) = in_string {
            if c == b'\\' {
                i += 2;
                continue;
            }
            if c == quote {
                in_string = None;
            }
        } else {
            match c {
                b'"' | b'\'' => in_string = Some(c),
                b'(' | b'[' | b'{' => depth += 1,
                b')' | b']' | b'}' => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        return Some(i);
                    }
                }
                _ => {}
            }
        }
        i += 1;
    }
    None
}

/// Split on top-level commas, respecting nesting and string literals.
fn split_top_level(src: &str) -> Vec<&str> {
    let bytes = src.as_bytes();
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut in_string: Option<u8> = None;
    let mut start = 0usize;
    let mut i = 0usize;
    while i < bytes.len() {
        let c = bytes[i];
        if let Some(quote) = in_string {
            if c == b'\\' {
                i += 2;
                continue;
            }
            if c == quote {
                in_string = None;
            }
        } else {
            match c {
                b'"' | b'\'' => in_string = Some(c),
                b'(' | b'[' | b'{' => depth += 1,
                b')' | b']' | b'}' => depth = depth.saturating_sub(1),
                b',' if depth == 0 => {
                    parts.push(&src[start..i]);
                    start = i + 1;
                }
                _ => {}
            }
        }
        i += 1;
    }
    if start < src.len() {
        parts.push(&src[start..]);
    }
    parts
}

/// Split on the first top-level occurrence of `sep`.
fn split_once_top_level(src: &str, sep: char) -> Option<(&str, &str)> {
    let bytes = src.as_bytes();
    let mut depth = 0usize;
    let mut in_string: Option<u8> = None;
    let mut i = 0usize;
    while i < bytes.len() {
        let c = bytes[i];
        if let Some(quote) = in_string {
            if c == b'\\' {
                i += 2;
                continue;
            }
            if c == quote {
                in_string = None;
            }
        } else {
            match c {
                b'"' | b'\'' => in_string = Some(c),
                b'(' | b'[' | b'{' => depth += 1,
                b')' | b']' | b'}' => depth = depth.saturating_sub(1),
                _ if depth == 0 && c == sep as u8 => {
                    return Some((&src[..i], &src[i + 1..]));
                }
                _ => {}
            }
        }
        i += 1;
    }
    None
}

fn parse_kwargs(src: &str) -> HashMap<String, String> {
    let mut kwargs = HashMap::new();
    for part in split_top_level(src) {
        if let Some((key, value)) = split_once_top_level(part, '=') {
            kwargs.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    kwargs
}

fn unquote(raw: &str) -> String {
    let trimmed = raw.trim();
    if (trimmed.starts_with('"') && trimmed.ends_with('"') && trimmed.len() >= 2)
        || (trimmed.starts_with('\'') && trimmed.ends_with('\'') && trimmed.len() >= 2)
    {
        trimmed[1..trimmed.len() - 1].to_string()
    } else {
        trimmed.to_string()
    }
}

fn parse_string_list(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    let inner = trimmed
        .strip_prefix('[')
        .and_then(|r| r.strip_suffix(']'))
        .unwrap_or(trimmed);
    split_top_level(inner)
        .into_iter()
        .map(|s| unquote(s.trim()))
        .filter(|s| !s.is_empty())
        .collect()
}
