//! Built-in mapper/reducer registry.
//!
//! Jobs reference user code by an opaque string the worker resolves here:
//! `wordcount`, `grep:<pattern>` and `inverted-index` ship built in. An
//! unresolvable ref fails the attempt as a user-code error, the same as a
//! mapper or reducer failing at runtime.

use crate::error::{MapredError, Result};

pub trait Mapper: Send + Sync {
    /// One input line in, zero or more (key, value) pairs out.
    fn map(&self, line: &str) -> Result<Vec<(String, String)>>;
}

pub trait Reducer: Send + Sync {
    /// One key group in, zero or more (key, value) pairs out.
    fn reduce(&self, key: &str, values: &[String]) -> Result<Vec<(String, String)>>;
}

pub fn resolve_mapper(mapper_ref: &str) -> Result<Box<dyn Mapper>> {
    match mapper_ref {
        "wordcount" => Ok(Box::new(WordCountMapper)),
        "inverted-index" => Ok(Box::new(InvertedIndexMapper)),
        other => {
            if let Some(pattern) = other.strip_prefix("grep:") {
                return Ok(Box::new(GrepMapper {
                    pattern: pattern.to_lowercase(),
                }));
            }
            Err(MapredError::UserCode(format!("unknown mapper ref '{other}'")))
        }
    }
}

pub fn resolve_reducer(reducer_ref: &str) -> Result<Box<dyn Reducer>> {
    match reducer_ref {
        "wordcount" | "grep" => Ok(Box::new(SumReducer)),
        "inverted-index" => Ok(Box::new(InvertedIndexReducer)),
        other => Err(MapredError::UserCode(format!(
            "unknown reducer ref '{other}'"
        ))),
    }
}

/// Lowercased alphanumeric runs, the word boundary rule all built-ins share.
fn words(line: &str) -> impl Iterator<Item = String> + '_ {
    line.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
}

/// (word, 1) per word occurrence.
struct WordCountMapper;

impl Mapper for WordCountMapper {
    fn map(&self, line: &str) -> Result<Vec<(String, String)>> {
        Ok(words(line).map(|w| (w, "1".to_string())).collect())
    }
}

/// Sums integer counts; pairs with `wordcount` and `grep` mappers.
struct SumReducer;

impl Reducer for SumReducer {
    fn reduce(&self, key: &str, values: &[String]) -> Result<Vec<(String, String)>> {
        let mut total: u64 = 0;
        for value in values {
            total += value.parse::<u64>().map_err(|_| {
                MapredError::UserCode(format!("non-numeric count '{value}' for key '{key}'"))
            })?;
        }
        Ok(vec![(key.to_string(), total.to_string())])
    }
}

/// Emits matching lines keyed by their content, so identical matches group.
struct GrepMapper {
    pattern: String,
}

impl Mapper for GrepMapper {
    fn map(&self, line: &str) -> Result<Vec<(String, String)>> {
        if line.to_lowercase().contains(&self.pattern) {
            Ok(vec![(line.trim().to_string(), "1".to_string())])
        } else {
            Ok(Vec::new())
        }
    }
}

/// Expects `doc_id: content` lines; emits (word, doc_id) once per document,
/// skipping one- and two-character words.
struct InvertedIndexMapper;

impl Mapper for InvertedIndexMapper {
    fn map(&self, line: &str) -> Result<Vec<(String, String)>> {
        let Some((doc_id, content)) = line.split_once(':') else {
            // Malformed lines carry no document; nothing to emit.
            return Ok(Vec::new());
        };
        let doc_id = doc_id.trim().to_string();
        let mut seen = std::collections::HashSet::new();
        Ok(words(content)
            .filter(|w| w.len() > 2)
            .filter(|w| seen.insert(w.clone()))
            .map(|w| (w, doc_id.clone()))
            .collect())
    }
}

/// Joins the sorted, de-duplicated document ids for each word.
struct InvertedIndexReducer;

impl Reducer for InvertedIndexReducer {
    fn reduce(&self, key: &str, values: &[String]) -> Result<Vec<(String, String)>> {
        let mut docs: Vec<&String> = values.iter().collect();
        docs.sort();
        docs.dedup();
        let joined = docs
            .iter()
            .map(|d| d.as_str())
            .collect::<Vec<_>>()
            .join(",");
        Ok(vec![(key.to_string(), joined)])
    }
}
