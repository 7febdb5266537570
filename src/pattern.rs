//! Target patterns: `module_glob:name_glob`
//!
//! A targets file lists the call sites to slow down, one pattern per line:
//!
//! ```text
//! # every method of LlamaAttention
//! transformers.modeling_llama:LlamaAttention.*
//!
//! # one specific function
//! vllm.worker.model_runner:ModelRunner.execute_model
//!
//! # everything in a module
//! mypackage.slow_module:*
//! ```
//!
//! Blank lines and lines starting with `#` are skipped. Whitespace around
//! the first `:` is insignificant. A line without `:`, or with an empty
//! half, is rejected with its 1-based line number.
//!
//! Globs support `*` (zero or more characters) and `?` (exactly one
//! character). Matching is anchored to the whole string and case-sensitive.
//! There are no character classes and no escapes.

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Errors produced while parsing or loading target patterns
#[derive(Error, Debug)]
pub enum PatternError {
    #[error("Line {line}: invalid pattern '{text}' - missing ':' separator (expected module_glob:name_glob)")]
    MissingSeparator { line: usize, text: String },

    #[error("Line {line}: empty module pattern in '{text}'")]
    EmptyModule { line: usize, text: String },

    #[error("Line {line}: empty name pattern in '{text}'")]
    EmptyName { line: usize, text: String },

    #[error("failed to read targets file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PatternError {
    /// 1-based line number of the offending pattern, if the error has one
    pub fn line(&self) -> Option<usize> {
        match self {
            PatternError::MissingSeparator { line, .. }
            | PatternError::EmptyModule { line, .. }
            | PatternError::EmptyName { line, .. } => Some(*line),
            PatternError::Io { .. } => None,
        }
    }
}

/// One compiled `module_glob:name_glob` pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TargetPattern {
    module_glob: String,
    name_glob: String,
    original: String,
}

impl TargetPattern {
    /// Build a pattern from its two globs
    ///
    /// # Example
    /// ```
    /// use speed_bump::pattern::TargetPattern;
    ///
    /// let p = TargetPattern::new("transformers.*", "Llama*");
    /// assert!(p.matches("transformers.modeling_llama", "LlamaAttention"));
    /// assert!(!p.matches("torch.nn", "LlamaAttention"));
    /// assert_eq!(p.original(), "transformers.*:Llama*");
    /// ```
    pub fn new(module_glob: impl Into<String>, name_glob: impl Into<String>) -> Self {
        let module_glob = module_glob.into();
        let name_glob = name_glob.into();
        let original = format!("{}:{}", module_glob, name_glob);
        Self {
            module_glob,
            name_glob,
            original,
        }
    }

    pub fn module_glob(&self) -> &str {
        &self.module_glob
    }

    pub fn name_glob(&self) -> &str {
        &self.name_glob
    }

    /// The pattern line as it appeared in the source (trimmed)
    pub fn original(&self) -> &str {
        &self.original
    }

    /// Both globs must match: module against `module`, name against `qualified_name`
    pub fn matches(&self, module: &str, qualified_name: &str) -> bool {
        glob_match(&self.module_glob, module) && glob_match(&self.name_glob, qualified_name)
    }
}

impl FromStr for TargetPattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_pattern(s.trim(), 1)
    }
}

impl std::fmt::Display for TargetPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.original)
    }
}

/// True if any pattern matches (short-circuits; false for an empty slice)
pub fn matches_any(patterns: &[TargetPattern], module: &str, qualified_name: &str) -> bool {
    patterns.iter().any(|p| p.matches(module, qualified_name))
}

/// Anchored glob match supporting `*` and `?`
///
/// Greedy two-pointer matcher with single-star backtracking: linear in the
/// common case, `O(p * t)` worst case, no allocation.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p = pattern.as_bytes();
    let t = text.as_bytes();
    let (mut pi, mut ti) = (0usize, 0usize);
    // (pattern index just past the last '*', text index it is anchored at)
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() {
            match p[pi] {
                b'*' => {
                    pi += 1;
                    backtrack = Some((pi, ti));
                    continue;
                }
                b'?' => {
                    pi += 1;
                    ti += char_len_at(text, ti);
                    continue;
                }
                byte if byte == t[ti] => {
                    pi += 1;
                    ti += 1;
                    continue;
                }
                _ => {}
            }
        }

        // Mismatch: let the last '*' swallow one more character
        match backtrack {
            Some((star_pi, star_ti)) => {
                let next_ti = star_ti + char_len_at(text, star_ti);
                backtrack = Some((star_pi, next_ti));
                pi = star_pi;
                ti = next_ti;
            }
            None => return false,
        }
    }

    p[pi..].iter().all(|&b| b == b'*')
}

/// Byte width of the UTF-8 character starting at `index`
fn char_len_at(text: &str, index: usize) -> usize {
    text[index..].chars().next().map_or(1, char::len_utf8)
}

/// Parse one already-trimmed, non-comment pattern line
pub fn parse_pattern(line: &str, line_number: usize) -> Result<TargetPattern, PatternError> {
    let Some((module, name)) = line.split_once(':') else {
        return Err(PatternError::MissingSeparator {
            line: line_number,
            text: line.to_string(),
        });
    };

    let module = module.trim();
    let name = name.trim();

    if module.is_empty() {
        return Err(PatternError::EmptyModule {
            line: line_number,
            text: line.to_string(),
        });
    }
    if name.is_empty() {
        return Err(PatternError::EmptyName {
            line: line_number,
            text: line.to_string(),
        });
    }

    Ok(TargetPattern {
        module_glob: module.to_string(),
        name_glob: name.to_string(),
        original: line.to_string(),
    })
}

/// Parse the contents of a targets file
pub fn parse_targets(contents: &str) -> Result<Vec<TargetPattern>, PatternError> {
    let mut patterns = Vec::new();

    for (index, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        patterns.push(parse_pattern(line, index + 1)?);
    }

    Ok(patterns)
}

/// Read and parse a targets file
pub fn load_targets<P: AsRef<Path>>(path: P) -> Result<Vec<TargetPattern>, PatternError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|source| PatternError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_targets(&contents)
}
