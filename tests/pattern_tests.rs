//! Integration tests for targets-file parsing and pattern matching

use speed_bump::pattern::{load_targets, matches_any, parse_targets, PatternError, TargetPattern};
use std::fs;
use tempfile::TempDir;

fn write_targets(dir: &TempDir, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join("targets.txt");
    fs::write(&path, contents).unwrap();
    path
}

#[test]
fn test_llama_pattern_examples() {
    let patterns = parse_targets("transformers.*:Llama*\n").unwrap();
    let p = &patterns[0];

    assert!(p.matches("transformers.modeling_llama", "LlamaAttention"));
    assert!(p.matches("transformers.tokenization", "LlamaTokenizer"));
    assert!(!p.matches("transformers.modeling_llama", "BertAttention"));
    assert!(!p.matches("torch.nn", "LlamaAttention"));
}

#[test]
fn test_matches_any_empty_is_false() {
    for (m, q) in [("", ""), ("a", "b"), ("transformers", "Llama")] {
        assert!(!matches_any(&[], m, q));
    }
}

#[test]
fn test_matches_any_is_or() {
    let patterns = vec![
        TargetPattern::new("vllm.worker.*", "ModelRunner.execute_model"),
        TargetPattern::new("mypackage.slow_module", "*"),
    ];
    assert!(matches_any(
        &patterns,
        "vllm.worker.model_runner",
        "ModelRunner.execute_model"
    ));
    assert!(matches_any(&patterns, "mypackage.slow_module", "anything"));
    assert!(!matches_any(&patterns, "mypackage.fast_module", "anything"));
}

#[test]
fn test_method_wildcard() {
    let p = TargetPattern::new("transformers.modeling_llama", "LlamaAttention.*");
    assert!(p.matches("transformers.modeling_llama", "LlamaAttention.forward"));
    assert!(p.matches("transformers.modeling_llama", "LlamaAttention."));
    assert!(!p.matches("transformers.modeling_llama", "LlamaAttention"));
}

#[test]
fn test_load_file_skips_blank_and_comment_lines() {
    let dir = TempDir::new().unwrap();
    let path = write_targets(
        &dir,
        "# Match all methods of LlamaAttention\n\
         transformers.modeling_llama:LlamaAttention.*\n\
         \n\
         # Match specific function\n\
         vllm.worker.model_runner : ModelRunner.execute_model\n\
         \n\
         \t# indented comment\n\
         mypackage.slow_module:*\n",
    );

    let patterns = load_targets(&path).unwrap();
    assert_eq!(patterns.len(), 3);
    assert_eq!(patterns[1].module_glob(), "vllm.worker.model_runner");
    assert_eq!(patterns[1].name_glob(), "ModelRunner.execute_model");
    assert_eq!(
        patterns[1].original(),
        "vllm.worker.model_runner : ModelRunner.execute_model"
    );
}

#[test]
fn test_load_file_missing_separator_line_number() {
    let dir = TempDir::new().unwrap();
    let path = write_targets(&dir, "# header\nok:*\n\nmissing_separator\n");

    let err = load_targets(&path).unwrap_err();
    assert!(matches!(err, PatternError::MissingSeparator { line: 4, .. }));
    assert!(err.to_string().contains("Line 4"));
    assert!(err.to_string().contains("missing ':'"));
}

#[test]
fn test_load_file_empty_module_line_number() {
    let dir = TempDir::new().unwrap();
    let path = write_targets(&dir, "a:b\n  :name\n");

    let err = load_targets(&path).unwrap_err();
    assert!(matches!(err, PatternError::EmptyModule { line: 2, .. }));
}

#[test]
fn test_load_file_empty_name_line_number() {
    let dir = TempDir::new().unwrap();
    let path = write_targets(&dir, "\n\n\nmodule:   \n");

    let err = load_targets(&path).unwrap_err();
    assert!(matches!(err, PatternError::EmptyName { line: 4, .. }));
    assert_eq!(err.line(), Some(4));
}

#[test]
fn test_load_comments_only_file_is_empty() {
    let dir = TempDir::new().unwrap();
    let path = write_targets(&dir, "# nothing\n\n   \n# still nothing\n");
    assert!(load_targets(&path).unwrap().is_empty());
}

#[test]
fn test_load_missing_file() {
    let dir = TempDir::new().unwrap();
    let err = load_targets(dir.path().join("absent.txt")).unwrap_err();
    assert!(matches!(err, PatternError::Io { .. }));
}

#[test]
fn test_crlf_line_endings() {
    let patterns = parse_targets("a.*:B*\r\n# c\r\nc:d\r\n").unwrap();
    assert_eq!(patterns.len(), 2);
    assert_eq!(patterns[1].name_glob(), "d");
}

#[test]
fn test_patterns_serialize() {
    let p = TargetPattern::new("app.*", "Slow?");
    let json = serde_json::to_value(&p).unwrap();
    assert_eq!(json["module_glob"], "app.*");
    assert_eq!(json["name_glob"], "Slow?");
    assert_eq!(json["original"], "app.*:Slow?");
}
