//! Architectural Enforcement
//!
//! Source-scanning helpers shared by the enforcement tests in `tests/`:
//! - No sleeping in flow or effect code
//! - No blocking I/O inside async code
//! - No panicking shortcuts in the library
//!
//! Scans are line based. Everything from the first `#[cfg(test)]`-style
//! attribute to the end of a file counts as test code and is skipped.

use std::fs;
use std::path::{Path, PathBuf};

/// Workspace root, two levels above this crate
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join("..")
}

/// One line of production code
#[derive(Debug, Clone)]
pub struct SourceLine {
    /// File the line belongs to
    pub path: PathBuf,
    /// 1-based line number
    pub number: usize,
    /// Full line
    pub text: String,
    /// Text before any `//` comment
    pub code: String,
    /// Innermost enclosing function or block is async
    pub in_async: bool,
}

impl SourceLine {
    /// `path:line - what: text`, for violation reports
    #[must_use]
    pub fn describe(&self, what: &str) -> String {
        format!("{}:{} - {what}: {}", self.path.display(), self.number, self.text.trim())
    }
}

/// Rust files under `dir`, relative to the workspace root
#[must_use]
pub fn rust_files(dir: &str) -> Vec<PathBuf> {
    walkdir::WalkDir::new(workspace_root().join(dir))
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .map(walkdir::DirEntry::into_path)
        .collect()
}

/// Production lines of every Rust file under `dir`
#[must_use]
pub fn scan(dir: &str) -> Vec<SourceLine> {
    rust_files(dir)
        .iter()
        .flat_map(|path| {
            let source = fs::read_to_string(path).unwrap_or_default();
            production_lines(path, &source)
        })
        .collect()
}

/// Production lines of `source`, stopping at the test module
#[must_use]
pub fn production_lines(path: &Path, source: &str) -> Vec<SourceLine> {
    let mut lines = Vec::new();
    let mut in_async = false;

    for (idx, text) in source.lines().enumerate() {
        let trimmed = text.trim_start();
        if is_test_gate(trimmed) {
            break;
        }
        let code = text.split("//").next().unwrap_or(text).to_string();
        if let Some(is_async) = fn_signature(trimmed) {
            in_async = is_async;
        } else if code.contains("async move") || code.contains("async {") {
            in_async = true;
        }
        lines.push(SourceLine {
            path: path.to_path_buf(),
            number: idx + 1,
            text: text.to_string(),
            code,
            in_async,
        });
    }
    lines
}

/// `#[cfg(test)]`, `#[cfg(all(test, unix))]` and friends
fn is_test_gate(trimmed: &str) -> bool {
    trimmed.starts_with("#[cfg(") && trimmed.contains("test")
}

/// `Some(is_async)` when the line opens a function
fn fn_signature(trimmed: &str) -> Option<bool> {
    let mut is_async = false;
    for token in trimmed.split_whitespace() {
        match token {
            "fn" => return Some(is_async),
            "async" => is_async = true,
            "const" | "unsafe" | "extern" => {}
            t if t.starts_with("pub") => {}
            _ => return None,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fn_signature_detection() {
        assert_eq!(fn_signature("pub fn load_config_from<E>("), Some(false));
        assert_eq!(fn_signature("pub(crate) async fn flush(&self) {"), Some(true));
        assert_eq!(fn_signature("async fn write_outbound("), Some(true));
        assert_eq!(fn_signature("let f = fn_ptr;"), None);
        assert_eq!(fn_signature("// fn commented"), None);
    }

    #[test]
    fn test_scan_stops_at_test_module() {
        let source = "fn a() {}\n#[cfg(test)]\nmod tests {\n    fn b() { x.unwrap(); }\n}\n";
        let lines = production_lines(Path::new("x.rs"), source);

        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].code, "fn a() {}");
    }

    #[test]
    fn test_async_context_tracking() {
        let source = "fn sync() {\n    read();\n}\nasync fn run() {\n    read();\n}\nfn spawner() {\n    tokio::spawn(async move {\n        read();\n    });\n}\n";
        let lines = production_lines(Path::new("x.rs"), source);
        let reads: Vec<bool> = lines
            .iter()
            .filter(|l| l.code.contains("read()"))
            .map(|l| l.in_async)
            .collect();

        assert_eq!(reads, vec![false, true, true]);
    }

    #[test]
    fn test_comments_are_not_code() {
        let lines = production_lines(Path::new("x.rs"), "let a = 1; // x.unwrap()\n");
        assert!(!lines[0].code.contains("unwrap"));
    }
}
