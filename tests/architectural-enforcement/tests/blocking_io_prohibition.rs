//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Async code in the core and the launcher MUST NOT block the
//! event loop. The launcher runs every flow on one current-thread runtime,
//! so a single blocking call stalls the whole graph.
//! **Required**: `tokio::fs`, `tokio::process`, `tokio::io`, async `reqwest`.
//! **Acceptable**: blocking calls in non-async functions that run before the
//! runtime serves the graph (configuration loading, PID file handling).

use architectural_enforcement::{scan, SourceLine};

const FORBIDDEN: [(&str, &str); 6] = [
    ("std::fs::", "Blocking file I/O"),
    ("std::net::", "Blocking network I/O"),
    ("std::process::Command", "Blocking process I/O"),
    ("std::thread::sleep", "Thread sleep"),
    ("reqwest::blocking", "Blocking HTTP client"),
    ("std::io::stdin()", "Blocking stdin"),
];

fn violations_in(lines: &[SourceLine]) -> Vec<String> {
    let imports_std_fs = |line: &SourceLine| {
        lines
            .iter()
            .any(|l| l.path == line.path && l.code.trim_start().starts_with("use std::fs"))
    };

    let mut violations = Vec::new();
    for line in lines.iter().filter(|l| l.in_async) {
        for (pattern, what) in FORBIDDEN {
            if line.code.contains(pattern) {
                violations.push(line.describe(what));
            }
        }
        let bare_fs = line.code.contains("fs::")
            && !line.code.contains("tokio::fs::")
            && !line.code.contains("std::fs::");
        if bare_fs && imports_std_fs(line) {
            violations.push(line.describe("Blocking file I/O"));
        }
    }
    violations
}

#[test]
fn test_no_blocking_io_in_async_code() {
    let lines: Vec<SourceLine> = ["conductor/core/src", "conductor/daemon/src"]
        .iter()
        .flat_map(|dir| scan(dir))
        .collect();
    let violations = violations_in(&lines);

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Blocking I/O calls found in async code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ REQUIRED async I/O:");
        eprintln!("  - tokio::fs::read().await, tokio::fs::write().await");
        eprintln!("  - tokio::process::Command::spawn()");
        eprintln!("  - tokio::io::stdin() / stdout()");

        panic!(
            "\nFound {} blocking I/O violation(s) in async code.\nFix these before merging!",
            violations.len()
        );
    }
}

#[test]
fn test_detector_flags_blocking_read_in_async_fn() {
    let source = "use std::fs;\nasync fn load() {\n    let a = fs::read_to_string(p);\n    let b = std::fs::read(p);\n    let c = tokio::fs::read(p).await;\n}\nfn sync() {\n    let d = fs::read(p);\n}\n";
    let lines = architectural_enforcement::production_lines(std::path::Path::new("x.rs"), source);

    let violations = violations_in(&lines);

    assert_eq!(violations.len(), 2, "{violations:?}");
    assert!(violations[0].starts_with("x.rs:3"));
    assert!(violations[1].starts_with("x.rs:4"));
}
