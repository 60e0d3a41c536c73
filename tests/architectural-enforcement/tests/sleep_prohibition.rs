//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Flow, effect and launcher code MUST NOT sleep. Waiting is
//! expressed with `tokio::time::timeout`, `Signal::first_within` or
//! `Signal::interval`, so that deadlines are visible in the graph.
//!
//! **Exceptions**: mock schemas simulating response latency, test code.

use architectural_enforcement::scan;

/// Files allowed to sleep, with the reason
const ALLOWED: [(&str, &str); 1] = [("mock.rs", "simulated response latency")];

#[test]
fn test_no_sleep_in_production_code() {
    let violations: Vec<String> = ["conductor/core/src", "conductor/daemon/src"]
        .iter()
        .flat_map(|dir| scan(dir))
        .filter(|line| line.code.contains("::sleep(") || line.code.contains(".sleep("))
        .filter(|line| !ALLOWED.iter().any(|(file, _)| line.path.ends_with(file)))
        .map(|line| line.describe("Sleep"))
        .collect();

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Sleep calls found in production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ Use instead:");
        eprintln!("  - tokio::time::timeout() around the awaited I/O");
        eprintln!("  - Signal::first_within() for flow deadlines");
        eprintln!("  - Signal::interval() for periodic work");

        panic!(
            "\nFound {} sleep violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}

#[test]
fn test_allowed_files_exist() {
    let files = architectural_enforcement::rust_files("conductor/core/src");
    for (file, reason) in ALLOWED {
        assert!(
            files.iter().any(|path| path.ends_with(file)),
            "allow-listed file {file} ({reason}) no longer exists"
        );
    }
}
