//! Integration Test: Panic Prohibition
//!
//! **Policy**: Library code MUST NOT panic on bad input. A panic inside a
//! flow task silently ends that task and leaves its channels dead, so every
//! failure travels as a `Result` or a `failure` channel value instead.
//! **Forbidden**: `.unwrap()`, `.expect(`, `panic!`, `todo!`, `unimplemented!`
//! outside test code.

use architectural_enforcement::scan;

const FORBIDDEN: [&str; 5] = [".unwrap()", ".expect(", "panic!(", "todo!(", "unimplemented!("];

#[test]
fn test_no_panics_in_library_code() {
    let violations: Vec<String> = scan("conductor/core/src")
        .iter()
        .filter(|line| FORBIDDEN.iter().any(|pattern| line.code.contains(pattern)))
        .map(|line| line.describe("Panic path"))
        .collect();

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Panicking calls found in library code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ Use instead:");
        eprintln!("  - `?` with a thiserror variant");
        eprintln!("  - unwrap_or / unwrap_or_default / unwrap_or_else");
        eprintln!("  - a `failure` channel carrying the raw response");

        panic!(
            "\nFound {} panic path(s) in library code.\nFix these before merging!",
            violations.len()
        );
    }
}
