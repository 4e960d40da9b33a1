use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories holding this crate's own sources. Everything else in the
// checkout (reference material, build output) is left alone.
const SOURCE_DIRS: &[&str] = &["analysis", "cli", "tests", "benches"];

// One house-style rule: a line regex plus a filter deciding whether a
// matching line really is a violation.
struct Rule {
    name: &'static str,
    pattern: &'static str,
    advice: &'static str,
    is_violation: fn(&str) -> bool,
}

// Collects the offending lines of one file for one rule.
struct RuleCollector {
    is_violation: fn(&str) -> bool,
    violations: Vec<String>,
}

impl Sink for RuleCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if (self.is_violation)(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn is_comment(line: &str) -> bool {
    line.trim_start().starts_with("//")
}

// The text of a `//`, `///` or `//!` comment line.
fn comment_text(line: &str) -> &str {
    line.trim_start().trim_start_matches('/').trim_start_matches('!').trim()
}

// Underscore-prefixed bindings hide unused values; `_` alone is fine.
fn underscore_binding(line: &str) -> bool {
    if is_comment(line) {
        return false;
    }
    // Identifiers inside string literals are not bindings.
    !line
        .split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'))
}

fn change_log_comment(line: &str) -> bool {
    is_comment(line)
}

fn double_star_comment(line: &str) -> bool {
    is_comment(line)
}

fn shouting_comment(line: &str) -> bool {
    if !is_comment(line) {
        return false;
    }
    let letters: Vec<char> = comment_text(line).chars().filter(|c| c.is_alphabetic()).collect();
    letters.len() > 1 && letters.iter().all(|c| c.is_uppercase())
}

fn any_line(line: &str) -> bool {
    !line.is_empty()
}

const RULES: &[Rule] = &[
    Rule {
        name: "underscore-prefixed identifiers",
        pattern: r"\b(_[a-zA-Z0-9_]+)\b",
        advice: "Use the value or drop the binding; `let _ =` is the only allowed discard.",
        is_violation: underscore_binding,
    },
    Rule {
        name: "change-log comments",
        pattern: r"//.*\b(FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE)\b",
        advice: "Comments describe the code as it is, not how it got there.",
        is_violation: change_log_comment,
    },
    Rule {
        name: "'**' in comments",
        pattern: r"//.*\*\*",
        advice: "Comments are plain text; write powers with '^'.",
        is_violation: double_star_comment,
    },
    Rule {
        name: "all-uppercase comments",
        pattern: r"//",
        advice: "Do not shout in comments.",
        is_violation: shouting_comment,
    },
    Rule {
        name: "#[allow(dead_code)] attributes",
        pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        advice: "Use the code or remove it.",
        is_violation: any_line,
    },
];

fn source_files() -> Vec<PathBuf> {
    SOURCE_DIRS
        .iter()
        .filter(|dir| Path::new(dir).is_dir())
        .flat_map(|dir| WalkDir::new(dir).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.path().to_path_buf())
        .collect()
}

fn check(rule: &Rule, files: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(rule.pattern)?;
    let mut searcher = Searcher::new();
    for path in files {
        let mut collector = RuleCollector {
            is_violation: rule.is_violation,
            violations: Vec::new(),
        };
        searcher.search_path(&matcher, path, &mut collector)?;
        if !collector.violations.is_empty() {
            let mut message = format!(
                "\n❌ ERROR: Found {} {} in {}:\n",
                collector.violations.len(),
                rule.name,
                path.display()
            );
            for violation in &collector.violations {
                message.push_str(&format!("   {violation}\n"));
            }
            message.push_str(&format!("\n⚠️ {}\n", rule.advice));
            return Err(message.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    let files = source_files();
    for rule in RULES {
        if let Err(e) = check(rule, &files) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
