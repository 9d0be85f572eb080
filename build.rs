use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories holding the crate's own Rust sources. Anything else in the
// checkout (vendored material, target/) is left alone.
const SOURCE_ROOTS: [&str; 6] = ["engine", "optimize", "regression", "src", "tests", "benches"];

// Words that describe edit history rather than code.
const HISTORY_WORDS: &str = "FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE";

/// One style rule: a line regex plus a filter deciding which matching lines
/// are real violations.
struct Rule {
    pattern: String,
    accept: fn(&str) -> bool,
    summary: &'static str,
    advice: &'static str,
}

// Collects the offending lines of one file for one rule.
struct Findings {
    accept: fn(&str) -> bool,
    lines: Vec<String>,
}

impl Sink for Findings {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if (self.accept)(text) {
            self.lines.push(format!("{line_number}:{text}"));
        }
        Ok(true)
    }
}

fn is_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("//") || line.contains("/*")
}

fn is_doc_comment(line: &str) -> bool {
    line.trim_start().starts_with("///")
}

// Text of the comment on this line, without its opening marker.
fn comment_body(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix("///") {
        return Some(rest.trim());
    }
    if let Some(rest) = trimmed.strip_prefix("//") {
        return Some(rest.trim());
    }
    let start = line.find("/*")? + 2;
    let rest = &line[start..];
    Some(match rest.find("*/") {
        Some(end) => rest[..end].trim(),
        None => rest.trim(),
    })
}

// An underscore-prefixed name in code, not inside a comment or a string.
fn underscore_in_code(line: &str) -> bool {
    if is_comment(line) {
        return false;
    }
    let quoted_underscore = line
        .split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'));
    !quoted_underscore
}

fn history_word_in_comment(line: &str) -> bool {
    is_comment(line)
}

// Bold markers are allowed in doc comments only.
fn stars_outside_docs(line: &str) -> bool {
    !is_doc_comment(line)
}

fn shouting_comment(line: &str) -> bool {
    match comment_body(line) {
        Some(body) => {
            let mut letters = body.chars().filter(|c| c.is_alphabetic()).peekable();
            letters.peek().is_some() && letters.all(char::is_uppercase)
        }
        None => false,
    }
}

fn always(_: &str) -> bool {
    true
}

fn rules() -> Vec<Rule> {
    vec![
        Rule {
            pattern: r"\b(_[a-zA-Z0-9_]+)\b".to_string(),
            accept: underscore_in_code,
            summary: "underscore-prefixed names",
            advice: "Either use the binding under its plain name or remove it completely.",
        },
        Rule {
            pattern: format!(r"(//|/\*).*(?:{HISTORY_WORDS})"),
            accept: history_word_in_comment,
            summary: "comments narrating edit history",
            advice: "Describe what the code does, not how it came to be.",
        },
        Rule {
            pattern: r"(//|/\*).*\*\*".to_string(),
            accept: stars_outside_docs,
            summary: "'**' in regular comments",
            advice: "Emphasis markers belong in doc comments only.",
        },
        Rule {
            pattern: r"(//|/\*).*".to_string(),
            accept: shouting_comment,
            summary: "comments written entirely in capitals",
            advice: "Rewrite the comment in sentence case or delete it.",
        },
        Rule {
            pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
            accept: always,
            summary: "#[allow(dead_code)] attributes",
            advice: "Either use the item or remove it completely.",
        },
    ]
}

fn rust_sources() -> Vec<PathBuf> {
    SOURCE_ROOTS
        .iter()
        .flat_map(|root| WalkDir::new(root).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
        .collect()
}

fn check_file(searcher: &mut Searcher, rule: &Rule, path: &Path) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(&rule.pattern)?;
    let mut findings = Findings {
        accept: rule.accept,
        lines: Vec::new(),
    };
    searcher.search_path(&matcher, path, &mut findings)?;
    if findings.lines.is_empty() {
        return Ok(());
    }

    let mut message = format!(
        "\n❌ ERROR: Found {} {} in {}:\n",
        findings.lines.len(),
        rule.summary,
        path.display()
    );
    for line in &findings.lines {
        message.push_str(&format!("   {line}\n"));
    }
    message.push_str(&format!("\n⚠️ {}\n", rule.advice));
    Err(message.into())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for root in SOURCE_ROOTS {
        println!("cargo:rerun-if-changed={root}");
    }

    let mut searcher = Searcher::new();
    let sources = rust_sources();
    for rule in rules() {
        for path in &sources {
            if let Err(e) = check_file(&mut searcher, &rule, path) {
                eprintln!("{e}");
                std::process::exit(1);
            }
        }
    }
}
