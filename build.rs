use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

// Only the crate's own sources are linted.
const SOURCE_DIRS: [&str; 4] = ["mapmaking", "cli", "tests", "benches"];

const FORBIDDEN_WORDS: [&str; 14] = [
    "FIXED", "CORRECTED", "FIX", "FIXES", "NEW", "CHANGED", "CHANGES", "CHANGE", "MODIFIED",
    "MODIFIES", "MODIFY", "UPDATED", "UPDATES", "UPDATE",
];

#[derive(Clone, Copy, PartialEq, Eq)]
enum Lint {
    UnderscoreBinding,
    ForbiddenWord,
    StarsInComment,
    UppercaseComment,
    AllowDeadCode,
}

impl Lint {
    fn pattern(self) -> String {
        match self {
            Lint::UnderscoreBinding => r"\b(_[a-zA-Z0-9_]+)\b".to_string(),
            Lint::ForbiddenWord => format!(r"(//|/\*).*(?:{})", FORBIDDEN_WORDS.join("|")),
            Lint::StarsInComment => r"(//|/\*).*\*\*".to_string(),
            Lint::UppercaseComment => r"(//|/\*).*".to_string(),
            Lint::AllowDeadCode => r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
        }
    }

    fn explanation(self) -> &'static str {
        match self {
            Lint::UnderscoreBinding => {
                "Underscore-prefixed names are not allowed. Use the binding or remove it."
            }
            Lint::ForbiddenWord => {
                "Comments must describe the code, not its history. Remove change-log words."
            }
            Lint::StarsInComment => "The '**' pattern is only allowed in doc comments.",
            Lint::UppercaseComment => "Comments written entirely in uppercase are not allowed.",
            Lint::AllowDeadCode => "#[allow(dead_code)] is not allowed. Use the code or delete it.",
        }
    }

    fn accepts(self, line: &str) -> bool {
        let trimmed = line.trim_start();
        match self {
            Lint::UnderscoreBinding => {
                if trimmed.starts_with("//") {
                    return false;
                }
                // Matches between quotes are string contents.
                !line
                    .split('"')
                    .enumerate()
                    .any(|(idx, part)| idx % 2 == 1 && part.contains('_'))
            }
            Lint::ForbiddenWord | Lint::AllowDeadCode => true,
            Lint::StarsInComment => !trimmed.starts_with("///") && !trimmed.starts_with("//!"),
            Lint::UppercaseComment => comment_text(line).is_some_and(|text| {
                let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
                letters.peek().is_some() && letters.all(char::is_uppercase)
            }),
        }
    }
}

fn comment_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix("///") {
        return Some(rest.trim());
    }
    if let Some(rest) = trimmed.strip_prefix("//") {
        return Some(rest.trim());
    }
    let start = line.find("/*")? + 2;
    let body = &line[start..];
    Some(body.find("*/").map_or(body, |end| &body[..end]).trim())
}

struct LintCollector {
    lint: Lint,
    violations: Vec<String>,
}

impl Sink for LintCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if self.lint.accepts(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn rust_sources() -> Vec<PathBuf> {
    SOURCE_DIRS
        .iter()
        .flat_map(|dir| WalkDir::new(dir).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
        .collect()
}

fn scan(lint: Lint, files: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(&lint.pattern())?;
    let mut searcher = Searcher::new();
    for path in files {
        let mut collector = LintCollector {
            lint,
            violations: Vec::new(),
        };
        searcher.search_path(&matcher, path, &mut collector)?;
        if !collector.violations.is_empty() {
            return Err(report(path, lint, &collector.violations).into());
        }
    }
    Ok(())
}

fn report(path: &Path, lint: Lint, violations: &[String]) -> String {
    let mut message = format!(
        "\n❌ ERROR: {} source lint violation(s) in {}:\n",
        violations.len(),
        path.display()
    );
    for violation in violations {
        message.push_str(&format!("   {violation}\n"));
    }
    message.push_str(&format!("\n⚠️ {}\n", lint.explanation()));
    message
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    println!("cargo:rustc-env=DIFFMAP_BUILD_TIMESTAMP={timestamp}");

    let files = rust_sources();
    for lint in [
        Lint::UnderscoreBinding,
        Lint::ForbiddenWord,
        Lint::StarsInComment,
        Lint::UppercaseComment,
        Lint::AllowDeadCode,
    ] {
        if let Err(e) = scan(lint, &files) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
