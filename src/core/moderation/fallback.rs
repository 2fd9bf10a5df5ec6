// Static prompt-injection net for text content.
//
// Runs after the classifier and can only turn a safe verdict into an unsafe
// one.

use regex::{RegexSet, RegexSetBuilder};

const INJECTION_PATTERNS: &[&str] = &[
    r"ignore (all|any) (previous|above) (instructions|prompts)",
    r"(disregard|forget) (everything|all) (before|above)",
    r"system prompt",
    r"</?system>",
];

pub struct FallbackFilter {
    patterns: RegexSet,
}

impl FallbackFilter {
    pub fn new() -> Result<Self, regex::Error> {
        let patterns = RegexSetBuilder::new(INJECTION_PATTERNS)
            .case_insensitive(true)
            .build()?;
        Ok(Self { patterns })
    }

    pub fn is_unsafe(&self, text: &str) -> bool {
        if text.trim().is_empty() {
            return false;
        }
        self.patterns.is_match(text)
    }
}
