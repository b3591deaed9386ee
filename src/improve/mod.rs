//! The self-improvement pipeline: analyzer, versioner, and the orchestrator
//! that gates and sequences them.

pub mod analyzer;
pub mod orchestrator;
pub mod versioner;

pub use analyzer::{AnalysisResult, AnalyzerAgent, Hypothesis, Problem};
pub use orchestrator::{ImprovementOrchestrator, ImprovementResult, DEFAULT_IMPROVEMENT_CONFIDENCE};
pub use versioner::{validate_prompt, NewPromptVersion, PromptChange, VersionerAgent, MAX_PROMPT_LENGTH};

/// Truncate to at most `max` characters (not bytes), safe for multibyte text.
pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::truncate_chars;

    #[test]
    fn test_truncate_chars_multibyte() {
        assert_eq!(truncate_chars("привет мир", 6), "привет");
        assert_eq!(truncate_chars("short", 100), "short");
    }
}
