//! Heuristic importance scoring for memory chunks.

/// Baseline score for plain content.
const BASE: f64 = 0.5;

const DECISION_KEYWORDS: [&str; 8] = [
    "decided",
    "decision",
    "agreed",
    "conclusion",
    "must",
    "deadline",
    "requirement",
    "important",
];

const ACTION_KEYWORDS: [&str; 4] = ["todo", "action item", "follow up", "next step"];

/// Score `content` on [0, 1].
///
/// Decisions, action items, and code all boost the score; very short
/// fragments are penalized.
pub fn score_importance(content: &str) -> f64 {
    let lower = content.to_lowercase();
    let mut score = BASE;

    if DECISION_KEYWORDS.iter().any(|k| lower.contains(k)) {
        score += 0.2;
    }
    if ACTION_KEYWORDS.iter().any(|k| lower.contains(k)) {
        score += 0.15;
    }
    if content.contains("```") {
        score += 0.1;
    }
    if content.trim().len() < 40 {
        score -= 0.2;
    }

    score.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_content_scores_baseline() {
        let score = score_importance(
            "The weather in the simulation was mild throughout the afternoon hours.",
        );
        assert!((score - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn decision_keyword_boosts() {
        let score = score_importance(
            "We decided to ship the retrieval change after the benchmark run completed.",
        );
        assert!(score > 0.5);
    }

    #[test]
    fn short_fragment_penalized() {
        assert!(score_importance("ok, sounds good") < 0.5);
    }

    #[test]
    fn code_fence_boosts() {
        let score = score_importance(
            "Here is the final configuration we landed on:\n```toml\nmax = 3\n```",
        );
        assert!(score > 0.5);
    }

    #[test]
    fn always_clamped() {
        let stacked = "IMPORTANT decision agreed: TODO follow up before the deadline. \
                       Must do. ```code``` and more text to pass the length bar.";
        let score = score_importance(stacked);
        assert!((0.0..=1.0).contains(&score));
    }
}
