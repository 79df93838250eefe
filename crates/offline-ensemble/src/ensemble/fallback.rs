//! Template answers used when the ensemble cannot answer.

pub const DEFAULT_EDUCATIONAL_ANSWER: &str = "I don't have detailed information on that topic yet. \
     Import the ensemble model files to enable AI-powered answers.";

const RSI_ANSWER: &str = "The Relative Strength Index (RSI) measures momentum on a 0-100 scale. \
     Above 70 suggests overbought conditions, below 30 suggests oversold. \
     It helps identify potential reversal points.";

const MACD_ANSWER: &str = "The Moving Average Convergence Divergence (MACD) shows the relationship \
     between two moving averages. Crossovers and divergences can signal trend changes and momentum shifts.";

const VOLUME_ANSWER: &str = "Volume confirms price movements. High volume on breakouts suggests strong \
     conviction, while low volume may indicate weak or false moves.";

const SUPPORT_RESISTANCE_ANSWER: &str = "Support and resistance are price levels where buying or \
     selling pressure tends to emerge. They help identify potential entry and exit points.";

/// Keyword-matched educational answer. First match wins.
pub fn educational_answer(question: &str) -> &'static str {
    let q = question.to_lowercase();
    if q.contains("rsi") {
        RSI_ANSWER
    } else if q.contains("macd") {
        MACD_ANSWER
    } else if q.contains("volume") {
        VOLUME_ANSWER
    } else if q.contains("support") || q.contains("resistance") {
        SUPPORT_RESISTANCE_ANSWER
    } else {
        DEFAULT_EDUCATIONAL_ANSWER
    }
}
