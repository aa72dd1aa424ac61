//! Maps raw failures onto the user-facing error taxonomy.

use analysis_core::{AnalysisError, ErrorCategory, UserFriendlyError, DEMO_TICKERS};

pub const CANCELLED_MESSAGE: &str = "Analysis cancelled.";
pub const CANCELLED_SUGGESTION: &str = "Submit the ticker again whenever you're ready.";

const UNKNOWN_FALLBACK_MESSAGE: &str = "An unexpected error occurred.";
const UNKNOWN_SUGGESTION: &str = "Please try again. If the problem persists, try a different ticker.";

/// How a phrase rule builds its suggestion
enum Suggestion {
    Fixed(&'static str),
    KnownTickers(&'static str),
}

impl Suggestion {
    fn render(&self) -> String {
        match self {
            Suggestion::Fixed(text) => text.to_string(),
            Suggestion::KnownTickers(prefix) => format!("{} {}", prefix, DEMO_TICKERS.join(", ")),
        }
    }
}

struct PhraseRule {
    phrases: &'static [&'static str],
    category: ErrorCategory,
    message: &'static str,
    suggestion: Suggestion,
}

// First match wins
const RULES: &[PhraseRule] = &[
    PhraseRule {
        phrases: &["not available in demo dataset"],
        category: ErrorCategory::Data,
        message: "This ticker isn't available in the demo dataset.",
        suggestion: Suggestion::KnownTickers("Try one of the supported tickers:"),
    },
    PhraseRule {
        phrases: &["not found", "unknown ticker", "invalid ticker"],
        category: ErrorCategory::Data,
        message: "We couldn't find that ticker.",
        suggestion: Suggestion::KnownTickers("Check the symbol, or try a known ticker such as:"),
    },
    PhraseRule {
        phrases: &["timeout", "timed out"],
        category: ErrorCategory::Network,
        message: "The market data provider took too long to respond.",
        suggestion: Suggestion::Fixed("Check your connection and try again in a moment."),
    },
    PhraseRule {
        phrases: &["rate limit", "429"],
        category: ErrorCategory::Network,
        message: "The market data provider is limiting requests right now.",
        suggestion: Suggestion::Fixed("Wait a minute before submitting another analysis."),
    },
    PhraseRule {
        phrases: &["network", "connection", "failed to fetch", "dns"],
        category: ErrorCategory::Network,
        message: "Unable to reach the market data provider.",
        suggestion: Suggestion::Fixed("Check your internet connection and retry."),
    },
    PhraseRule {
        phrases: &["required"],
        category: ErrorCategory::Data,
        message: "Some required information is missing.",
        suggestion: Suggestion::Fixed("Enter a ticker symbol and complete your risk profile."),
    },
    PhraseRule {
        phrases: &["queue is full", "queue full"],
        category: ErrorCategory::Analysis,
        message: "Too many analyses are waiting.",
        suggestion: Suggestion::Fixed("Wait for the current analyses to finish, then try again."),
    },
];

fn category_default(category: ErrorCategory) -> Option<UserFriendlyError> {
    let (message, suggestion) = match category {
        ErrorCategory::Network => (
            "A network error occurred while fetching market data.",
            "Please try again shortly.",
        ),
        ErrorCategory::Data => (
            "The market data for this ticker is incomplete or invalid.",
            "Double-check the ticker or try a different one.",
        ),
        ErrorCategory::Analysis => (
            "The analysis could not be completed.",
            "Try again, or adjust your risk profile.",
        ),
        ErrorCategory::Unknown => return None,
    };
    Some(UserFriendlyError::new(category, message, suggestion))
}

/// Classify a raw failure. Already-classified errors pass through untouched.
pub fn classify(raw: &AnalysisError, fallback: Option<ErrorCategory>) -> UserFriendlyError {
    if let AnalysisError::Classified(err) = raw {
        return err.clone();
    }
    classify_message(&raw.to_string(), fallback)
}

/// Classify free-form failure text.
pub fn classify_message(raw: &str, fallback: Option<ErrorCategory>) -> UserFriendlyError {
    let haystack = raw.to_lowercase();

    if let Some(rule) = RULES
        .iter()
        .find(|rule| rule.phrases.iter().any(|p| haystack.contains(p)))
    {
        return UserFriendlyError::new(rule.category, rule.message, rule.suggestion.render());
    }

    if let Some(err) = fallback.and_then(category_default) {
        return err;
    }

    let raw = raw.trim();
    let message = if raw.is_empty() {
        UNKNOWN_FALLBACK_MESSAGE.to_string()
    } else {
        format!("Something went wrong: {}", raw)
    };
    UserFriendlyError::new(ErrorCategory::Unknown, message, UNKNOWN_SUGGESTION)
}

/// Rejection for a submission that arrives while the queue is saturated
pub fn queue_full(max_queue_len: usize) -> UserFriendlyError {
    UserFriendlyError::new(
        ErrorCategory::Analysis,
        format!("The analysis queue is full ({} waiting).", max_queue_len),
        "Wait for the current analyses to finish, then try again.",
    )
}

/// Failure for an analyzer that raised an error. The raw text is never shown, whatever it says.
pub fn analysis_failed(raw: &AnalysisError) -> UserFriendlyError {
    match raw {
        AnalysisError::Classified(err) => err.clone(),
        _ => category_default(ErrorCategory::Analysis).unwrap_or_else(empty_analysis),
    }
}

/// Failure for an analyzer that returned nothing
pub fn empty_analysis() -> UserFriendlyError {
    UserFriendlyError::new(
        ErrorCategory::Analysis,
        "The analysis returned no result.",
        "Try again, or adjust your risk profile.",
    )
}
