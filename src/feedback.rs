//! Feedback detection and classification
//!
//! Classifies user messages as feedback about the assistant's previous
//! response. Pattern matching is the primary, cheap path; an LLM
//! classification is the fallback for short messages the patterns can't
//! decide on.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::agent::llm::{ChatMessage, ReasoningSession};

/// Default confidence a negative feedback must reach to trigger improvement.
pub const DEFAULT_FEEDBACK_CONFIDENCE: f64 = 0.8;

/// Polarity of detected feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackType {
    Positive,
    Negative,
    Neutral,
}

impl FeedbackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackType::Positive => "positive",
            FeedbackType::Negative => "negative",
            FeedbackType::Neutral => "neutral",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "positive" => FeedbackType::Positive,
            "negative" => FeedbackType::Negative,
            _ => FeedbackType::Neutral,
        }
    }
}

/// What aspect of the response the feedback is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackCategory {
    Verbosity,
    Accuracy,
    Clarity,
    Format,
    Tone,
    Relevance,
    General,
    /// User explicitly invoked the feedback command.
    Explicit,
}

impl FeedbackCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackCategory::Verbosity => "verbosity",
            FeedbackCategory::Accuracy => "accuracy",
            FeedbackCategory::Clarity => "clarity",
            FeedbackCategory::Format => "format",
            FeedbackCategory::Tone => "tone",
            FeedbackCategory::Relevance => "relevance",
            FeedbackCategory::General => "general",
            FeedbackCategory::Explicit => "explicit",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "verbosity" => FeedbackCategory::Verbosity,
            "accuracy" => FeedbackCategory::Accuracy,
            "clarity" => FeedbackCategory::Clarity,
            "format" => FeedbackCategory::Format,
            "tone" => FeedbackCategory::Tone,
            "relevance" => FeedbackCategory::Relevance,
            "explicit" => FeedbackCategory::Explicit,
            _ => FeedbackCategory::General,
        }
    }
}

/// Detected feedback from a user message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feedback {
    #[serde(rename = "type")]
    pub feedback_type: FeedbackType,
    pub category: FeedbackCategory,
    pub raw_text: String,
    /// Detection confidence in [0.0, 1.0].
    pub confidence: f64,
    pub triggered_improvement: bool,
}

impl Feedback {
    /// Feedback supplied explicitly by the user; always actionable.
    pub fn explicit(text: impl Into<String>) -> Self {
        Self {
            feedback_type: FeedbackType::Negative,
            category: FeedbackCategory::Explicit,
            raw_text: text.into(),
            confidence: 1.0,
            triggered_improvement: true,
        }
    }

    /// Whether this feedback should kick off an improvement cycle.
    pub fn should_trigger_improvement(&self, confidence_threshold: f64) -> bool {
        if self.feedback_type == FeedbackType::Negative
            && self.confidence >= confidence_threshold
        {
            return true;
        }
        self.category == FeedbackCategory::Explicit
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Patterns that indicate negative feedback (Russian and English).
const NEGATIVE_PATTERNS: &[&str] = &[
    // Russian
    r"слишком (длинн|коротк|сложн|прост|многословн)",
    r"не (понял|понятно|то|так|верно|правильно)",
    r"(плохо|ужасно|отвратительно|некачественно)",
    r"(неправильн|ошиб|некорректн|неверн)",
    r"можно (короче|проще|понятнее|лучше|яснее)",
    r"это (бред|чушь|ерунда|неправда)",
    r"не (работает|помогло|подходит)",
    r"(переделай|исправь|измени)",
    r"(запутал|непонятн|сложн)",
    // English
    r"too (long|short|complex|simple|verbose)",
    r"(wrong|incorrect|inaccurate|false)",
    r"(bad|terrible|awful|poor)",
    r"(confusing|unclear|hard to understand)",
    r"(fix|redo|change|improve) (this|it|that)",
    r"doesn'?t (work|help|make sense)",
    r"not (right|correct|what I (asked|wanted|meant))",
];

/// Patterns that indicate positive feedback.
const POSITIVE_PATTERNS: &[&str] = &[
    // Russian
    r"(спасибо|благодар)",
    r"(отлично|супер|круто|класс|здорово|прекрасно)",
    r"(помогло|работает|получилось|понял)",
    r"то что нужно",
    r"(идеально|perfect|великолепно)",
    r"(хорошо|норм|нормально|ок|okay)",
    // English
    r"(thanks|thank you)",
    r"(great|excellent|awesome|perfect|wonderful)",
    r"(helped|works|worked|got it)",
    r"(exactly|just) what I (needed|wanted)",
    r"(good|nice|well done)",
];

/// Keywords per category, checked against the lowercased message. Order
/// matters: the first category with the highest score wins ties.
const CATEGORY_KEYWORDS: &[(FeedbackCategory, &[&str])] = &[
    (
        FeedbackCategory::Verbosity,
        &[
            "длинн", "коротк", "многословн", "кратк", "подробн",
            "long", "short", "verbose", "brief", "concise", "detailed",
        ],
    ),
    (
        FeedbackCategory::Accuracy,
        &[
            "неправильн", "ошиб", "некорректн", "неверн", "правильн",
            "wrong", "incorrect", "error", "mistake", "accurate", "right",
        ],
    ),
    (
        FeedbackCategory::Clarity,
        &[
            "понятн", "ясн", "сложн", "запутан", "прост",
            "clear", "unclear", "confusing", "simple", "understand",
        ],
    ),
    (
        FeedbackCategory::Format,
        &[
            "формат", "оформлен", "структур", "код", "список",
            "format", "structure", "code", "list", "layout",
        ],
    ),
    (
        FeedbackCategory::Tone,
        &[
            "тон", "грубо", "формальн", "неформальн", "вежлив",
            "tone", "rude", "formal", "informal", "polite",
        ],
    ),
    (
        FeedbackCategory::Relevance,
        &[
            "не то", "не о том", "другое", "тему", "вопрос",
            "off-topic", "irrelevant", "different", "topic", "question",
        ],
    ),
];

static NEGATIVE_RES: Lazy<Vec<Regex>> = Lazy::new(|| compile_patterns(NEGATIVE_PATTERNS));
static POSITIVE_RES: Lazy<Vec<Regex>> = Lazy::new(|| compile_patterns(POSITIVE_PATTERNS));

fn compile_patterns(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(&format!("(?i){}", p))
                .unwrap_or_else(|e| panic!("invalid feedback pattern '{}': {}", p, e))
        })
        .collect()
}

/// Messages with fewer whitespace-separated tokens than this are sent to the
/// LLM fallback when patterns are ambiguous.
const LLM_FALLBACK_MAX_TOKENS: usize = 15;

/// Detects and classifies feedback in user messages.
pub struct FeedbackClassifier {
    session: Option<Arc<dyn ReasoningSession>>,
}

impl FeedbackClassifier {
    /// Pattern-only classifier; ambiguous short messages return None.
    pub fn new() -> Self {
        Self { session: None }
    }

    /// Classifier with an LLM fallback for ambiguous short messages.
    pub fn with_session(session: Arc<dyn ReasoningSession>) -> Self {
        Self {
            session: Some(session),
        }
    }

    /// Detect feedback in a user message. Returns None when the message is
    /// not feedback about the previous response.
    pub async fn detect(&self, message: &str) -> Option<Feedback> {
        let message_lower = message.to_lowercase();

        let negative = NEGATIVE_RES.iter().any(|re| re.is_match(message));
        let positive = POSITIVE_RES.iter().any(|re| re.is_match(message));

        if negative && !positive {
            return Some(Feedback {
                feedback_type: FeedbackType::Negative,
                category: detect_category(&message_lower),
                raw_text: message.to_string(),
                confidence: 0.85,
                triggered_improvement: true,
            });
        }

        if positive && !negative {
            return Some(Feedback {
                feedback_type: FeedbackType::Positive,
                category: detect_category(&message_lower),
                raw_text: message.to_string(),
                confidence: 0.80,
                triggered_improvement: false,
            });
        }

        // Both or neither matched. Short messages may still be implicit
        // feedback; ask the LLM if one is available.
        if message.split_whitespace().count() < LLM_FALLBACK_MAX_TOKENS {
            if let Some(session) = &self.session {
                return self.llm_detect(session.as_ref(), message).await;
            }
        }

        None
    }

    async fn llm_detect(&self, session: &dyn ReasoningSession, message: &str) -> Option<Feedback> {
        let prompt = format!(
            r#"Classify this message as feedback about an AI assistant's response or a regular query/statement.

Message: "{message}"

Reply ONLY with a JSON object (no other text):
{{"is_feedback": true/false, "type": "positive"/"negative"/"neutral", "category": "verbosity"/"accuracy"/"clarity"/"format"/"tone"/"general", "confidence": 0.0-1.0}}

If it's NOT feedback about the AI's previous response, set is_feedback to false."#
        );

        let response = match session
            .send("You classify user feedback.", &[ChatMessage::user(prompt)], &[])
            .await
        {
            Ok(msg) => msg,
            Err(e) => {
                // Classification must never block the conversation.
                warn!(error = %e, "feedback LLM fallback failed");
                return None;
            }
        };

        let text = response.content_as_text()?;
        let json_re = Regex::new(r"\{[^}]+\}").ok()?;
        let raw = json_re.find(&text)?.as_str();
        let data: serde_json::Value = serde_json::from_str(raw).ok()?;

        if !data.get("is_feedback").and_then(|v| v.as_bool()).unwrap_or(false) {
            debug!("LLM fallback: not feedback");
            return None;
        }

        let feedback_type =
            FeedbackType::parse(data.get("type").and_then(|v| v.as_str()).unwrap_or("neutral"));
        Some(Feedback {
            feedback_type,
            category: FeedbackCategory::parse(
                data.get("category").and_then(|v| v.as_str()).unwrap_or("general"),
            ),
            raw_text: message.to_string(),
            confidence: data.get("confidence").and_then(|v| v.as_f64()).unwrap_or(0.5),
            triggered_improvement: feedback_type == FeedbackType::Negative,
        })
    }

    /// Quick check whether a message likely contains feedback.
    pub async fn is_feedback_message(&self, message: &str) -> bool {
        self.detect(message).await.is_some()
    }
}

impl Default for FeedbackClassifier {
    fn default() -> Self {
        Self::new()
    }
}

fn detect_category(text_lower: &str) -> FeedbackCategory {
    let mut best: Option<(FeedbackCategory, usize)> = None;
    for (category, keywords) in CATEGORY_KEYWORDS {
        let score = keywords.iter().filter(|kw| text_lower.contains(*kw)).count();
        if score > 0 && best.map(|(_, s)| score > s).unwrap_or(true) {
            best = Some((*category, score));
        }
    }
    best.map(|(c, _)| c).unwrap_or(FeedbackCategory::General)
}
