use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use super::{QuizQuestion, OPTION_COUNT, QUIZ_LENGTH};

#[derive(Debug, Error, PartialEq)]
pub enum SchemaError {
    #[error("response is not a valid quiz document: {0}")]
    Json(String),
    #[error("expected {expected} questions, got {found}")]
    QuestionCount { expected: usize, found: usize },
    #[error("question {number}: {reason}")]
    Question { number: usize, reason: String },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawQuestion {
    question: String,
    options: Vec<String>,
    correct_answer_index: i64,
    explanation: String,
}

pub fn quiz_prompt(topic_title: &str) -> String {
    format!(
        "Génère {} questions à choix multiples (QCM) sur le thème : \"{}\".
        Niveau lycée. Les questions doivent être éducatives et claires.
        Pour chaque question, fournis {} options, l'index de la bonne réponse (0-{}), et une brève explication pédagogique.",
        QUIZ_LENGTH,
        topic_title,
        OPTION_COUNT,
        OPTION_COUNT - 1
    )
}

pub fn quiz_schema() -> Value {
    json!({
        "type": "array",
        "minItems": QUIZ_LENGTH,
        "maxItems": QUIZ_LENGTH,
        "items": {
            "type": "object",
            "properties": {
                "question": { "type": "string" },
                "options": {
                    "type": "array",
                    "items": { "type": "string" },
                    "minItems": OPTION_COUNT,
                    "maxItems": OPTION_COUNT
                },
                "correctAnswerIndex": {
                    "type": "integer",
                    "minimum": 0,
                    "maximum": OPTION_COUNT - 1
                },
                "explanation": { "type": "string" }
            },
            "required": ["question", "options", "correctAnswerIndex", "explanation"],
            "additionalProperties": false
        }
    })
}

/// Chat models like to wrap JSON in a Markdown fence; one such wrapper is tolerated.
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(body) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(body) = body.strip_suffix("```") else {
        return trimmed;
    };
    // Drop the info string ("json") on the opening line
    match body.split_once('\n') {
        Some((info, rest)) if !info.trim_start().starts_with('[') => rest.trim(),
        _ => body.trim(),
    }
}

/// Parses and checks a quiz payload. Nothing is returned unless every question is valid.
pub fn parse_questions(raw: &str) -> Result<Vec<QuizQuestion>, SchemaError> {
    let raw_questions: Vec<RawQuestion> = serde_json::from_str(strip_code_fence(raw))
        .map_err(|err| SchemaError::Json(err.to_string()))?;

    if raw_questions.len() != QUIZ_LENGTH {
        return Err(SchemaError::QuestionCount {
            expected: QUIZ_LENGTH,
            found: raw_questions.len(),
        });
    }

    raw_questions
        .into_iter()
        .enumerate()
        .map(|(i, raw)| {
            validate(raw).map_err(|reason| SchemaError::Question {
                number: i + 1,
                reason,
            })
        })
        .collect()
}

fn validate(raw: RawQuestion) -> Result<QuizQuestion, String> {
    if raw.question.trim().is_empty() {
        return Err("question text is empty".to_string());
    }
    let found = raw.options.len();
    let options: [String; OPTION_COUNT] = raw
        .options
        .try_into()
        .map_err(|_| format!("expected {} options, got {}", OPTION_COUNT, found))?;
    let correct_answer_index = usize::try_from(raw.correct_answer_index)
        .ok()
        .filter(|i| *i < OPTION_COUNT)
        .ok_or_else(|| {
            format!(
                "correct answer index {} is out of range",
                raw.correct_answer_index
            )
        })?;

    Ok(QuizQuestion {
        question: raw.question,
        options,
        correct_answer_index,
        explanation: raw.explanation,
    })
}
