//! JSON wire response.
//!
//! The wire shape is fixed:
//!
//! ```text
//! { "blocks": [ { "block": 1, "response": { "is_valid_img": true,
//!     "questions_marked_processed": [ { "answer": "c", "question": 1 } ] } } ],
//!   "status": "success" }
//! ```
//!
//! `message` appears only on error. Answers are the marked alternative's
//! label, or one of the sentinel strings [`NO_MARK_ANSWER`] and
//! [`AMBIGUOUS_ANSWER`]. Templates cannot use the sentinels as labels, so
//! the two never collide.

use serde::{Deserialize, Serialize};

use gabarito_pipeline::{Answer, Block, ProcessingResult, Status};

/// Wire answer for a question with no mark.
pub const NO_MARK_ANSWER: &str = "none";

/// Wire answer for a question with more than one plausible mark.
pub const AMBIGUOUS_ANSWER: &str = "multiple";

/// Errors raised while serializing a response.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// JSON encoding failed.
    #[error("failed to encode response JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Top-level wire response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Blocks in template order. Empty on error.
    pub blocks: Vec<BlockEntry>,
    /// `"success"` or `"error"`.
    pub status: Status,
    /// Error description, present only on error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// One block on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEntry {
    /// 1-based block number.
    pub block: usize,
    /// Decoded content.
    pub response: BlockResponse,
}

/// Decoded content of one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockResponse {
    /// Whether the answers can be trusted.
    pub is_valid_img: bool,
    /// One entry per question, in question order.
    pub questions_marked_processed: Vec<QuestionEntry>,
}

/// One question on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionEntry {
    /// Alternative label or sentinel.
    pub answer: String,
    /// 1-based question number within the block.
    pub question: usize,
}

/// Wire spelling of an answer.
#[must_use]
pub fn answer_label(answer: &Answer) -> &str {
    match answer {
        Answer::Marked(label) => label,
        Answer::NoMark => NO_MARK_ANSWER,
        Answer::Ambiguous => AMBIGUOUS_ANSWER,
    }
}

fn block_entry(block: &Block) -> BlockEntry {
    BlockEntry {
        block: block.number,
        response: BlockResponse {
            is_valid_img: block.is_valid_img,
            questions_marked_processed: block
                .questions
                .iter()
                .map(|q| QuestionEntry {
                    answer: answer_label(&q.answer).to_owned(),
                    question: q.number,
                })
                .collect(),
        },
    }
}

/// Project a result onto the wire shape.
#[must_use]
pub fn to_response(result: &ProcessingResult) -> Response {
    Response {
        blocks: result.blocks.iter().map(block_entry).collect(),
        status: result.status,
        message: result.message.clone(),
    }
}

/// Serialize the wire response.
///
/// # Errors
///
/// Returns [`ExportError::Json`] if encoding fails.
pub fn to_json(result: &ProcessingResult, pretty: bool) -> Result<String, ExportError> {
    let response = to_response(result);
    let json = if pretty {
        serde_json::to_string_pretty(&response)?
    } else {
        serde_json::to_string(&response)?
    };
    Ok(json)
}

/// Serialize the full result, including fill scores, intensities,
/// quality reports, and block defects.
///
/// # Errors
///
/// Returns [`ExportError::Json`] if encoding fails.
pub fn to_audit_json(result: &ProcessingResult, pretty: bool) -> Result<String, ExportError> {
    let json = if pretty {
        serde_json::to_string_pretty(result)?
    } else {
        serde_json::to_string(result)?
    };
    Ok(json)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use gabarito_pipeline::{BlockError, PipelineError, Question, RESERVED_LABELS};
    use serde_json::json;

    use super::*;

    fn question(number: usize, answer: Answer) -> Question {
        Question {
            number,
            answer,
            scores: vec![0.9, 0.1],
            intensities: vec![40.0, 240.0],
        }
    }

    fn sample() -> ProcessingResult {
        ProcessingResult::success(vec![
            Block {
                number: 1,
                is_valid_img: true,
                questions: vec![
                    question(1, Answer::Marked("a".to_owned())),
                    question(2, Answer::NoMark),
                    question(3, Answer::Ambiguous),
                ],
                quality: None,
                defect: None,
            },
            Block::unreadable(
                2,
                2,
                BlockError::AnchorNotFound {
                    resolved: 3,
                    required: 4,
                },
            ),
        ])
    }

    #[test]
    fn success_has_exact_wire_shape() {
        let value: serde_json::Value = serde_json::from_str(&to_json(&sample(), false).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "blocks": [
                    {
                        "block": 1,
                        "response": {
                            "is_valid_img": true,
                            "questions_marked_processed": [
                                {"answer": "a", "question": 1},
                                {"answer": "none", "question": 2},
                                {"answer": "multiple", "question": 3}
                            ]
                        }
                    },
                    {
                        "block": 2,
                        "response": {
                            "is_valid_img": false,
                            "questions_marked_processed": [
                                {"answer": "none", "question": 1},
                                {"answer": "none", "question": 2}
                            ]
                        }
                    }
                ],
                "status": "success"
            })
        );
    }

    #[test]
    fn error_has_message_and_empty_blocks() {
        let result = ProcessingResult::failure(&PipelineError::UnreadableSheet);
        let value: serde_json::Value = serde_json::from_str(&to_json(&result, true).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "blocks": [],
                "status": "error",
                "message": "no block on the sheet could be read"
            })
        );
    }

    #[test]
    fn sentinels_are_reserved_labels() {
        assert!(RESERVED_LABELS.contains(&NO_MARK_ANSWER));
        assert!(RESERVED_LABELS.contains(&AMBIGUOUS_ANSWER));
    }

    #[test]
    fn audit_keeps_scores_and_defects() {
        let value: serde_json::Value =
            serde_json::from_str(&to_audit_json(&sample(), false).unwrap()).unwrap();
        assert_eq!(
            value["blocks"][0]["questions"][0]["scores"],
            json!([0.9, 0.1])
        );
        assert_eq!(
            value["blocks"][1]["defect"],
            json!({"kind": "anchor_not_found", "resolved": 3, "required": 4})
        );
    }
}
