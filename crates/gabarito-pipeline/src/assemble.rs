//! Result assembly: fold stage outcomes into the terminal
//! [`ProcessingResult`].
//!
//! Request-level errors become `status = "error"` with no blocks.
//! Block-level failures are already recorded on each [`Block`] and leave
//! the status at `"success"`, unless the unreadable policy says a sheet
//! with no readable block is itself an error.

use crate::config::UnreadablePolicy;
use crate::types::{Block, PipelineError, ProcessingResult};

/// Build the terminal result for one request.
#[must_use]
pub fn assemble(
    outcome: Result<Vec<Block>, PipelineError>,
    policy: UnreadablePolicy,
) -> ProcessingResult {
    match outcome.and_then(|blocks| apply_policy(blocks, policy)) {
        Ok(blocks) => ProcessingResult::success(blocks),
        Err(e) => ProcessingResult::failure(&e),
    }
}

/// Enforce the unreadable-sheet policy on a complete block list.
///
/// # Errors
///
/// Returns [`PipelineError::UnreadableSheet`] under
/// [`UnreadablePolicy::Fail`] when every block carries a defect.
pub fn apply_policy(
    blocks: Vec<Block>,
    policy: UnreadablePolicy,
) -> Result<Vec<Block>, PipelineError> {
    let all_unreadable = !blocks.is_empty() && blocks.iter().all(|b| b.defect.is_some());
    match policy {
        UnreadablePolicy::Fail if all_unreadable => Err(PipelineError::UnreadableSheet),
        _ => Ok(blocks),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlockError, Question, Status};

    fn readable(number: usize) -> Block {
        Block {
            number,
            is_valid_img: true,
            questions: vec![Question::undetermined(1)],
            quality: None,
            defect: None,
        }
    }

    fn unreadable(number: usize) -> Block {
        Block::unreadable(
            number,
            1,
            BlockError::AnchorNotFound {
                resolved: 2,
                required: 4,
            },
        )
    }

    #[test]
    fn success_keeps_blocks_in_order() {
        let result = assemble(
            Ok(vec![readable(1), unreadable(2)]),
            UnreadablePolicy::Degrade,
        );
        assert_eq!(result.status, Status::Success);
        assert!(result.message.is_none());
        let numbers: Vec<usize> = result.blocks.iter().map(|b| b.number).collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[test]
    fn request_error_has_message_and_no_blocks() {
        let result = assemble(
            Err(PipelineError::UnknownTemplate {
                id: "missing".to_owned(),
            }),
            UnreadablePolicy::Degrade,
        );
        assert_eq!(result.status, Status::Error);
        assert!(result.blocks.is_empty());
        assert_eq!(result.message.as_deref(), Some("unknown template: missing"));
    }

    #[test]
    fn degrade_policy_keeps_fully_unreadable_sheet() {
        let result = assemble(
            Ok(vec![unreadable(1), unreadable(2)]),
            UnreadablePolicy::Degrade,
        );
        assert!(result.is_success());
        assert!(result.blocks.iter().all(|b| !b.is_valid_img));
    }

    #[test]
    fn fail_policy_rejects_fully_unreadable_sheet() {
        let result = assemble(
            Ok(vec![unreadable(1), unreadable(2)]),
            UnreadablePolicy::Fail,
        );
        assert_eq!(result.status, Status::Error);
        assert!(result.blocks.is_empty());
    }

    #[test]
    fn fail_policy_accepts_partially_readable_sheet() {
        let result = assemble(
            Ok(vec![readable(1), unreadable(2)]),
            UnreadablePolicy::Fail,
        );
        assert!(result.is_success());
        assert_eq!(result.blocks.len(), 2);
    }
}
