//! gabarito-export: Pure response serializers (sans-IO).
//!
//! Converts a [`ProcessingResult`](gabarito_pipeline::ProcessingResult)
//! into the JSON wire format consumers depend on, or into a full audit
//! document that keeps fill scores and quality reports.

pub mod response;

pub use response::{
    AMBIGUOUS_ANSWER, BlockEntry, BlockResponse, ExportError, NO_MARK_ANSWER, QuestionEntry,
    Response, answer_label, to_audit_json, to_json, to_response,
};
