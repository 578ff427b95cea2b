//! Long-lived decoding service: a template store plus a worker pool.
//!
//! An [`Engine`] is created once and shared by reference. Requests only
//! read the template set (a snapshot taken at request start), so a
//! [`Engine::reload`] never disturbs requests already in flight. Batches
//! fan out across the pool and come back in submission order.

use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::template::{TemplateSet, TemplateStore};
use crate::types::{PipelineError, ProcessingResult};

/// One decoding request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetRequest {
    /// Encoded image bytes.
    pub bytes: Vec<u8>,
    /// Declared media type, if any.
    pub content_type: Option<String>,
    /// Template to decode against.
    pub template_id: String,
}

/// Shared decoding service.
pub struct Engine {
    templates: TemplateStore,
    config: PipelineConfig,
    pool: rayon::ThreadPool,
}

impl Engine {
    /// Build an engine with its own worker pool.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] for an invalid
    /// configuration or when the worker pool cannot be started.
    pub fn new(templates: TemplateSet, config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let threads = config.worker_threads.unwrap_or_else(|| {
            std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
        });
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("gabarito-worker-{i}"))
            .build()
            .map_err(|e| PipelineError::InvalidConfig(format!("worker pool: {e}")))?;
        info!(threads, templates = templates.len(), "engine started");
        Ok(Self {
            templates: TemplateStore::new(templates),
            config,
            pool,
        })
    }

    /// The template set requests currently see.
    #[must_use]
    pub fn templates(&self) -> Arc<TemplateSet> {
        self.templates.snapshot()
    }

    /// The pipeline configuration.
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Swap in a new template set. Requests already running keep the set
    /// they started with.
    pub fn reload(&self, templates: TemplateSet) {
        info!(templates = templates.len(), "templates reloaded");
        self.templates.replace(templates);
    }

    /// Decode one sheet on the worker pool.
    #[must_use]
    pub fn process(&self, request: &SheetRequest) -> ProcessingResult {
        self.pool.install(|| self.process_here(request))
    }

    /// Decode a batch of sheets concurrently. Results are in request
    /// order.
    #[must_use]
    pub fn process_batch(&self, requests: &[SheetRequest]) -> Vec<ProcessingResult> {
        debug!(requests = requests.len(), "processing batch");
        self.pool
            .install(|| requests.par_iter().map(|r| self.process_here(r)).collect())
    }

    fn process_here(&self, request: &SheetRequest) -> ProcessingResult {
        let templates = self.templates.snapshot();
        let Some(template) = templates.get(&request.template_id) else {
            return ProcessingResult::failure(&PipelineError::UnknownTemplate {
                id: request.template_id.clone(),
            });
        };
        crate::process(
            &request.bytes,
            request.content_type.as_deref(),
            template,
            &self.config,
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::fixtures::{self, Sheet};
    use crate::types::{Answer, Status};

    fn engine(threads: usize) -> Engine {
        let set = TemplateSet::from_templates([fixtures::template()]).unwrap();
        let config = PipelineConfig {
            worker_threads: Some(threads),
            ..PipelineConfig::default()
        };
        Engine::new(set, config).unwrap()
    }

    fn request(bytes: Vec<u8>, template_id: &str) -> SheetRequest {
        SheetRequest {
            bytes,
            content_type: Some("image/png".to_owned()),
            template_id: template_id.to_owned(),
        }
    }

    #[test]
    fn unknown_template_is_request_error() {
        let result = engine(1).process(&request(Sheet::new().png(), "nope"));
        assert_eq!(result.status, Status::Error);
        assert_eq!(result.message.as_deref(), Some("unknown template: nope"));
    }

    #[test]
    fn batch_preserves_request_order() {
        let engine = engine(3);
        let answered = Sheet::answered().png();
        let requests = vec![
            request(answered.clone(), fixtures::TEMPLATE_ID),
            request(b"garbage".to_vec(), fixtures::TEMPLATE_ID),
            request(Sheet::new().png(), fixtures::TEMPLATE_ID),
            request(answered, "missing"),
        ];
        let results = engine.process_batch(&requests);
        let statuses: Vec<Status> = results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![Status::Success, Status::Error, Status::Success, Status::Error]
        );
        assert!(
            results[2]
                .blocks
                .iter()
                .flat_map(|b| &b.questions)
                .all(|q| q.answer == Answer::NoMark)
        );
    }

    #[test]
    fn concurrent_results_match_sequential() {
        let engine = engine(4);
        let png = Sheet::answered().png();
        let requests: Vec<SheetRequest> = (0..6)
            .map(|_| request(png.clone(), fixtures::TEMPLATE_ID))
            .collect();
        let sequential = engine.process(&requests[0]);
        let batch = engine.process_batch(&requests);
        assert!(batch.iter().all(|r| *r == sequential));
    }

    #[test]
    fn reload_replaces_templates() {
        let engine = engine(1);
        assert!(engine.templates().get(fixtures::TEMPLATE_ID).is_some());

        let mut renamed = fixtures::template();
        renamed.id = "renamed".to_owned();
        engine.reload(TemplateSet::from_templates([renamed]).unwrap());

        let result = engine.process(&request(Sheet::answered().png(), fixtures::TEMPLATE_ID));
        assert_eq!(result.status, Status::Error);
        let result = engine.process(&request(Sheet::answered().png(), "renamed"));
        assert!(result.is_success());
    }

    #[test]
    fn zero_threads_is_rejected() {
        let set = TemplateSet::from_templates([fixtures::template()]).unwrap();
        let config = PipelineConfig {
            worker_threads: Some(0),
            ..PipelineConfig::default()
        };
        assert!(matches!(
            Engine::new(set, config),
            Err(PipelineError::InvalidConfig(_))
        ));
    }
}
