use std::pin::Pin;
use std::sync::Arc;

use api::PipelineError;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::Stream;
use serde_json::Value;

use crate::carrier::Carrier;

// a lazy asynchronous sequence of carriers flowing into or out of a step.
// `None` inputs means "first step"
pub type CarrierStream = Pin<Box<dyn Stream<Item = Result<Carrier, PipelineError>> + Send>>;

// step-specific named parameters, plus the source url the executor resolved
// for this invocation (present only when this step is first in the
// pipeline; see PipelineExecutor::build_args)
#[derive(Clone, Debug, Default)]
pub struct StepArgs {
    pub arguments: Value,
    pub source_url: Option<String>,
}

impl StepArgs {
    pub fn require_str(&self, key: &str) -> Result<String, PipelineError> {
        self.arguments
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| PipelineError::InvalidArguments(format!("missing argument `{key}`")))
    }

    pub fn optional_str(&self, key: &str) -> Option<String> {
        self.arguments
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_owned)
    }

    pub fn require_u32(&self, key: &str) -> Result<u32, PipelineError> {
        self.arguments
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| {
                PipelineError::InvalidArguments(format!("missing or invalid argument `{key}`"))
            })
    }

    // like require_u32, but rejects 0 -- for arguments like image bounds
    // where a zero value has no sane meaning and would otherwise reach a
    // library call as undefined aspect-ratio math instead of a clean rejection
    pub fn require_positive_u32(&self, key: &str) -> Result<u32, PipelineError> {
        let v = self.require_u32(key)?;
        if v == 0 {
            return Err(PipelineError::InvalidArguments(format!(
                "argument `{key}` must be a positive integer"
            )));
        }
        Ok(v)
    }

    pub fn require_source_url(&self) -> Result<String, PipelineError> {
        self.source_url.clone().ok_or_else(|| {
            PipelineError::InvalidArguments(
                "this step is first in the pipeline and requires `source_url`".into(),
            )
        })
    }
}

// stateless-per-invocation transformer. steps are instantiated fresh per
// pipeline run by the registry's factory
#[async_trait]
pub trait PipelineStep: Send + Sync {
    fn produces_multiple_outputs(&self) -> bool {
        false
    }

    async fn process(
        &self,
        inputs: Option<CarrierStream>,
        args: StepArgs,
    ) -> Result<CarrierStream, PipelineError>;
}

type StepFactory = Arc<dyn Fn() -> Box<dyn PipelineStep> + Send + Sync>;

// name -> factory lookup, mirroring a service registry's shape but mapping
// step type names to constructors instead of service senders
#[derive(Clone)]
pub struct Registry {
    factories: Arc<DashMap<String, StepFactory>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            factories: Arc::new(DashMap::new()),
        }
    }

    pub fn insert(&self, name: &str, factory: StepFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn create(&self, name: &str) -> Result<Box<dyn PipelineStep>, PipelineError> {
        self.factories
            .get(name)
            .map(|f| f())
            .ok_or_else(|| PipelineError::UnknownStep(name.to_string()))
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
