use std::sync::Arc;

use api::{PipelineError, StepSpec, STEP_CREATE_ZIP};
use futures::StreamExt;
use tracing::{instrument, warn};

use crate::carrier::Carrier;
use crate::config::PipelineConfig;
use crate::step::{CarrierStream, PipelineStep, Registry, StepArgs};

// chains the steps named in a pipeline request, handling fan-out and
// surfacing the closed error taxonomy. one executor is built per request;
// it owns nothing but a registry handle and the shared config rather than
// per-request state
pub struct PipelineExecutor {
    registry: Registry,
    config: Arc<PipelineConfig>,
}

impl PipelineExecutor {
    pub fn new(registry: Registry, config: Arc<PipelineConfig>) -> Self {
        PipelineExecutor { registry, config }
    }

    // runs every step in order and drains the final stream down to the one
    // carrier that becomes the response
    #[instrument(skip(self, steps))]
    pub async fn run(&self, steps: Vec<StepSpec>) -> Result<Carrier, PipelineError> {
        if steps.is_empty() {
            return Err(PipelineError::InvalidArguments(
                "pipeline_steps must not be empty".into(),
            ));
        }

        let last_index = steps.len() - 1;
        let mut inputs: Option<CarrierStream> = None;

        for (i, spec) in steps.into_iter().enumerate() {
            let step = self.registry.create(&spec.step_type)?;
            let args = self.build_args(&spec, i)?;

            let is_last = i == last_index;
            let fan_out = step.produces_multiple_outputs();
            if fan_out && !is_last {
                return Err(PipelineError::PipelineShapeError(format!(
                    "step `{}` produces multiple outputs but is not the final step",
                    spec.step_type
                )));
            }

            let output = step.process(inputs, args).await?;

            if fan_out {
                // final fan-out step: the executor auto-appends a create_zip
                // finalizer whose input is the fan-out stream
                let finalizer = self.registry.create(STEP_CREATE_ZIP)?;
                let finalizer_args = StepArgs::default();
                inputs = Some(finalizer.process(Some(output), finalizer_args).await?);
            } else {
                inputs = Some(output);
            }
        }

        self.drain_single(inputs.expect("at least one step always runs")).await
    }

    // the first step reads `source_url` straight out of its own arguments;
    // every later step receives its input as a carrier stream instead, and
    // any `source_url` key it was handed is ignored with a warning
    fn build_args(&self, spec: &StepSpec, index: usize) -> Result<StepArgs, PipelineError> {
        let source_url = if index == 0 {
            Some(
                spec.arguments
                    .get("source_url")
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_owned)
                    .ok_or_else(|| {
                        PipelineError::InvalidArguments(
                            "first step requires a `source_url` argument".into(),
                        )
                    })?,
            )
        } else {
            if spec.arguments.get("source_url").is_some() {
                warn!(
                    step = %spec.step_type,
                    "source_url is ignored on a non-first step; upstream output is used instead"
                );
            }
            None
        };

        Ok(StepArgs {
            arguments: spec.arguments.clone(),
            source_url,
        })
    }

    async fn drain_single(&self, mut stream: CarrierStream) -> Result<Carrier, PipelineError> {
        let first = stream.next().await.ok_or_else(|| {
            PipelineError::PipelineShapeError("pipeline produced no output carrier".into())
        })??;

        if stream.next().await.is_some() {
            return Err(PipelineError::PipelineShapeError(
                "final step produced more than one carrier".into(),
            ));
        }

        Ok(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps;
    use api::Metadata;
    use bytes::Bytes;
    use serde_json::json;

    fn config() -> Arc<PipelineConfig> {
        Arc::new(PipelineConfig::default())
    }

    fn registry() -> Registry {
        let registry = Registry::new();
        steps::register_builtin(&registry, config());
        registry
    }

    #[tokio::test]
    async fn empty_pipeline_is_rejected() {
        let executor = PipelineExecutor::new(registry(), config());
        let err = executor.run(Vec::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn unknown_step_is_rejected() {
        let executor = PipelineExecutor::new(registry(), config());
        let steps = vec![StepSpec {
            step_type: "not_a_real_step".into(),
            arguments: json!({ "source_url": "https://example.invalid/f" }),
        }];
        let err = executor.run(steps).await.unwrap_err();
        assert!(matches!(err, PipelineError::UnknownStep(_)));
    }

    #[tokio::test]
    async fn non_final_fan_out_is_rejected() {
        let executor = PipelineExecutor::new(registry(), config());
        let steps = vec![
            StepSpec {
                step_type: "extract_directory_zip".into(),
                arguments: json!({
                    "source_url": "https://example.invalid/f.zip",
                    "directory_name": "d",
                }),
            },
            StepSpec {
                step_type: "preview_picture".into(),
                arguments: json!({ "max_width": 10, "max_height": 10 }),
            },
        ];
        let err = executor.run(steps).await.unwrap_err();
        assert!(matches!(err, PipelineError::PipelineShapeError(_)));
    }

    #[tokio::test]
    async fn single_bytes_step_drains_to_one_carrier() {
        // exercises the fan-out-free path end to end using create_zip alone
        // against a synthetic single-entry input stream
        let registry = registry();
        let step = registry.create("create_zip").unwrap();
        let carrier = Carrier::bytes(
            &b"hello"[..],
            Metadata::default().with_file_name("a.txt"),
        );
        let input_stream: CarrierStream =
            Box::pin(futures::stream::once(async move { Ok(carrier) }));
        let output = step
            .process(Some(input_stream), StepArgs::default())
            .await
            .unwrap();

        let executor = PipelineExecutor::new(registry, config());
        let mut result = executor.drain_single(output).await.unwrap();
        let body = result.read_to_end_helper().await;
        assert!(!body.is_empty());
    }

    // small helper so the test above reads naturally without importing
    // CarrierIo explicitly at the top of the test module
    impl Carrier {
        async fn read_to_end_helper(&mut self) -> Bytes {
            use crate::carrier::CarrierIo;
            self.read(-1).await.unwrap()
        }
    }

    fn build_directory_fixture_zip() -> Vec<u8> {
        use std::io::Write;
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = ::zip::ZipWriter::new(&mut cursor);
            let options = ::zip::write::SimpleFileOptions::default()
                .compression_method(::zip::CompressionMethod::Stored);
            writer.add_directory("d/", options).unwrap();
            writer.start_file("d/x", options).unwrap();
            writer.write_all(b"X").unwrap();
            writer.start_file("d/y", options).unwrap();
            writer.write_all(b"Y").unwrap();
            writer.start_file("outside.txt", options).unwrap();
            writer.write_all(b"not in d").unwrap();
            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    // a bare-bones first step that hands back a fixed in-memory zip instead
    // of resolving `source_url` through a real UrlCarrier -- stands in for
    // "some earlier step produced these bytes" so the fan-out test below
    // exercises PipelineExecutor::run()'s real chaining and auto-finalize
    // logic without needing a live HTTP server
    struct FixtureSource(Vec<u8>);

    #[async_trait::async_trait]
    impl PipelineStep for FixtureSource {
        async fn process(
            &self,
            _inputs: Option<CarrierStream>,
            _args: StepArgs,
        ) -> Result<CarrierStream, PipelineError> {
            let carrier = Carrier::bytes(self.0.clone(), Metadata::default().with_file_name("fixture.zip"));
            Ok(Box::pin(futures::stream::once(async { Ok(carrier) })))
        }
    }

    // exercises the fan-out auto-finalize path through PipelineExecutor::run()
    // itself: a final extract_directory_zip step fans out every member under
    // a directory, and the executor is responsible for appending a create_zip
    // step that collects that fan-out back into the single carrier run()
    // promises its caller
    #[tokio::test]
    async fn fan_out_step_is_auto_finalized_into_a_single_zip() {
        let registry = registry();
        let fixture = build_directory_fixture_zip();
        registry.insert(
            "fixture_source",
            Arc::new(move || Box::new(FixtureSource(fixture.clone())) as _),
        );

        let executor = PipelineExecutor::new(registry, config());
        let steps = vec![
            StepSpec {
                step_type: "fixture_source".into(),
                arguments: json!({ "source_url": "https://example.invalid/fixture.zip" }),
            },
            StepSpec {
                step_type: "extract_directory_zip".into(),
                arguments: json!({ "directory_name": "d" }),
            },
        ];

        let mut result = executor.run(steps).await.unwrap();
        let bytes = result.read_to_end_helper().await;

        let mut archive = ::zip::ZipArchive::new(std::io::Cursor::new(bytes.to_vec())).unwrap();
        let mut seen = std::collections::HashMap::new();
        for i in 0..archive.len() {
            let mut file = archive.by_index(i).unwrap();
            let mut contents = Vec::new();
            std::io::Read::read_to_end(&mut file, &mut contents).unwrap();
            seen.insert(file.name().to_string(), contents);
        }

        assert_eq!(seen.len(), 2);
        assert_eq!(seen.get("x").map(Vec::as_slice), Some(&b"X"[..]));
        assert_eq!(seen.get("y").map(Vec::as_slice), Some(&b"Y"[..]));
        assert!(!seen.contains_key("outside.txt"));
    }
}
