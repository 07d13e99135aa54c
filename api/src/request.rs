use serde::{Deserialize, Serialize};
use serde_json::Value;

// the signed/encrypted token's payload, once the external auth collaborator
// has verified and decrypted it. the core only ever looks at
// `pipeline_steps`; `iat`/`exp` are carried so the envelope round-trips, but
// their verification is entirely the auth collaborator's responsibility
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub iat: i64,
    pub exp: i64,
    pub pipeline_steps: Vec<StepSpec>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepSpec {
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default)]
    pub arguments: Value,
}
