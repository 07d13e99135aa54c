use std::time::Duration;

// pipeline-wide tunables. loaded by the server binary from the environment
// (`PIPELINE_*`) and threaded through as `Arc<PipelineConfig>`
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    // capacity of the bounded channel backing each Queue carrier and each
    // inter-step edge, in chunks
    pub queue_capacity: usize,

    // size of one chunk pushed onto a Queue carrier
    pub chunk_size: usize,

    // above this size, a non-seekable input that a ZIP step needs seekable
    // access to is rejected instead of buffered
    pub seek_buffer_limit: u64,

    // size of the Url carrier's small look-ahead buffer
    pub url_lookahead: usize,

    // bounded retries for idempotent range GETs against a source url
    pub url_retry_attempts: u32,
    pub url_retry_backoff: Duration,

    pub http_client_timeout: Duration,
    pub bind_addr: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            queue_capacity: 8,
            chunk_size: 64 * 1024,
            seek_buffer_limit: 100 * 1024 * 1024,
            url_lookahead: 64 * 1024,
            url_retry_attempts: 2,
            url_retry_backoff: Duration::from_millis(200),
            http_client_timeout: Duration::from_secs(30),
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl PipelineConfig {
    // read everything from the environment, falling back to defaults when a
    // var is absent or unparsable; no config file format is needed yet
    pub fn from_env() -> Self {
        let mut cfg = PipelineConfig::default();

        if let Ok(v) = std::env::var("PIPELINE_QUEUE_CAPACITY") {
            if let Ok(v) = v.parse() {
                cfg.queue_capacity = v;
            }
        }
        if let Ok(v) = std::env::var("PIPELINE_CHUNK_SIZE") {
            if let Ok(v) = v.parse() {
                cfg.chunk_size = v;
            }
        }
        if let Ok(v) = std::env::var("PIPELINE_SEEK_BUFFER_LIMIT") {
            if let Ok(v) = v.parse() {
                cfg.seek_buffer_limit = v;
            }
        }
        if let Ok(v) = std::env::var("PIPELINE_BIND_ADDR") {
            cfg.bind_addr = v;
        }

        cfg
    }
}
