use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// closed metadata structure attached to every carrier: a fixed set of
// recognised fields plus an open `headers` map for the one place callers
// legitimately need arbitrary keys (response headers)
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Metadata {
    pub file_name: Option<String>,
    pub media_type: Option<String>,
    pub mode: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Metadata {
    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }

    pub fn is_json(&self) -> bool {
        self.media_type.as_deref() == Some("application/json")
    }
}
