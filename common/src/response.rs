use std::collections::BTreeMap;

use api::{DEFAULT_FILE_NAME, PipelineError};

use crate::carrier::Carrier;

// the final carrier's metadata, translated into the shape an HTTP layer
// needs: a status, a content type, and a `Content-Disposition` header for
// anything that isn't a JSON preview/validation body. the carrier itself is
// handed back unconsumed -- the http layer decides whether to buffer it
// (Bytes) or stream it (Queue/Url)
pub struct AdaptedResponse {
    pub is_json: bool,
    pub media_type: String,
    pub file_name: String,
    pub headers: BTreeMap<String, String>,
    pub carrier: Carrier,
}

pub fn adapt(carrier: Carrier) -> Result<AdaptedResponse, PipelineError> {
    use crate::carrier::CarrierIo;

    let metadata = carrier.metadata().clone();
    let is_json = metadata.is_json();
    let media_type = metadata
        .media_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let file_name = metadata
        .file_name
        .clone()
        .unwrap_or_else(|| DEFAULT_FILE_NAME.to_string());

    let mut headers = metadata.headers.clone();
    if !is_json && !headers.contains_key("Content-Disposition") {
        headers.insert(
            "Content-Disposition".to_string(),
            format!("attachment; filename=\"{file_name}\""),
        );
    }

    Ok(AdaptedResponse {
        is_json,
        media_type,
        file_name,
        headers,
        carrier,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use api::Metadata;

    #[tokio::test]
    async fn json_carrier_gets_no_content_disposition() {
        let carrier = Carrier::bytes(
            &b"{}"[..],
            Metadata::default().with_media_type("application/json"),
        );
        let adapted = adapt(carrier).unwrap();
        assert!(adapted.is_json);
        assert!(!adapted.headers.contains_key("Content-Disposition"));
    }

    #[tokio::test]
    async fn file_carrier_gets_attachment_header_and_default_name() {
        let carrier = Carrier::bytes(&b"hi"[..], Metadata::default());
        let adapted = adapt(carrier).unwrap();
        assert!(!adapted.is_json);
        assert_eq!(adapted.media_type, "application/octet-stream");
        assert_eq!(
            adapted.headers.get("Content-Disposition").unwrap(),
            "attachment; filename=\"output\""
        );
    }
}
