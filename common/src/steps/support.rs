use std::collections::HashMap;

use api::{Metadata, PipelineError};
use futures::StreamExt;

use crate::carrier::{Carrier, UrlCarrier};
use crate::config::PipelineConfig;
use crate::step::{CarrierStream, StepArgs};

// most steps consume exactly one carrier: either the pipeline's very first
// input (materialised here from `source_url`) or the single carrier a
// non-fan-out predecessor produced
pub async fn single_input(
    inputs: Option<CarrierStream>,
    args: &StepArgs,
    config: &PipelineConfig,
) -> Result<Carrier, PipelineError> {
    match inputs {
        Some(mut stream) => match stream.next().await {
            Some(item) => item,
            None => Err(PipelineError::PipelineShapeError(
                "upstream step produced no carriers".into(),
            )),
        },
        None => {
            let url = args.require_source_url()?;
            Ok(Carrier::Url(UrlCarrier::new(
                url,
                config.url_lookahead,
                config.url_retry_attempts,
                config.url_retry_backoff,
                config.http_client_timeout,
                Metadata::default(),
            )))
        }
    }
}

pub fn guess_media_type(file_name: &str) -> String {
    mime_guess::from_path(file_name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

// same guess, but empty string instead of `application/octet-stream` when
// the extension isn't recognised -- used by `preview_zip`, where "unknown"
// and "binary" are different things
pub fn guess_media_type_or_empty(file_name: &str) -> String {
    mime_guess::from_path(file_name)
        .first()
        .map(|m| m.essence_str().to_string())
        .unwrap_or_default()
}

pub fn basename_of(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

// collisions inside a created zip are disambiguated by suffixing `-1`, `-2`,
// ... before the extension
pub fn disambiguate_name(seen: &mut HashMap<String, u32>, name: &str) -> String {
    let count = seen.entry(name.to_string()).or_insert(0);
    if *count == 0 {
        *count += 1;
        return name.to_string();
    }

    let suffix = *count;
    *count += 1;
    match name.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}-{suffix}.{ext}"),
        None => format!("{name}-{suffix}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disambiguate_name_suffixes_repeats() {
        let mut seen = HashMap::new();
        assert_eq!(disambiguate_name(&mut seen, "a.txt"), "a.txt");
        assert_eq!(disambiguate_name(&mut seen, "a.txt"), "a-1.txt");
        assert_eq!(disambiguate_name(&mut seen, "a.txt"), "a-2.txt");
        assert_eq!(disambiguate_name(&mut seen, "b"), "b");
        assert_eq!(disambiguate_name(&mut seen, "b"), "b-1");
    }
}
