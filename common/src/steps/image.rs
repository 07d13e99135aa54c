use std::sync::Arc;

use api::{Metadata, PipelineError};
use async_trait::async_trait;
use bytes::Bytes;
use image::imageops::FilterType;
use image::{ColorType, GenericImageView, ImageFormat};

use crate::carrier::Carrier;
use crate::config::PipelineConfig;
use crate::step::{CarrierStream, PipelineStep, StepArgs};
use crate::steps::support::single_input;

fn internal(err: impl std::fmt::Display) -> PipelineError {
    PipelineError::Internal(anyhow::anyhow!(err.to_string()))
}

// decodes, downscales to fit inside `max_width`x`max_height` and re-encodes
// a picture. resizing is offloaded to a blocking thread since the
// synchronous `image` crate's decode/resize/encode is pure CPU work, not
// something that belongs on the async reactor
pub struct PreviewPicture {
    config: Arc<PipelineConfig>,
}

impl PreviewPicture {
    pub fn new(config: Arc<PipelineConfig>) -> Self {
        PreviewPicture { config }
    }
}

#[async_trait]
impl PipelineStep for PreviewPicture {
    async fn process(
        &self,
        inputs: Option<CarrierStream>,
        args: StepArgs,
    ) -> Result<CarrierStream, PipelineError> {
        let max_width = args.require_positive_u32("max_width")?;
        let max_height = args.require_positive_u32("max_height")?;
        // optional `file_name` overrides whatever the input carrier already
        // carried, e.g. when the source URL's path doesn't reflect it
        let file_name_override = args.optional_str("file_name");

        let mut carrier = single_input(inputs, &args, &self.config).await?;
        let source_name = file_name_override.or_else(|| carrier.metadata().file_name.clone());
        let original = carrier.read_to_end().await?;

        let result = tokio::task::spawn_blocking(move || {
            resize_within_bounds(&original, max_width, max_height)
        })
        .await
        .map_err(internal)??;

        let media_type = format!("image/{}", result.format.extensions_str()[0]);
        let mut metadata = Metadata::default()
            .with_media_type(media_type)
            .with_file_name(source_name.unwrap_or_else(|| "preview".to_string()));
        metadata.width = Some(result.width);
        metadata.height = Some(result.height);
        metadata.mode = Some(color_mode_name(result.color));

        let out = Carrier::bytes(result.bytes, metadata);
        Ok(Box::pin(futures::stream::once(async { Ok(out) })))
    }
}

struct Resized {
    bytes: Bytes,
    width: u32,
    height: u32,
    format: ImageFormat,
    color: ColorType,
}

// maps the decoded color type to the short mode string preview consumers
// expect, mirroring PIL's `Image.mode` vocabulary
fn color_mode_name(color: ColorType) -> String {
    match color {
        ColorType::L8 | ColorType::L16 => "L",
        ColorType::La8 | ColorType::La16 => "LA",
        ColorType::Rgb8 | ColorType::Rgb16 | ColorType::Rgb32F => "RGB",
        ColorType::Rgba8 | ColorType::Rgba16 | ColorType::Rgba32F => "RGBA",
        _ => "RGB",
    }
    .to_string()
}

// returns the original bytes untouched when the decoded image already fits
// within the requested bounds, rather than round-tripping it through a
// re-encode that could change its bytes for no visible gain
fn resize_within_bounds(
    original: &[u8],
    max_width: u32,
    max_height: u32,
) -> Result<Resized, PipelineError> {
    let format = image::guess_format(original).map_err(|e| PipelineError::FormatError(e.to_string()))?;
    let img = image::load_from_memory_with_format(original, format)
        .map_err(|e| PipelineError::FormatError(e.to_string()))?;
    let (width, height) = img.dimensions();
    let color = img.color();

    if width <= max_width && height <= max_height {
        return Ok(Resized {
            bytes: Bytes::copy_from_slice(original),
            width,
            height,
            format,
            color,
        });
    }

    let resized = img.resize(max_width, max_height, FilterType::Lanczos3);
    let (width, height) = resized.dimensions();

    let mut buf = Vec::new();
    resized
        .write_to(&mut std::io::Cursor::new(&mut buf), format)
        .map_err(|e| PipelineError::FormatError(e.to_string()))?;

    Ok(Resized {
        bytes: Bytes::from(buf),
        width,
        height,
        format,
        color,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_png(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(width, height, image::Rgb([10, 20, 30]));
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn image_already_within_bounds_is_passed_through_unchanged() {
        let original = sample_png(10, 10);
        let resized = resize_within_bounds(&original, 100, 100).unwrap();
        assert_eq!(resized.bytes.to_vec(), original);
        assert_eq!((resized.width, resized.height), (10, 10));
    }

    #[test]
    fn oversized_image_is_scaled_down_to_fit() {
        let original = sample_png(200, 100);
        let resized = resize_within_bounds(&original, 50, 50).unwrap();
        assert!(resized.width <= 50 && resized.height <= 50);
    }

    #[tokio::test]
    async fn zero_max_width_is_rejected_before_resizing() {
        let config = Arc::new(PipelineConfig::default());
        let step = PreviewPicture::new(config.clone());
        let original = sample_png(10, 10);
        let carrier = Carrier::bytes(Bytes::from(original), Metadata::default());
        let inputs: CarrierStream = Box::pin(futures::stream::once(async { Ok(carrier) }));

        let args = StepArgs {
            arguments: serde_json::json!({"max_width": 0, "max_height": 50}),
            source_url: None,
        };

        let err = step.process(Some(inputs), args).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidArguments(_)));
    }
}
