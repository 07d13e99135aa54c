pub mod crypt4gh;
pub mod image;
mod support;
pub mod zip;

use std::sync::Arc;

use api::{
    STEP_ADD_RECIPIENT_CRYPT4GH, STEP_CREATE_ZIP, STEP_DECRYPT_CRYPT4GH,
    STEP_EXTRACT_DIRECTORY_ZIP, STEP_EXTRACT_FILE_ZIP, STEP_PREVIEW_PICTURE, STEP_PREVIEW_ZIP,
    STEP_VALIDATE_CRYPT4GH,
};

use crate::config::PipelineConfig;
use crate::step::Registry;

// wires every built-in step name to a factory producing a fresh, stateless
// instance per pipeline run
pub fn register_builtin(registry: &Registry, config: Arc<PipelineConfig>) {
    let c = config.clone();
    registry.insert(
        STEP_PREVIEW_ZIP,
        Arc::new(move || Box::new(zip::PreviewZip::new(c.clone())) as _),
    );

    let c = config.clone();
    registry.insert(
        STEP_EXTRACT_FILE_ZIP,
        Arc::new(move || Box::new(zip::ExtractFileZip::new(c.clone())) as _),
    );

    let c = config.clone();
    registry.insert(
        STEP_EXTRACT_DIRECTORY_ZIP,
        Arc::new(move || Box::new(zip::ExtractDirectoryZip::new(c.clone())) as _),
    );

    let c = config.clone();
    registry.insert(
        STEP_CREATE_ZIP,
        Arc::new(move || Box::new(zip::CreateZip::new(c.clone())) as _),
    );

    let c = config.clone();
    registry.insert(
        STEP_PREVIEW_PICTURE,
        Arc::new(move || Box::new(image::PreviewPicture::new(c.clone())) as _),
    );

    let c = config.clone();
    registry.insert(
        STEP_DECRYPT_CRYPT4GH,
        Arc::new(move || Box::new(crypt4gh::DecryptCrypt4gh::new(c.clone())) as _),
    );

    let c = config.clone();
    registry.insert(
        STEP_ADD_RECIPIENT_CRYPT4GH,
        Arc::new(move || Box::new(crypt4gh::AddRecipientCrypt4gh::new(c.clone())) as _),
    );

    registry.insert(
        STEP_VALIDATE_CRYPT4GH,
        Arc::new(move || Box::new(crypt4gh::ValidateCrypt4gh::new(config.clone())) as _),
    );
}
