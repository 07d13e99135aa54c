pub mod error;
pub mod metadata;
pub mod request;

pub use error::PipelineError;
pub use metadata::Metadata;
pub use request::{PipelineRequest, StepSpec};

// step type names recognised by the registry (server::registry wires each
// of these to a factory closure)
pub const STEP_PREVIEW_ZIP: &str = "preview_zip";
pub const STEP_PREVIEW_PICTURE: &str = "preview_picture";
pub const STEP_EXTRACT_FILE_ZIP: &str = "extract_file_zip";
pub const STEP_EXTRACT_DIRECTORY_ZIP: &str = "extract_directory_zip";
pub const STEP_CREATE_ZIP: &str = "create_zip";
pub const STEP_DECRYPT_CRYPT4GH: &str = "decrypt_crypt4gh";
pub const STEP_ADD_RECIPIENT_CRYPT4GH: &str = "add_recipient_crypt4gh";
pub const STEP_VALIDATE_CRYPT4GH: &str = "validate_crypt4gh";

// default file name the response adapter and create_zip step fall back to
// when a carrier doesn't supply its own
pub const DEFAULT_FILE_NAME: &str = "output";
pub const CREATED_ZIP_NAME: &str = "created.zip";
