//! Packaged-food label analysis pipeline: photo normalization, multimodal
//! request construction, lenient result normalization and the
//! capture/analysis state machine that sequences them.

pub mod backend;
pub mod config;
pub mod error;
pub mod normalize;
pub mod report;
pub mod request;
pub mod result;
pub mod state;

pub use backend::{GeminiBackend, InferenceBackend};
pub use config::{BackendSettings, Config, NormalizeSettings};
pub use error::PipelineError;
pub use normalize::{normalize_image, normalize_image_async, NormalizedImage};
pub use request::{build_request, output_schema, AnalysisRequest, INSTRUCTION};
pub use result::{
    normalize_response, AnalysisResult, ChildSuitability, Ingredient, IngredientCategory,
    SuitabilityStatus,
};
pub use state::{
    AddOutcome, ImageId, NoPreviews, Phase, PipelineSnapshot, PipelineState, PreviewStore,
    RawFile, ScanController,
};
