use thiserror::Error;

/// Failures that can surface anywhere between picking a file and rendering a result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("could not decode image: {0}")]
    Decode(String),
    #[error("no images staged for analysis")]
    EmptyInput,
    /// Network, auth or service failure while talking to the backend.
    #[error("analysis backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("analysis backend returned an empty response")]
    EmptyResponse,
    #[error("analysis backend returned a malformed response: {0}")]
    MalformedResponse(String),
    #[error("{0}")]
    MissingCredential(String),
}

impl PipelineError {
    pub fn user_message(&self) -> String {
        match self {
            Self::Decode(_) => {
                "This file could not be read as an image. Please pick another photo.".to_string()
            }
            Self::EmptyInput => "Add at least one photo before analyzing.".to_string(),
            Self::BackendUnavailable(_) => {
                "The analysis service could not be reached. Please try again.".to_string()
            }
            Self::EmptyResponse => {
                "The analysis service returned no result. Please try again, ideally with a clearer photo."
                    .to_string()
            }
            Self::MalformedResponse(_) => {
                "The analysis result could not be understood. Please try again.".to_string()
            }
            Self::MissingCredential(remediation) => remediation.clone(),
        }
    }

    /// Whether repeating the same action can succeed without changing configuration.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::MissingCredential(_) | Self::EmptyInput)
    }
}
