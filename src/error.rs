use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("No text selected or clipboard is empty")]
    InputEmpty,

    #[error("No valid AI provider could be found or configured")]
    NoProviderAvailable,

    #[error("Provider error: {0}")]
    Provider(#[from] crate::provider::ProviderError),

    #[error("Output error: {0}")]
    Output(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
