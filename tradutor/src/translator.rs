//! The seam to the external translation provider.
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Translates text between two languages.
///
/// Implementations are called from a spawned task, so a panic inside one is caught and recorded
/// as a failed job rather than taking the worker down.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Translator: Send + Sync + 'static {
    async fn translate(
        &self,
        text: &str,
        source_language: &str,
        target_language: &str,
    ) -> Result<String, TranslateError>;
}

#[async_trait]
impl<T: Translator + ?Sized> Translator for std::sync::Arc<T> {
    async fn translate(
        &self,
        text: &str,
        source_language: &str,
        target_language: &str,
    ) -> Result<String, TranslateError> {
        (**self)
            .translate(text, source_language, target_language)
            .await
    }
}

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("Translation provider error: {0}")]
    Provider(String),
    #[error("Translation provider returned an empty response")]
    EmptyResponse,
    #[error("Translation did not complete within {0:?}")]
    Timeout(Duration),
    #[error("Translation panicked: {0}")]
    Panicked(String),
}

impl TranslateError {
    /// A short machine readable category, recorded alongside the failure.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Provider(_) => "provider",
            Self::EmptyResponse => "empty_response",
            Self::Timeout(_) => "timeout",
            Self::Panicked(_) => "panic",
        }
    }
}
