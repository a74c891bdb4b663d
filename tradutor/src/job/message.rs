use serde::{Deserialize, Serialize};

use super::JobId;

/// A request to translate some text.
///
/// Not yet validated, see [`crate::admission::AdmissionService::submit`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationRequest {
    pub text: String,
    pub source_language: String,
    pub target_language: String,
}

impl TranslationRequest {
    pub fn new(
        text: impl Into<String>,
        source_language: impl Into<String>,
        target_language: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            source_language: source_language.into(),
            target_language: target_language.into(),
        }
    }
}

/// The descriptor carried by the queue from admission to a worker.
///
/// Holds everything needed to process the job without reading the store, so a redelivered
/// message can always be reprocessed.
///
/// On the wire this is `{requestId, text, sourceLanguage, targetLanguage}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    #[serde(rename = "requestId")]
    pub id: JobId,
    pub text: String,
    pub source_language: String,
    pub target_language: String,
}
