use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tradutor::translator::{TranslateError, Translator};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Human readable name for a language tag, falling back to the tag itself.
pub fn language_name(tag: &str) -> &str {
    match tag.to_ascii_lowercase().as_str() {
        "pt" => "Portuguese",
        "en" => "English",
        "es" => "Spanish",
        "fr" => "French",
        "de" => "German",
        _ => tag,
    }
}

pub fn build_prompt(text: &str, source_language: &str, target_language: &str) -> String {
    format!(
        "Translate the following text from {} to {}. Respond ONLY with the translated text, \
         without any greeting, explanation, comment or additional formatting.\n\n\
         Text to translate: \"{}\"",
        language_name(source_language),
        language_name(target_language),
        text
    )
}

/// A [`Translator`] calling the Gemini `generateContent` endpoint.
pub struct GeminiTranslator {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

#[derive(Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
}

#[derive(Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<Content>,
}

impl GenerateResponse {
    fn text(self) -> String {
        self.candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .map(|part| part.text)
                    .collect::<String>()
            })
            .unwrap_or_default()
    }
}

impl GeminiTranslator {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model,
            base_url: DEFAULT_BASE_URL.to_owned(),
        }
    }

    pub fn with_base_url(self, base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..self
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        )
    }
}

#[async_trait]
impl Translator for GeminiTranslator {
    async fn translate(
        &self,
        text: &str,
        source_language: &str,
        target_language: &str,
    ) -> Result<String, TranslateError> {
        tracing::debug!(
            source = language_name(source_language),
            target = language_name(target_language),
            "Requesting translation from Gemini"
        );
        let request = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: build_prompt(text, source_language, target_language),
                }],
            }],
        };

        let response = self
            .client
            .post(self.endpoint())
            .query(&[("key", &self.api_key)])
            .json(&request)
            .send()
            .await
            .map_err(|e| TranslateError::Provider(e.without_url().to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TranslateError::Provider(format!("HTTP {}: {}", status, body)));
        }

        let response: GenerateResponse = response
            .json()
            .await
            .map_err(|e| TranslateError::Provider(e.without_url().to_string()))?;

        let translated = response.text().trim().to_owned();
        if translated.is_empty() {
            return Err(TranslateError::EmptyResponse);
        }
        Ok(translated)
    }
}
