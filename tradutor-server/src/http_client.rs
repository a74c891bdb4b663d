use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tradutor::{
    job::{JobId, JobView, TranslationRequest},
    polling::StatusSource,
};

use crate::handlers::{ErrorResponse, SubmitResponse, SubmitTranslation};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Server rejected the request with {status}: {message}")]
    Rejected { status: StatusCode, message: String },
}

/// Talks to a running translation API over HTTP.
#[derive(Clone, Debug)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        }
    }

    pub async fn submit(&self, request: TranslationRequest) -> Result<JobId, ClientError> {
        let body = SubmitTranslation {
            text: Some(request.text),
            source_language: Some(request.source_language),
            target_language: Some(request.target_language),
        };
        let response = self
            .client
            .post(format!("{}/translations", self.base_url))
            .json(&body)
            .send()
            .await?;

        if response.status() != StatusCode::ACCEPTED {
            return Err(rejected(response).await);
        }
        Ok(response.json::<SubmitResponse>().await?.request_id)
    }
}

async fn rejected(response: reqwest::Response) -> ClientError {
    let status = response.status();
    let message = match response.json::<ErrorResponse>().await {
        Ok(body) => body.error,
        Err(_) => status.canonical_reason().unwrap_or_default().to_owned(),
    };
    ClientError::Rejected { status, message }
}

#[async_trait]
impl StatusSource for ApiClient {
    type Error = ClientError;

    async fn fetch_status(&self, id: JobId) -> Result<Option<JobView>, Self::Error> {
        let response = self
            .client
            .get(format!("{}/translations/{}", self.base_url, id))
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(Some(response.json().await?)),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(rejected(response).await),
        }
    }
}
