//! External decomposition suggesters.
//!
//! A suggester is an optional source of feature names and descriptions. Its
//! output is advisory: the [`Decomposer`](super::Decomposer) validates it and
//! falls back to templates on any failure.

use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::DecomposeRequest;
use crate::models::{Effort, Priority};

/// One suggested feature. Only the name is required; everything else is
/// filled from the template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SuggestedFeature {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub effort: Option<Effort>,
    #[serde(default)]
    pub acceptance_criteria: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl SuggestedFeature {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            priority: None,
            effort: None,
            acceptance_criteria: None,
            files: Vec::new(),
            dependencies: Vec::new(),
        }
    }
}

#[async_trait]
pub trait Suggester: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    async fn suggest(&self, request: &DecomposeRequest) -> anyhow::Result<Vec<SuggestedFeature>>;
}

#[derive(Debug, Deserialize)]
struct SuggestResponse {
    features: Vec<SuggestedFeature>,
}

/// POSTs the request as JSON and expects `{"features": [...]}` back.
#[derive(Debug, Clone)]
pub struct HttpSuggester {
    url: String,
    timeout: Duration,
    client: Client,
}

impl HttpSuggester {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
            client: Client::new(),
        }
    }
}

#[async_trait]
impl Suggester for HttpSuggester {
    fn name(&self) -> &str {
        &self.url
    }

    async fn suggest(&self, request: &DecomposeRequest) -> anyhow::Result<Vec<SuggestedFeature>> {
        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .with_context(|| format!("suggester request to {} failed", self.url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("suggester returned {status}: {body}");
        }

        let parsed: SuggestResponse = response
            .json()
            .await
            .context("suggester returned malformed JSON")?;
        Ok(parsed.features)
    }
}
