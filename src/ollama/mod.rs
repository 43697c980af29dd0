
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::OllamaConfig;
use crate::embeddings::Embedder;
use crate::generation::Generator;
use crate::index::Embedding;
use crate::{RagError, Result};

/// HTTP client for a local Ollama server, serving both embeddings and completions
#[derive(Debug, Clone)]
pub struct OllamaClient {
    base_url: Url,
    embedding_model: String,
    generation_model: String,
    batch_size: u32,
    temperature: f32,
    agent: ureq::Agent,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Debug, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub size: Option<u64>,
    pub digest: Option<String>,
    pub details: Option<ModelDetails>,
}

#[derive(Debug, Deserialize)]
pub struct ModelDetails {
    pub format: Option<String>,
    pub family: Option<String>,
    pub parameter_size: Option<String>,
    pub quantization_level: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    models: Vec<ModelInfo>,
}

impl OllamaClient {
    #[inline]
    pub fn new(config: &OllamaConfig) -> Result<Self> {
        let base_url = config
            .ollama_url()
            .map_err(|e| RagError::Config(format!("Failed to build Ollama URL: {}", e)))?;

        Ok(Self {
            base_url,
            embedding_model: config.embedding_model.clone(),
            generation_model: config.generation_model.clone(),
            batch_size: config.batch_size.max(1),
            temperature: config.temperature,
            agent: build_agent(Duration::from_secs(config.timeout_seconds)),
        })
    }

    #[inline]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.agent = build_agent(timeout);
        self
    }

    #[inline]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Test connection to the Ollama server and verify both models are available
    #[inline]
    pub fn health_check(&self) -> Result<()> {
        debug!("Performing health check for Ollama at {}", self.base_url);

        let models = self.list_models()?;
        for model in [&self.embedding_model, &self.generation_model] {
            if !models.iter().any(|m| model_matches(&m.name, model)) {
                let available: Vec<&str> = models.iter().map(|m| m.name.as_str()).collect();
                warn!(
                    "Model {} not found. Available models: {:?}",
                    model, available
                );
                return Err(RagError::Config(format!(
                    "Model '{}' is not available. Available models: {:?}",
                    model, available
                )));
            }
        }

        info!(
            "Health check passed for Ollama server at {} with models {} and {}",
            self.base_url, self.embedding_model, self.generation_model
        );
        Ok(())
    }

    /// List all models installed on the server
    #[inline]
    pub fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let url = self.endpoint("/api/tags")?;
        debug!("Fetching available models from {}", url);

        let response_text = self
            .agent
            .get(url.as_str())
            .call()
            .and_then(|mut resp| resp.body_mut().read_to_string())
            .map_err(|e| RagError::Other(anyhow::anyhow!(describe_error(&e))))?;

        let models_response: ModelsResponse =
            serde_json::from_str(&response_text).map_err(|e| RagError::Parse {
                message: format!("Failed to parse models response: {}", e),
                raw: response_text.clone(),
            })?;

        debug!("Found {} models", models_response.models.len());
        Ok(models_response.models)
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| RagError::Config(format!("Failed to build {} URL: {}", path, e)))
    }

    fn post_json<T: Serialize>(&self, url: &Url, body: &T) -> std::result::Result<String, String> {
        let request_json = serde_json::to_string(body)
            .map_err(|e| format!("Failed to serialize request: {}", e))?;

        self.agent
            .post(url.as_str())
            .header("Content-Type", "application/json")
            .send(&request_json)
            .and_then(|mut resp| resp.body_mut().read_to_string())
            .map_err(|e| describe_error(&e))
    }

    /// Embed one batch with a single request
    fn embed_request(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let url = self.endpoint("/api/embed")?;
        let request = EmbedRequest {
            model: &self.embedding_model,
            input: texts,
        };

        let response_text = self
            .post_json(&url, &request)
            .map_err(RagError::EmbeddingService)?;

        let response: EmbedResponse = serde_json::from_str(&response_text).map_err(|e| {
            RagError::EmbeddingService(format!("Malformed embedding response: {}", e))
        })?;

        if response.embeddings.len() != texts.len() {
            return Err(RagError::EmbeddingService(format!(
                "Mismatch between request and response counts: {} vs {}",
                texts.len(),
                response.embeddings.len()
            )));
        }

        Ok(response.embeddings)
    }
}

impl Embedder for OllamaClient {
    #[inline]
    fn embedding_model(&self) -> &str {
        &self.embedding_model
    }

    #[inline]
    fn max_batch_size(&self) -> usize {
        self.batch_size as usize
    }

    #[inline]
    fn embed(&self, text: &str) -> Result<Embedding> {
        debug!("Generating embedding for text (length: {})", text.len());

        let mut embeddings = self.embed_request(&[text.to_string()])?;
        embeddings
            .pop()
            .ok_or_else(|| RagError::EmbeddingService("Empty embedding response".to_string()))
    }

    #[inline]
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!("Generating embeddings for {} texts", texts.len());

        let mut results = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size as usize) {
            results.extend(self.embed_request(batch)?);
        }

        debug!("Generated {} embeddings total", results.len());
        Ok(results)
    }
}

impl Generator for OllamaClient {
    #[inline]
    fn generation_model(&self) -> &str {
        &self.generation_model
    }

    #[inline]
    fn generate(&self, prompt: &str) -> Result<String> {
        debug!("Generating completion for prompt (length: {})", prompt.len());

        let url = self.endpoint("/api/generate")?;
        let request = GenerateRequest {
            model: &self.generation_model,
            prompt,
            stream: false,
            options: GenerateOptions {
                temperature: self.temperature,
            },
        };

        let response_text = self
            .post_json(&url, &request)
            .map_err(RagError::GenerationService)?;

        let response: GenerateResponse = serde_json::from_str(&response_text).map_err(|e| {
            RagError::GenerationService(format!(
                "Malformed generation response: {} (body: {})",
                e, response_text
            ))
        })?;

        debug!("Generated {} characters", response.response.len());
        Ok(response.response)
    }
}

fn build_agent(timeout: Duration) -> ureq::Agent {
    ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .build()
        .into()
}

/// Ollama lists models with an explicit tag, so `llama3.2` means `llama3.2:latest`
fn model_matches(available: &str, wanted: &str) -> bool {
    available == wanted || (!wanted.contains(':') && available == format!("{}:latest", wanted))
}

fn describe_error(error: &ureq::Error) -> String {
    match error {
        ureq::Error::StatusCode(status) if *status >= 500 => {
            warn!("Server error (status {})", status);
            format!("Server error: HTTP {}", status)
        }
        ureq::Error::StatusCode(status) => {
            warn!("Client error (status {})", status);
            format!("Client error: HTTP {}", status)
        }
        ureq::Error::ConnectionFailed
        | ureq::Error::HostNotFound
        | ureq::Error::Timeout(_)
        | ureq::Error::Io(_) => {
            warn!("Transport error: {}", error);
            format!("Transport error: {}", error)
        }
        _ => {
            warn!("Request error: {}", error);
            format!("Request error: {}", error)
        }
    }
}
