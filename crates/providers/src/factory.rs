//! Provider factory: stored provider records to live clients.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use taskforge_core::agent::{Model, ProviderKind, ProviderRecord};
use taskforge_core::error::ProviderError;
use taskforge_core::provider::{ModelProvider, ProviderResolver};
use taskforge_security::SecretsManager;
use tracing::debug;

use crate::anthropic::AnthropicProvider;
use crate::openai_compat::{self, OpenAiCompatProvider};

/// Decrypts provider credentials and builds clients, one per record.
pub struct ProviderFactory {
    secrets: Arc<SecretsManager>,
    clients: Mutex<HashMap<String, Arc<dyn ModelProvider>>>,
}

impl ProviderFactory {
    pub fn new(secrets: Arc<SecretsManager>) -> Self {
        Self {
            secrets,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn build(&self, record: &ProviderRecord) -> Result<Arc<dyn ModelProvider>, ProviderError> {
        let api_key = self
            .secrets
            .open(&record.encrypted_credentials)
            .map_err(|e| ProviderError::Credentials(e.to_string()))?;

        let client: Arc<dyn ModelProvider> = match record.kind {
            ProviderKind::Anthropic => {
                let provider = AnthropicProvider::new(api_key);
                match &record.base_url {
                    Some(url) => Arc::new(provider.with_base_url(url)),
                    None => Arc::new(provider),
                }
            }
            ProviderKind::Openai => Arc::new(OpenAiCompatProvider::new(
                "openai",
                record
                    .base_url
                    .as_deref()
                    .unwrap_or(openai_compat::DEFAULT_BASE_URL),
                api_key,
            )),
        };
        Ok(client)
    }
}

#[async_trait]
impl ProviderResolver for ProviderFactory {
    async fn resolve(
        &self,
        model: &Model,
        record: &ProviderRecord,
    ) -> Result<Arc<dyn ModelProvider>, ProviderError> {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = clients.get(&record.id) {
            return Ok(client.clone());
        }

        debug!(provider = record.kind.as_str(), model = %model.name, "Building provider client");
        let client = self.build(record)?;
        clients.insert(record.id.clone(), client.clone());
        Ok(client)
    }
}
