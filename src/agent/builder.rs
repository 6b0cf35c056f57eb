use std::sync::Arc;
use uuid::Uuid;

use super::progress::{Callback, CallbackClient, HttpCallback, ProgressChannel};
use super::{Agent, AgentInfo, AgentParts};
use crate::config::{AgentOptions, SessionSettings};
use crate::llm::BackendFactory;
use crate::protocol::FunctionSet;
use crate::transport::CallEndpoint;
use crate::transport::ws::WsCallEndpoint;
use crate::{Error, Result};

pub struct AgentBuilder {
    name: String,
    prompt: String,
    options: AgentOptions,
    functions: Option<FunctionSet>,
    backend: Option<Arc<dyn BackendFactory>>,
    settings: SessionSettings,
    callback_url: Option<String>,
    callback_client: Option<Arc<dyn CallbackClient>>,
}

impl AgentBuilder {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prompt: String::new(),
            options: AgentOptions::default(),
            functions: None,
            backend: None,
            settings: SessionSettings::default(),
            callback_url: None,
            callback_client: None,
        }
    }

    #[must_use]
    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    #[must_use]
    pub fn options(mut self, options: AgentOptions) -> Self {
        self.options = options;
        self
    }

    /// Expose `functions` to the model; the backend must support function calls.
    #[must_use]
    pub fn functions(mut self, functions: FunctionSet) -> Self {
        self.functions = Some(functions);
        self
    }

    #[must_use]
    pub fn backend(mut self, backend: impl BackendFactory + 'static) -> Self {
        self.backend = Some(Arc::new(backend));
        self
    }

    #[must_use]
    pub fn shared_backend(mut self, backend: Arc<dyn BackendFactory>) -> Self {
        self.backend = Some(backend);
        self
    }

    #[must_use]
    pub fn settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// POST every progress message to `url` as well.
    #[must_use]
    pub fn callback_url(mut self, url: impl Into<String>) -> Self {
        self.callback_url = Some(url.into());
        self
    }

    /// Deliver callbacks with `client` instead of the default HTTP client.
    #[must_use]
    pub fn callback_client(mut self, client: impl CallbackClient + 'static) -> Self {
        self.callback_client = Some(Arc::new(client));
        self
    }

    /// Bind a WebSocket endpoint on `addr` serving `/agent/{name}` and start
    /// answering calls.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the socket cannot be bound.
    pub async fn listen(self, addr: &str) -> Result<Agent> {
        self.validate()?;
        let endpoint = WsCallEndpoint::bind(addr, &agent_path(&self.name)).await?;
        self.create(endpoint)
    }

    /// Start answering calls arriving on `endpoint`.
    ///
    /// # Errors
    /// Returns an error if no backend was configured, functions were supplied
    /// to a backend without function-call support, or the callback URL is invalid.
    #[allow(clippy::result_large_err)]
    pub fn create(self, endpoint: impl CallEndpoint + 'static) -> Result<Agent> {
        let backend = self.validate()?;
        let callback = match self.callback_url {
            Some(url) => {
                let client = match self.callback_client {
                    Some(client) => client,
                    None => Arc::new(HttpCallback::new()?),
                };
                Some(Callback { url, client })
            }
            None => None,
        };

        let info = AgentInfo {
            id: Uuid::new_v4().to_string(),
            address: endpoint.address(),
            path: agent_path(&self.name),
            progress_path: format!("/progress/{}", self.name),
            name: self.name,
        };
        let progress = ProgressChannel::new(info.name.clone(), callback, self.settings.callback_tries);
        let parts = AgentParts {
            prompt: self.prompt,
            options: self.options,
            functions: self.functions,
            backend,
            settings: self.settings,
            progress,
        };
        Ok(Agent::start(info, parts, Box::new(endpoint)))
    }

    #[allow(clippy::result_large_err)]
    fn validate(&self) -> Result<Arc<dyn BackendFactory>> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(Error::Config(format!("invalid agent name {:?}", self.name)));
        }
        let backend = self
            .backend
            .clone()
            .ok_or_else(|| Error::Config("model backend required".to_string()))?;
        if self.functions.is_some() && !backend.supports_functions() {
            return Err(Error::UnsupportedCapability("functions not supported by this model"));
        }
        if let Some(url) = &self.callback_url {
            url::Url::parse(url)?;
        }
        Ok(backend)
    }
}

fn agent_path(name: &str) -> String {
    format!("/agent/{name}")
}
