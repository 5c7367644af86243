//! Service Layer
//!
//! Steps call *services*: named capabilities such as `image_analysis` or
//! `recommendation`. A [`ServiceRegistry`] maps endpoint names to
//! implementations of the [`Service`] trait.
//!
//! # Implementations
//!
//! - [`http`]: JSON over HTTP POST
//! - [`command`]: JSON over a child process's stdin/stdout
//! - [`function`]: in-process async closures

pub mod command;
pub mod function;
pub mod http;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::ServiceConfig;
use crate::error::ConfigError;
use crate::execution::context::RunId;

pub use command::CommandService;
pub use function::{service_fn, FnService};
pub use http::HttpService;

/// Identity of whoever started a run, forwarded to every service call.
#[derive(Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct CallerContext {
    pub principal: Option<String>,
    /// Never serialized or logged.
    #[serde(skip_serializing, default)]
    pub bearer_token: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl CallerContext {
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: Some(principal.into()),
            ..Self::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

impl fmt::Debug for CallerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallerContext")
            .field("principal", &self.principal)
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<redacted>"))
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// One call to a service.
#[derive(Debug, Clone)]
pub struct ServiceRequest {
    pub run_id: RunId,
    pub step_id: String,
    pub attempt: u32,
    pub payload: Value,
    pub caller: Arc<CallerContext>,
    /// Time left for this attempt; implementations may use it for their
    /// own transport timeouts.
    pub timeout: Duration,
}

/// How a service call failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
    /// The service answered with an error.
    #[error("{kind}: {detail}")]
    Remote { kind: String, detail: String },

    /// The service could not be reached or did not answer.
    #[error("unreachable: {0}")]
    Unreachable(String),
}

impl ServiceError {
    pub fn remote(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Remote {
            kind: kind.into(),
            detail: detail.into(),
        }
    }

    pub fn unreachable(detail: impl Into<String>) -> Self {
        Self::Unreachable(detail.into())
    }
}

/// A callable service capability.
#[async_trait]
pub trait Service: Send + Sync {
    async fn call(&self, request: ServiceRequest) -> Result<Value, ServiceError>;
}

/// Endpoint name to service lookup.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Arc<dyn Service>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from configured services.
    pub fn from_config(services: &BTreeMap<String, ServiceConfig>) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        for (name, config) in services {
            let service: Arc<dyn Service> = match config {
                ServiceConfig::Http { url, headers } => {
                    Arc::new(HttpService::new(url.clone()).with_headers(headers.clone()))
                }
                ServiceConfig::Command { program, args, env } => {
                    if program.trim().is_empty() {
                        return Err(ConfigError::InvalidService {
                            name: name.clone(),
                            reason: "program must not be empty".to_string(),
                        });
                    }
                    Arc::new(
                        CommandService::new(program.clone())
                            .with_args(args.clone())
                            .with_env(env.clone()),
                    )
                }
            };
            debug!("Registered service '{}'", name);
            registry.register(name.clone(), service);
        }
        Ok(registry)
    }

    /// Registers a service, replacing any previous one under that name.
    pub fn register(&mut self, name: impl Into<String>, service: Arc<dyn Service>) {
        self.services.insert(name.into(), service);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, name: impl Into<String>, service: impl Service + 'static) -> Self {
        self.register(name, Arc::new(service));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.services.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.services.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.names())
            .finish()
    }
}
