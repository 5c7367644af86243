//! Child-process services.
//!
//! The request payload is written to the child's stdin as JSON and the
//! child's stdout is parsed as the JSON response. Run metadata is passed
//! through environment variables:
//!
//! - `CONDUCTOR_RUN_ID`
//! - `CONDUCTOR_STEP_ID`
//! - `CONDUCTOR_ATTEMPT`
//! - `CONDUCTOR_PRINCIPAL` (when the caller has one)
//!
//! A non-zero exit status is a remote failure of kind `exit_<code>`.
//! Dropping the call future kills the child.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use log::{debug, warn};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{Service, ServiceError, ServiceRequest};

/// Service implemented by an external program.
#[derive(Debug, Clone)]
pub struct CommandService {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
}

impl CommandService {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl Service for CommandService {
    async fn call(&self, request: ServiceRequest) -> Result<Value, ServiceError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .env("CONDUCTOR_RUN_ID", request.run_id.to_string())
            .env("CONDUCTOR_STEP_ID", &request.step_id)
            .env("CONDUCTOR_ATTEMPT", request.attempt.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(principal) = &request.caller.principal {
            cmd.env("CONDUCTOR_PRINCIPAL", principal);
        }
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
            debug!("Executing in directory: {}", dir.display());
        }

        let mut child = cmd.spawn().map_err(|e| {
            ServiceError::unreachable(format!("failed to start '{}': {}", self.program, e))
        })?;

        let body = serde_json::to_vec(&request.payload)
            .map_err(|e| ServiceError::remote("invalid_request", e.to_string()))?;

        // Feed stdin concurrently so a child that writes before reading
        // cannot deadlock against us.
        if let Some(mut stdin) = child.stdin.take() {
            let step_id = request.step_id.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&body).await {
                    debug!("Step '{}' child closed stdin early: {}", step_id, e);
                }
            });
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ServiceError::unreachable(format!("failed to wait for child: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let kind = match output.status.code() {
                Some(code) => format!("exit_{}", code),
                None => "terminated".to_string(),
            };
            warn!(
                "Step '{}' command '{}' failed with {}",
                request.step_id, self.program, kind
            );
            return Err(ServiceError::remote(kind, stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(stdout.trim())
            .map_err(|e| ServiceError::remote("invalid_output", e.to_string()))
    }
}
