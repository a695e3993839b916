// Docker-backed container runtime. Builds one image per function build
// unit and runs each invocation in a fresh container: create, start,
// collect output, wait for exit, remove. Containers are disposable; the
// image tag is the only durable artifact.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::{BuildImageOptions, RemoveImageOptions};
use bollard::Docker;
use futures::StreamExt;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use deployr_common::{
    ContainerRef, ContainerRuntime, DeployrError, FunctionExecutionResult, Result as CommonResult,
};

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Image build failed: {0}")]
    BuildFailed(String),
    #[error("Container creation failed: {0}")]
    CreationFailed(#[source] BollardError),
    #[error("Container start failed: {0}")]
    StartFailed(#[source] BollardError),
    #[error("Container wait failed: {0}")]
    WaitFailed(String),
    #[error("Docker API error: {0}")]
    DockerApi(#[from] BollardError),
    #[error("Build context error: {0}")]
    BuildContext(#[from] std::io::Error),
}

impl From<ExecutorError> for DeployrError {
    fn from(err: ExecutorError) -> Self {
        DeployrError::Container(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Arc<Docker>,
}

impl DockerRuntime {
    pub fn new(docker: Arc<Docker>) -> Self {
        Self { docker }
    }

    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self::new(Arc::new(docker)))
    }

    async fn remove_existing_image(&self, tag: &str) {
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_image(tag, Some(options), None).await {
            Ok(_) => info!(%tag, "Removed existing image before rebuild"),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => warn!(%tag, error = %e, "Could not remove existing image, continuing"),
        }
    }

    fn tar_build_context(build_path: &Path) -> Result<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());
        builder.append_dir_all(".", build_path)?;
        Ok(builder.into_inner()?)
    }

    async fn run_container(
        &self,
        image_tag: &str,
        function_name: &str,
        event: &Value,
    ) -> Result<FunctionExecutionResult> {
        let request_id = Uuid::new_v4().to_string();
        let event_json = event.to_string();

        let mut env = Vec::new();
        if let Some(user_id) = event.get("userId").and_then(Value::as_str) {
            env.push(format!("USER_ID={user_id}"));
        }

        let container_name = format!("deployr-{}-{}", function_name, request_id);
        let create_options = Some(CreateContainerOptions {
            name: container_name.clone(),
            ..Default::default()
        });
        let config = Config {
            image: Some(image_tag.to_string()),
            cmd: Some(vec![
                "python".to_string(),
                "-u".to_string(),
                "function_wrapper.py".to_string(),
                event_json,
            ]),
            env: Some(env),
            tty: Some(false),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(create_options, config)
            .await
            .map_err(ExecutorError::CreationFailed)?;
        let container_id = created.id;
        debug!(%container_id, name = %container_name, "Container created");

        // Attach before starting so no output is lost.
        let attach_options = AttachContainerOptions::<String> {
            stream: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            ..Default::default()
        };
        let AttachContainerResults { mut output, .. } = self
            .docker
            .attach_container(&container_id, Some(attach_options))
            .await
            .map_err(ExecutorError::DockerApi)?;

        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(ExecutorError::StartFailed)?;
        debug!(%container_id, "Container started");

        let container_id_for_logs = container_id.clone();
        let log_handle = tokio::spawn(async move {
            let mut stdout = String::new();
            let mut stderr = String::new();
            while let Some(entry) = output.next().await {
                match entry {
                    Ok(LogOutput::StdOut { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, container_id = %container_id_for_logs, "Log stream error");
                    }
                }
            }
            (stdout, stderr)
        });

        let wait_options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut wait_stream = self.docker.wait_container(&container_id, Some(wait_options));
        let wait_result = wait_stream.next().await;

        let (stdout, stderr) = log_handle.await.unwrap_or_else(|e| {
            error!(error = %e, %container_id, "Log collection task panicked");
            (String::new(), String::new())
        });

        let exit_code = match wait_result {
            Some(Ok(body)) => body.status_code,
            Some(Err(e)) => {
                self.remove_container(&container_id).await;
                return Err(ExecutorError::WaitFailed(format!(
                    "{e}. Logs: {stderr}"
                )));
            }
            None => {
                self.remove_container(&container_id).await;
                return Err(ExecutorError::WaitFailed(
                    "wait stream ended unexpectedly".into(),
                ));
            }
        };

        self.remove_container(&container_id).await;

        if exit_code != 0 {
            error!(%container_id, exit_code, "Container exited with non-zero status");
            return Ok(FunctionExecutionResult::error(format!(
                "Container failed with exit code: {exit_code}. Logs: {}",
                if stderr.is_empty() { &stdout } else { &stderr }
            )));
        }

        Ok(parse_wrapper_output(&stdout))
    }

    async fn remove_container(&self, container_id: &str) {
        let options = Some(RemoveContainerOptions {
            force: true,
            ..Default::default()
        });
        if let Err(e) = self.docker.remove_container(container_id, options).await {
            // Cleanup failure is not an execution failure.
            warn!(%container_id, error = %e, "Failed to remove container");
        }
    }
}

/// The wrapper prints a single JSON object as its last stdout line:
/// `{"statusCode": ..., "headers": ..., "body": ...}`. Anything else is
/// treated as a plain-text 200 so misbehaving functions still respond.
fn parse_wrapper_output(stdout: &str) -> FunctionExecutionResult {
    let last_json_line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| line.starts_with('{') && line.ends_with('}'));

    if let Some(line) = last_json_line {
        if let Ok(value) = serde_json::from_str::<Value>(line) {
            let status_code = value
                .get("statusCode")
                .and_then(Value::as_u64)
                .unwrap_or(200) as u16;
            let headers: HashMap<String, String> = value
                .get("headers")
                .and_then(Value::as_object)
                .map(|map| {
                    map.iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                        .collect()
                })
                .unwrap_or_default();
            let body = value.get("body").cloned().unwrap_or(Value::Null);

            return if status_code < 400 {
                FunctionExecutionResult::success(status_code, headers, body)
                    .unwrap_or_else(|_| FunctionExecutionResult::error("Invalid wrapper result"))
            } else {
                let message = body
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("Function returned status {status_code}"));
                let mut result = FunctionExecutionResult::error_with_status(status_code, message);
                result.body = deployr_common::execution::normalize_body(body);
                result
            };
        }
    }

    FunctionExecutionResult::success(200, HashMap::new(), Value::String(stdout.to_string()))
        .unwrap_or_else(|_| FunctionExecutionResult::error("Empty wrapper output"))
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    #[instrument(skip(self, env), fields(%tag))]
    async fn build_image(
        &self,
        tag: &str,
        build_path: &Path,
        env: &HashMap<String, String>,
    ) -> CommonResult<ContainerRef> {
        if !build_path.is_dir() {
            return Err(DeployrError::not_found(
                "Build directory",
                build_path.display().to_string(),
            ));
        }

        self.remove_existing_image(tag).await;

        let context = Self::tar_build_context(build_path).map_err(DeployrError::from)?;
        let buildargs: HashMap<String, String> =
            env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: tag.to_string(),
            rm: true,
            buildargs,
            ..Default::default()
        };

        let mut stream = self
            .docker
            .build_image(options, None, Some(context.into()));
        while let Some(progress) = stream.next().await {
            let info = progress.map_err(|e| ExecutorError::BuildFailed(e.to_string()))?;
            if let Some(detail) = info.error {
                return Err(ExecutorError::BuildFailed(detail).into());
            }
            if let Some(message) = info.stream {
                let message = message.trim();
                if !message.is_empty() {
                    debug!(%tag, "{message}");
                }
            }
        }

        info!(%tag, "Image built");
        Ok(ContainerRef::new(tag, tag.rsplit('-').next().unwrap_or(tag)))
    }

    #[instrument(skip(self, event), fields(image = %container.image_tag))]
    async fn execute(
        &self,
        container: &ContainerRef,
        event: &Value,
    ) -> CommonResult<FunctionExecutionResult> {
        container.validate()?;
        self.run_container(&container.image_tag, &container.function_name, event)
            .await
            .map_err(DeployrError::from)
    }

    async fn cleanup_image(&self, tag: &str) -> CommonResult<bool> {
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_image(tag, Some(options), None).await {
            Ok(_) => {
                info!(%tag, "Image removed");
                Ok(true)
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(ExecutorError::DockerApi(e).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapper_json_line_is_parsed_into_a_result() {
        let stdout = "booting\n{\"statusCode\": 201, \"headers\": {\"Content-Type\": \"application/json\"}, \"body\": \"{\\\"id\\\": 7}\"}\n";
        let result = parse_wrapper_output(stdout);
        assert!(result.success);
        assert_eq!(result.status_code, 201);
        assert_eq!(result.headers["Content-Type"], "application/json");
        assert_eq!(result.body, serde_json::json!({ "id": 7 }));
    }

    #[test]
    fn wrapper_error_status_becomes_a_failed_result() {
        let stdout = "{\"statusCode\": 500, \"headers\": {}, \"body\": \"internal\"}";
        let result = parse_wrapper_output(stdout);
        assert!(!result.success);
        assert_eq!(result.status_code, 500);
        assert!(result.error_message.is_some());
    }

    #[test]
    fn non_json_output_is_a_plain_text_200() {
        let result = parse_wrapper_output("hello world\n");
        assert!(result.success);
        assert_eq!(result.status_code, 200);
        assert_eq!(result.body, Value::String("hello world\n".into()));
    }

    #[test]
    fn tar_context_includes_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM python:3.11-slim\n").unwrap();
        std::fs::create_dir_all(dir.path().join("serverless_platform")).unwrap();
        std::fs::write(dir.path().join("serverless_platform/adapter.py"), "x = 1\n").unwrap();

        let bytes = DockerRuntime::tar_build_context(dir.path()).unwrap();
        assert!(!bytes.is_empty());

        let mut archive = tar::Archive::new(bytes.as_slice());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert!(names.iter().any(|n| n.contains("Dockerfile")));
        assert!(names.iter().any(|n| n.contains("adapter.py")));
    }

    // Exercises the real Docker daemon; run with `cargo test -- --ignored`
    // on a host with Docker available.
    #[tokio::test]
    #[ignore = "requires a local Docker daemon"]
    async fn cleanup_of_missing_image_reports_false() {
        let runtime = DockerRuntime::connect().unwrap();
        let removed = runtime
            .cleanup_image("deployr-test-image-that-does-not-exist")
            .await
            .unwrap();
        assert!(!removed);
    }
}
