//! CLI subcommand: `sandshell pipe`
//!
//! Reads one JSON request per line from stdin and writes one JSON result per
//! line to stdout, in completion order. Requests are processed concurrently;
//! executions still queue on the shared sandbox.
//!
//! Request:  `{"id": 1, "query": "...", "command": "..."}` (`id` is echoed back)

use anyhow::Result;
use clap::Args;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::Config;
use crate::pipeline::{Pipeline, PipelineOutput};

#[derive(Args)]
pub struct PipeArgs {
    /// Maximum requests processed at once
    #[arg(short = 'j', long, default_value_t = 4)]
    pub concurrency: usize,
}

#[derive(Debug, Deserialize)]
struct PipeRequest {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    query: String,
    command: String,
}

#[derive(Debug, Serialize)]
struct PipeResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<serde_json::Value>,
    #[serde(flatten)]
    output: Option<PipelineOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub async fn run(args: PipeArgs) -> Result<()> {
    let config = Config::load()?;
    let pipeline = Arc::new(Pipeline::from_config(&config)?);
    let limit = Arc::new(Semaphore::new(args.concurrency.max(1)));
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = rx.recv().await {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tasks = JoinSet::new();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        let permit = limit.clone().acquire_owned().await?;
        let pipeline = pipeline.clone();
        let tx = tx.clone();
        tasks.spawn(async move {
            let response = handle_line(&pipeline, &line).await;
            if tx.send(response).is_err() {
                debug!("Output closed, dropping response");
            }
            drop(permit);
        });
    }

    while tasks.join_next().await.is_some() {}
    drop(tx);
    writer.await??;

    if let Err(e) = pipeline.shutdown().await {
        warn!(error = %e, "Failed to stop sandbox container");
    }
    Ok(())
}

async fn handle_line(pipeline: &Pipeline, line: &str) -> String {
    let response = match serde_json::from_str::<PipeRequest>(line) {
        Ok(request) => PipeResponse {
            output: Some(pipeline.process(&request.query, &request.command).await),
            id: request.id,
            error: None,
        },
        Err(e) => PipeResponse {
            id: None,
            output: None,
            error: Some(format!("invalid request: {}", e)),
        },
    };
    serde_json::to_string(&response)
        .unwrap_or_else(|e| serde_json::json!({ "error": e.to_string() }).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::mounts::test_table;
    use crate::sandbox::runtime::MockContainerRuntime;
    use crate::sandbox::{ContainerExecutor, ContainerSpec, SandboxBackend};
    use crate::security::{AuditLogger, CommandValidator};
    use crate::shell::PathTranslator;
    use std::time::Duration;
    use tempfile::TempDir;

    fn pipeline(tmp: &TempDir) -> Pipeline {
        let translator = PathTranslator::new(Arc::new(test_table()), "/Users/alice", "/home/user");
        let validator = CommandValidator::new(translator, "/home/user/workspace", "user");
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_exec().never();
        let spec = ContainerSpec {
            name: "sandshell-test".into(),
            image: "sandshell-sandbox:latest".into(),
            working_dir: "/home/user/workspace".into(),
            mounts: Vec::new(),
            memory: "512m".into(),
            cpus: "0.5".into(),
            pids_limit: 128,
        };
        let backend = SandboxBackend::Container(ContainerExecutor::new(
            Arc::new(runtime),
            spec,
            Vec::new(),
            Duration::from_secs(5),
            1024,
        ));
        Pipeline::new(
            validator,
            backend,
            AuditLogger::new(tmp.path()),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn echoes_id_and_flattens_output() {
        let tmp = TempDir::new().unwrap();
        let pipeline = pipeline(&tmp);

        let line = handle_line(
            &pipeline,
            r#"{"id": 7, "query": "wipe", "command": "rm -rf /"}"#,
        )
        .await;
        let json: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["allowed"], false);
        assert_eq!(json["errorKind"], "validation_blocked");
        assert!(json.get("error").is_none());
    }

    #[tokio::test]
    async fn malformed_request_gets_error_line() {
        let tmp = TempDir::new().unwrap();
        let pipeline = pipeline(&tmp);

        let line = handle_line(&pipeline, r#"{"query": "no command"}"#).await;
        let json: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert!(
            json["error"]
                .as_str()
                .unwrap()
                .starts_with("invalid request")
        );
        assert!(json.get("allowed").is_none());
        // Nothing reached the audit log.
        assert!(pipeline.audit().read_records(None).unwrap().is_empty());
    }
}
