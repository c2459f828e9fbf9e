// src/bin/runner-agent.rs
//! Runner Agent
//!
//! Process launched by the controller for each runner. After the handshake
//! the code archive is written to the work directory. Each request is then
//! handed to the configured command with the request JSON on stdin, and the
//! command prints a reply JSON on stdout. Without `--exec` the agent answers
//! every request with an echo.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use runner_controller::dispatch::request::{HandleReply, HttpResponse, JobRequest};
use runner_controller::observability::init_tracing;
use runner_controller::protocol::{JobHandler, RunnerClient, RunnerContext};
use runner_controller::utils::config::{LogFormat, ProtocolConfig};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "runner-agent", version, about = "Job runner launched by the runner controller")]
struct Args {
    #[arg(long)]
    runner_identifier: String,

    #[arg(long)]
    controller_host: String,

    #[arg(long)]
    controller_port: u16,

    /// Directory the code archive is written to
    #[arg(long, env = "RUNNER_WORK_DIR", default_value = "/tmp/runner-agent")]
    work_dir: PathBuf,

    /// Shell command run once per request
    #[arg(long, env = "RUNNER_EXEC")]
    exec: Option<String>,

    #[arg(long, env = "RUNNER_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let format = if args.log_json { LogFormat::Json } else { LogFormat::Pretty };
    init_tracing(format)?;

    let addr = (args.controller_host.as_str(), args.controller_port);
    let mut client = RunnerClient::connect(addr, &args.runner_identifier, ProtocolConfig::default())
        .await
        .with_context(|| {
            format!(
                "Failed to connect to controller at {}:{}",
                args.controller_host, args.controller_port
            )
        })?;

    let archive = client.handshake().await.context("Handshake failed")?;
    let archive_path = store_archive(&args.work_dir, &args.runner_identifier, &archive).await?;
    info!(
        runner_id = %args.runner_identifier,
        archive = ?archive_path,
        bytes = archive.len(),
        "Code archive stored"
    );

    let handler = match args.exec {
        Some(command) => Arc::new(AgentHandler::Exec {
            command,
            archive: archive_path,
        }),
        None => Arc::new(AgentHandler::Echo),
    };

    client.serve(handler).await?;
    info!(runner_id = %args.runner_identifier, "Runner stopped");
    Ok(())
}

async fn store_archive(work_dir: &Path, runner_id: &str, archive: &[u8]) -> Result<PathBuf> {
    tokio::fs::create_dir_all(work_dir)
        .await
        .with_context(|| format!("Failed to create work dir {:?}", work_dir))?;
    let path = work_dir.join(format!("{}.archive", runner_id));
    tokio::fs::write(&path, archive)
        .await
        .with_context(|| format!("Failed to write archive {:?}", path))?;
    Ok(path)
}

enum AgentHandler {
    Echo,
    Exec { command: String, archive: PathBuf },
}

#[async_trait]
impl JobHandler for AgentHandler {
    async fn handle(&self, request: JobRequest, ctx: RunnerContext) -> HandleReply {
        match self {
            AgentHandler::Echo => echo(&request),
            AgentHandler::Exec { command, archive } => {
                match run_command(command, archive, &ctx.runner_id, &request).await {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!(runner_id = %ctx.runner_id, error = %e, "Request command failed");
                        HandleReply::error(format!("{:#}", e))
                    }
                }
            }
        }
    }
}

fn echo(request: &JobRequest) -> HandleReply {
    match request {
        JobRequest::Http(http) => HandleReply {
            http: Some(HttpResponse {
                status: 200,
                headers: Default::default(),
                body: http.body.clone(),
            }),
            ..Default::default()
        },
        JobRequest::Mqtt(message) => HandleReply {
            mqtt: Some(message.clone()),
            ..Default::default()
        },
        JobRequest::Schedule => HandleReply::default(),
    }
}

async fn run_command(
    command: &str,
    archive: &Path,
    runner_id: &str,
    request: &JobRequest,
) -> Result<HandleReply> {
    let input = serde_json::to_vec(request)?;

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .env("RUNNER_ARCHIVE", archive)
        .env("RUNNER_ID", runner_id)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .context("Failed to spawn request command")?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(&input).await?;
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("command exited with {}: {}", output.status, stderr.trim());
    }

    let reply = serde_json::from_slice(&output.stdout).context("Command printed an invalid reply")?;
    Ok(reply)
}
