mod cli;

use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use serde_json::Value;
use space_client::{
    ClientConfig, Credential, RuntimeStage, SessionOptions, SpaceClient, SpaceTarget, Submission,
    UploadFile,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

use cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let client =
        SpaceClient::new(ClientConfig::from_env()).context("failed to build space client")?;
    let target = SpaceTarget::parse(&cli.space)?;
    let credential = Credential::from_optional(cli.token.as_deref());

    if cli.wake_only {
        return wake_only(&client, &target, credential.as_ref()).await;
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling");
            on_signal.cancel();
        }
    });

    let (status_tx, mut status_rx) = tokio::sync::mpsc::unbounded_channel();
    let progress = tokio::spawn(async move {
        while let Some(status) = status_rx.recv().await {
            info!(status = ?status, "resolution progress");
        }
    });

    let mut options = SessionOptions::new()
        .with_credential(credential)
        .with_cancel(cancel)
        .with_exchange_token(cli.exchange_token)
        .with_credential_validation(cli.whoami)
        .with_status(status_tx);
    if let Some(secs) = cli.timeout {
        options = options.with_runtime_timeout(Duration::from_secs(secs));
    }

    let resolved = client.resolve(target, options).await;
    let _ = progress.await;
    let session = resolved.context("failed to resolve space")?;
    println!("{session}");

    if !cli.upload.is_empty() {
        let mut files = Vec::with_capacity(cli.upload.len());
        for path in &cli.upload {
            let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            files.push(UploadFile::new(name, bytes));
        }
        let uploaded = client.upload(&session, files).await.context("upload failed")?;
        for path in &uploaded.paths {
            println!("uploaded: {path}");
        }
    }

    let submission = match (cli.endpoint, cli.fn_index) {
        (Some(endpoint), _) => Some(Submission::by_name(endpoint, parse_inputs(&cli.data)?)),
        (None, Some(index)) => Some(Submission::by_index(index, parse_inputs(&cli.data)?)),
        (None, None) => None,
    };
    if let Some(submission) = submission {
        let output = client
            .predict(&session, &submission)
            .await
            .context("prediction failed")?;
        println!("{}", serde_json::to_string_pretty(&output)?);
    }

    Ok(())
}

async fn wake_only(
    client: &SpaceClient,
    target: &SpaceTarget,
    credential: Option<&Credential>,
) -> anyhow::Result<()> {
    let Some(reference) = target.reference() else {
        bail!("--wake-only needs an owner/name reference, not a URL");
    };
    let stage = client.runtime().stage(reference, credential).await?;
    println!("{reference}: {stage}");
    if stage == RuntimeStage::Paused {
        client.runtime().wake(reference, credential).await?;
        println!("{reference}: wake requested");
    }
    Ok(())
}

fn parse_inputs(raw: &str) -> anyhow::Result<Vec<Value>> {
    let value: Value = serde_json::from_str(raw).context("--data is not valid JSON")?;
    Ok(match value {
        Value::Array(items) => items,
        other => vec![other],
    })
}

fn init_tracing() {
    tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}
