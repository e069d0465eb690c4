//! ModelPlay Worker - Main Entry Point
//!
//! Spawned by the supervisor as `modelplay-worker --spec <json>`; add
//! `--download` to fetch the model instead of serving it. Frames travel over
//! stdin/stdout, logs go to stderr.

use anyhow::{bail, Context};
use modelplay_common::ModelPlayConfig;
use modelplay_proto::LaunchSpec;
use modelplay_worker::{run_download, run_worker, ModelFactory};
use tracing::info;

struct Args {
    spec: LaunchSpec,
    download: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut spec = None;
    let mut download = false;
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--spec" => {
                let raw = args.next().context("--spec requires a value")?;
                spec = Some(serde_json::from_str(&raw).context("invalid --spec JSON")?);
            }
            "--download" => download = true,
            other => bail!("unexpected argument: {}", other),
        }
    }

    Ok(Args {
        spec: spec.context("missing --spec")?,
        download,
    })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Worker inherits the coordinator's environment, including log settings
    let observability = ModelPlayConfig::from_env()
        .map(|c| c.observability)
        .unwrap_or_default();
    modelplay_common::logging::init_logging(&observability)?;

    let args = parse_args()?;
    info!("Worker process {} started for {}", std::process::id(), args.spec.model_id());

    let factory = ModelFactory::with_builtin();
    let stdout = tokio::io::stdout();

    if args.download {
        run_download(args.spec, &factory, stdout).await?;
    } else {
        run_worker(args.spec, &factory, tokio::io::stdin(), stdout).await?;
    }

    Ok(())
}
