#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Populates an S3-compatible bucket with a Hugging Face model repository,
//! unless it is already there.
//!
//! Intended as a one-shot startup step: exits `0` on a cache hit or a
//! successful upload and `1` on any failure.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use clap::error::ErrorKind;
use model_cache_cli_utils::IndicatifProgress;
use model_cache_hub::{DEFAULT_CONCURRENCY, DEFAULT_ENDPOINT, HubClient};
use model_cache_loader::config::{DEFAULT_KEY_PREFIX, DEFAULT_REGION, DEFAULT_UPLOAD_CONCURRENCY};
use model_cache_loader::orchestrator::{RunState, failure, failure_banner};
use model_cache_loader::progress::null_progress;
use model_cache_loader::{CacheError, Loader, RawConfig};
use model_cache_models::{FailureStage, Revision, RunResult};
use model_cache_store::S3Store;

#[derive(Parser)]
#[command(
    name = "model_cache",
    about = "Cache a Hugging Face model repository in S3-compatible storage"
)]
struct Cli {
    /// Model repository to cache (e.g. `openai-community/gpt2`)
    #[arg(long, env = "MODEL_NAME")]
    model_name: String,

    /// Target bucket
    #[arg(long, env = "S3_BUCKET")]
    s3_bucket: String,

    /// Object store endpoint (e.g. `https://minio.internal:9000`)
    #[arg(long, env = "S3_ENDPOINT_URL")]
    s3_endpoint_url: String,

    /// Access key id for the object store
    #[arg(long, env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    aws_access_key_id: String,

    /// Secret access key for the object store
    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    aws_secret_access_key: String,

    /// Signing region
    #[arg(long, env = "S3_REGION", default_value = DEFAULT_REGION)]
    s3_region: String,

    /// Key prefix objects are stored under
    #[arg(long, env = "S3_PREFIX", default_value = DEFAULT_KEY_PREFIX)]
    s3_prefix: String,

    /// Token for private or gated repositories
    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    hf_token: Option<String>,

    /// Hub endpoint
    #[arg(long, env = "HF_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    hf_endpoint: String,

    /// Branch, tag or commit to fetch
    #[arg(long, env = "MODEL_REVISION", default_value = Revision::DEFAULT)]
    revision: String,

    /// Base directory for the staging directory [default: system temp dir]
    #[arg(long, env = "DOWNLOAD_DIR")]
    download_dir: Option<PathBuf>,

    /// Concurrent uploads
    #[arg(long, env = "UPLOAD_CONCURRENCY", default_value_t = DEFAULT_UPLOAD_CONCURRENCY)]
    upload_concurrency: usize,

    /// Concurrent file downloads
    #[arg(long, env = "DOWNLOAD_CONCURRENCY", default_value_t = DEFAULT_CONCURRENCY)]
    download_concurrency: usize,

    /// Disable progress bars
    #[arg(long, env = "DISABLE_PROGRESS")]
    disable_progress: bool,
}

impl Cli {
    fn into_raw(self) -> RawConfig {
        RawConfig {
            model_name: self.model_name,
            revision: self.revision,
            s3_bucket: self.s3_bucket,
            s3_prefix: self.s3_prefix,
            s3_endpoint_url: self.s3_endpoint_url,
            s3_region: self.s3_region,
            aws_access_key_id: self.aws_access_key_id,
            aws_secret_access_key: self.aws_secret_access_key,
            hf_token: self.hf_token,
            hf_endpoint: self.hf_endpoint,
            download_dir: self.download_dir.unwrap_or_else(std::env::temp_dir),
            upload_concurrency: self.upload_concurrency,
            download_concurrency: self.download_concurrency,
            disable_progress: self.disable_progress,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            e.print().ok();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };

    let multi = model_cache_cli_utils::init_logger();
    log::info!("Starting model cache population");

    RunState::Validating.enter();
    let config = match cli.into_raw().validate() {
        Ok(config) => config,
        Err(e) => return finish(&failure(&CacheError::from(e))),
    };
    config.log_summary();

    let store = S3Store::new(&config.s3_settings());
    let fetcher = match HubClient::new(config.hub_endpoint.clone(), config.download_concurrency) {
        Ok(fetcher) => fetcher,
        Err(e) => {
            let cause = format!("Failed to create hub client: {e}");
            log::error!("{cause}");
            return finish(&RunResult::Failed {
                stage: FailureStage::Fetch,
                cause,
            });
        }
    };

    let progress = if config.show_progress {
        IndicatifProgress::transfer_bar(&multi, "Uploading")
    } else {
        null_progress()
    };
    let loader = Loader::new(&config, &store, &fetcher).with_progress(progress);

    let result = tokio::select! {
        result = loader.run() => result,
        signal = shutdown_signal() => {
            let cause = format!("received {signal}, aborting");
            log::warn!("{cause}");
            let result = RunResult::Failed {
                stage: FailureStage::Interrupted,
                cause,
            };
            return finish(&result);
        }
    };

    ExitCode::from(result.exit_code())
}

/// Logs the banner for a run the loader did not report itself, and maps
/// the result to an exit code.
fn finish(result: &RunResult) -> ExitCode {
    if let RunResult::Failed { stage, cause } = result {
        failure_banner(stage, cause);
    }
    ExitCode::from(result.exit_code())
}

/// Resolves with the name of the first termination signal received.
async fn shutdown_signal() -> &'static str {
    let interrupt = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                log::warn!("Cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => "SIGINT",
        () = terminate => "SIGTERM",
    }
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, FromArgMatches as _};

    use super::*;

    /// Parses `args` with every environment fallback removed, so the
    /// result does not depend on the variables set where tests run.
    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        let matches = Cli::command()
            .mut_args(|arg| arg.env(None::<&str>))
            .try_get_matches_from(std::iter::once("model_cache").chain(args.iter().copied()))?;
        Cli::from_arg_matches(&matches)
    }

    const REQUIRED: &[&str] = &[
        "--model-name",
        "gpt2",
        "--s3-bucket",
        "my-cache",
        "--s3-endpoint-url",
        "http://localhost:9000",
        "--aws-access-key-id",
        "AKIAEXAMPLE1234",
        "--aws-secret-access-key",
        "secret-access-key-value",
    ];

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_fill_optional_inputs() {
        let raw = parse(REQUIRED).unwrap().into_raw();
        assert_eq!(raw.s3_prefix, "models/");
        assert_eq!(raw.s3_region, "us-east-1");
        assert_eq!(raw.revision, "main");
        assert_eq!(raw.hf_endpoint, "https://huggingface.co");
        assert_eq!(raw.upload_concurrency, 10);
        assert_eq!(raw.download_concurrency, 4);
        assert_eq!(raw.download_dir, std::env::temp_dir());
        assert!(!raw.disable_progress);
        assert!(raw.validate().is_ok());
    }

    #[test]
    fn environment_does_not_leak_into_parsing() {
        let command = Cli::command().mut_args(|arg| arg.env(None::<&str>));
        assert!(command.get_arguments().all(|arg| arg.get_env().is_none()));
        assert!(Cli::command().get_arguments().any(|arg| arg.get_env().is_some()));
    }

    #[test]
    fn missing_required_input_is_a_usage_error() {
        let err = parse(&REQUIRED[..2]).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn secret_env_vars_are_documented_in_help() {
        let help = Cli::command().render_long_help().to_string();
        assert!(help.contains("AWS_SECRET_ACCESS_KEY"));
        assert!(help.contains("HF_TOKEN"));
    }
}
