use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{config::PipelineOpts, prelude::*, ui::Ui};

mod acquire;
mod async_utils;
mod cmd;
mod config;
mod data_url;
mod evaluate;
mod ocr;
mod pipeline;
mod prelude;
mod queues;
mod rate_limit;
mod retry;
mod ui;

/// Download archive volumes, OCR their pages and score the results.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - ARCHIVE_BASE_URL: The document archive API.
  - ARCHIVE_COOKIES_FILE (optional): JSON map of session cookies.
  - OPENAI_API_BASE (optional): Override the model server URL.
  - OPENAI_API_KEY: The key for the model server.
  - OCR_MODEL, OCR_CONCURRENCY (optional): Defaults for `ocr`.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(flatten)]
    pipeline: PipelineOpts,

    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// List the configured volumes.
    Volumes,
    /// Show which documents or pages a stage still has to process.
    Discover(cmd::discover::DiscoverOpts),
    /// Download baseline text, page images and optionally PDFs.
    Acquire(cmd::acquire::AcquireOpts),
    /// Transcribe page images with a vision model.
    Ocr(cmd::ocr::OcrOpts),
    /// Score OCR output against the baseline text.
    Evaluate(cmd::evaluate::EvaluateOpts),
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);
    tracing_subscriber::registry().with(subscriber).init();

    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    let pipeline = &opts.pipeline;
    match &opts.subcmd {
        Cmd::Volumes => cmd::volumes::cmd_volumes(pipeline).await,
        Cmd::Discover(discover_opts) => {
            cmd::discover::cmd_discover(&ui, pipeline, discover_opts).await
        }
        Cmd::Acquire(acquire_opts) => {
            cmd::acquire::cmd_acquire(&ui, pipeline, acquire_opts).await
        }
        Cmd::Ocr(ocr_opts) => cmd::ocr::cmd_ocr(&ui, pipeline, ocr_opts).await,
        Cmd::Evaluate(evaluate_opts) => {
            cmd::evaluate::cmd_evaluate(&ui, pipeline, evaluate_opts).await
        }
    }
}
