use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use indicatif::{ProgressBar, ProgressFinish, ProgressStyle};
use reqwest::Client;
use tokio::runtime::Runtime;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use e621_dl::api::{ApiClient, SearchQuery};
use e621_dl::cli::{Cli, CommandFactory, Parser};
use e621_dl::config::Config;
use e621_dl::limiter::RateLimiter;
use e621_dl::scheduler::Scheduler;

const SPINNER_FINISH_MODE: ProgressFinish = ProgressFinish::AndClear;
const SPINNER_TICK_SECS: f32 = 0.1;
/// e621 rejects requests without a descriptive user agent.
const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

#[inline]
fn build_spinner() -> ProgressBar {
    ProgressBar::new_spinner()
        .with_finish(SPINNER_FINISH_MODE)
        .with_style(
            ProgressStyle::with_template("{spinner:.blue} {msg}")
                .unwrap()
                // For more spinners check out the cli-spinners project:
                // https://github.com/sindresorhus/cli-spinners/blob/master/spinners.json
                // NOTE: use `ascii` only, because cmd/powershell maybe not support unicode.
                .tick_strings(&[".  ", ".. ", "...", " ..", "  .", "   "]),
        )
}

#[inline]
fn build_client(timeout: u64) -> reqwest::Result<Client> {
    let client_builder = Client::builder().user_agent(USER_AGENT);
    let client_builder = if timeout > 0 {
        client_builder.timeout(Duration::from_secs(timeout))
    } else {
        client_builder
    };
    client_builder.build()
}

#[inline]
fn init_tracing(verbose: bool) {
    let default_directive = if verbose {
        "e621_dl=debug"
    } else {
        "e621_dl=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[inline]
async fn async_main(config: Config) -> anyhow::Result<()> {
    let client = build_client(config.timeout).context("failed to build reqwest client")?;
    let api = ApiClient::new(client)
        .with_limiter(RateLimiter::with_interval(config.request_interval()));

    let scheduler = Scheduler::build(api, &config.download_dir, config.credentials.clone())
        .await
        .context("Unable to ensure the existence of the download directory")?;

    // Finish what the last run left behind before scheduling anything new.
    let repaired = scheduler
        .repair()
        .await
        .context("failed to finish partial downloads")?;
    if !repaired.is_empty() {
        tracing::info!("Finished {} partial downloads", repaired.len());
    }

    let spinner = build_spinner();
    spinner.enable_steady_tick(Duration::from_secs_f32(SPINNER_TICK_SECS));
    spinner.set_message("Checking tags...");
    let tags = scheduler
        .resolve(&config.tags)
        .await
        .context("failed to resolve tags")?;

    spinner.set_message("Searching posts...");
    let query = SearchQuery::new(&tags, config.min_score, &config.earliest_date);
    let posts = scheduler
        .collect(query, config.max_pages)
        .await
        .context("failed to search posts")?;
    spinner.finish_with_message("Search finished!");

    // HACK: This is not considered an error, so we just return Ok(()).
    if posts.is_empty() {
        println!("There is no post found with the given tags: {tags}");
        return Ok(());
    }

    let status = scheduler.launch(posts).await;
    tracing::info!(
        "Downloaded {}, already existed {}, failed {}",
        status.done,
        status.existed,
        status.failed
    );

    Ok(())
}

fn main() -> anyhow::Result<ExitCode> {
    // here, if parse fails, the program will be `abort`ed, and no `Drop` will be called,
    // but it's okay, because we don't need to clean up anything.
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match cli.config {
        Some(config) => config,
        None => match Cli::get_config_from_editor(&mut Cli::command()) {
            Ok(config) => config,
            // if we can't get the config from the editor, we drop the whole program.
            Err(err) => {
                let _ = err.print();
                return Ok(ExitCode::from(u8::try_from(err.exit_code()).unwrap_or(2)));
            }
        },
    };

    let runtime = Runtime::new().context("failed to build tokio runtime")?;
    runtime.block_on(async {
        tokio::select! {
            result = async_main(config) => {result},
            result = signal::ctrl_c() => {
                result.context("failed to listen for ctrl-c signal")?;
                // a partial file is left on disk, and finished on the next run
                println!("Ctrl-C received, exiting...");
                Ok(())
            },
        }
    })?;

    Ok(ExitCode::SUCCESS)
}
