use anyhow::{Context, Result};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::browser::{BrowserPageSource, HttpPageSource, PageSource};
use crate::channel::controller::ProgressEvent;
use crate::channel::{Controller, Dispatcher, Hub, Request, Response, Worker};
use crate::cli::config::{FetchBackend, RankerConfig};
use crate::crawler::fetcher::{locate_in_entries, parse_listing, ListingSelectors};
use crate::crawler::task::{PositionResult, RankRecord};
use crate::crawler::{BatchRunner, PageFetcher, RetryingFetcher};
use crate::utils::MetricsCollector;

/// Arguments of the scan command
pub struct ScanArgs {
    pub keywords: Vec<String>,
    pub identifiers: Vec<String>,
    pub max_pages: Option<u32>,
    pub profile: Option<String>,
    pub output: Option<PathBuf>,
    pub one_shot: bool,
    pub request_delay_ms: Option<(u64, u64)>,
    pub retry_delay_ms: Option<(u64, u64)>,
}

/// Merge `--keyword` values with the lines of a keywords file
pub async fn collect_keywords(mut keywords: Vec<String>, file: Option<&Path>) -> Result<Vec<String>> {
    if let Some(path) = file {
        let contents = tokio::fs::read_to_string(path)
            .await
            .context(format!("Failed to read keywords file: {}", path.display()))?;

        keywords.extend(
            contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(String::from),
        );
    }

    if keywords.is_empty() {
        anyhow::bail!("No keywords given, use --keyword or --keywords-file");
    }

    Ok(keywords)
}

/// Run a batch through an in-process controller and worker
pub async fn scan(args: ScanArgs) -> Result<()> {
    let mut config = RankerConfig::load(args.profile.as_deref())?;
    if let Some(range) = args.request_delay_ms {
        config.pacing.request_delay_ms = range;
    }
    if let Some(range) = args.retry_delay_ms {
        config.pacing.retry_delay_ms = range;
    }
    config.validate()?;
    let max_pages = args.max_pages.unwrap_or(config.scan.max_pages);

    let browser = match config.fetch.backend {
        FetchBackend::Webdriver => Some(Arc::new(BrowserPageSource::new(config.fetch.clone()))),
        FetchBackend::Http => None,
    };
    let source: Arc<dyn PageSource> = match &browser {
        Some(browser) => browser.clone() as Arc<dyn PageSource>,
        None => Arc::new(HttpPageSource::new(&config.fetch)?) as Arc<dyn PageSource>,
    };

    let fetcher = PageFetcher::new(
        source,
        config.listing.clone(),
        Duration::from_secs(config.fetch.timeout_secs),
    )?;
    let retrying = RetryingFetcher::new(Arc::new(fetcher), &config.pacing, MetricsCollector::new());
    let runner = Arc::new(BatchRunner::new(retrying, config.scan.page_size));
    let dispatcher = Arc::new(Dispatcher::new(runner));

    let (hub, listener) = Hub::new();
    let controller = Controller::start(hub.clone(), listener);
    let worker = Worker::spawn(hub, dispatcher, &config.channel).await;

    let request = Request::BatchSearch {
        keywords: args.keywords,
        identifiers: args.identifiers,
        max_pages,
    };

    let mut progress = controller.subscribe_progress();
    let response = if args.one_shot {
        with_progress(&mut progress, controller.request_one_shot(request)).await
    } else {
        if controller.wait_connected(Duration::from_secs(2)).await {
            debug!(
                "Channel #{} open to {}",
                controller.connection_count().await,
                controller.origin().await.as_deref().unwrap_or("unknown origin")
            );
        } else {
            warn!("Worker channel not up yet, request will go one-shot");
        }
        with_progress(&mut progress, controller.request(request)).await
    };

    worker.unload().await;
    if let Some(browser) = browser {
        browser.close().await;
    }

    match &args.output {
        Some(path) => {
            let json = serde_json::to_string_pretty(&response).context("Failed to serialize response")?;
            tokio::fs::write(path, json)
                .await
                .context(format!("Failed to write output file: {}", path.display()))?;
            info!("Response written to: {}", path.display());
        }
        None => print_response(&response),
    }

    if !response.success {
        anyhow::bail!(
            "{}: {}",
            response.message,
            response.error.as_deref().unwrap_or("no details")
        );
    }

    Ok(())
}

/// Await `request`, logging each progress line relayed while it runs
async fn with_progress<F>(progress: &mut broadcast::Receiver<ProgressEvent>, request: F) -> Response
where
    F: Future<Output = Response>,
{
    tokio::pin!(request);

    let response = loop {
        tokio::select! {
            biased;
            event = progress.recv() => match event {
                Ok(event) => info!("{}", event.message),
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} progress lines", skipped),
                Err(RecvError::Closed) => break (&mut request).await,
            },
            response = &mut request => break response,
        }
    };

    while let Ok(event) = progress.try_recv() {
        info!("{}", event.message);
    }
    response
}

fn print_response(response: &Response) {
    if let Some(results) = &response.results {
        if results.is_empty() {
            println!("No identifiers found");
        } else {
            println!(
                "{:<30} {:<14} {:>4} {:>8} {:>7} {:>8}",
                "KEYWORD", "IDENTIFIER", "PAGE", "POSITION", "OVERALL", "PROMOTED"
            );
            for record in results {
                println!("{}", format_record(record));
            }
        }
    }

    if let Some(summary) = &response.summary {
        println!(
            "Attempted: {}  Found: {}  Not found: {}  Failed: {}",
            summary.attempted, summary.found, summary.not_found, summary.failed
        );
    }

    println!("{}", response.message);
    if let Some(error) = &response.error {
        println!("Error: {}", error);
    }
}

fn format_record(record: &RankRecord) -> String {
    let or_dash = |value: Option<u32>| value.map_or_else(|| "-".to_string(), |v| v.to_string());

    format!(
        "{:<30} {:<14} {:>4} {:>8} {:>7} {:>8}",
        record.keyword,
        record.identifier,
        record.page,
        or_dash(record.position),
        or_dash(record.overall_rank),
        if record.is_promoted { "yes" } else { "no" }
    )
}

/// Locate an identifier in a saved listing page
pub async fn locate(html: PathBuf, id: String, profile: Option<String>) -> Result<()> {
    let config = RankerConfig::load(profile.as_deref())?;
    let position = locate_in_file(&config, &html, &id).await?;

    println!("{}", serde_json::to_string_pretty(&position)?);
    Ok(())
}

async fn locate_in_file(config: &RankerConfig, html: &Path, id: &str) -> Result<PositionResult> {
    let contents = tokio::fs::read_to_string(html)
        .await
        .context(format!("Failed to read listing file: {}", html.display()))?;

    let selectors = ListingSelectors::compile(&config.listing)?;
    let entries = parse_listing(&contents, &selectors)?;
    info!("Listing has {} entries", entries.len());

    Ok(locate_in_entries(&entries, id, 1).unwrap_or_else(PositionResult::not_found))
}

/// List all available configuration profiles
pub async fn list_profiles() -> Result<()> {
    let profiles = RankerConfig::list_profiles().await?;

    println!("Available configuration profiles:");
    for profile in profiles {
        println!("  - {}", profile);
    }

    Ok(())
}

/// Show a profile, creating it from the defaults when missing
pub async fn manage_profile(profile_name: String) -> Result<()> {
    match RankerConfig::load_profile(&profile_name) {
        Ok(config) => {
            println!("Profile: {}", profile_name);
            println!("{}", serde_yaml::to_string(&config)?);
        },
        Err(_) => {
            warn!("Profile '{}' does not exist. Creating a default profile.", profile_name);
            let config = RankerConfig::default();
            config.save_as_profile(&profile_name).await?;
            println!("Created default profile: {}", profile_name);
        }
    }

    Ok(())
}

/// Show the current configuration
pub async fn show_config() -> Result<()> {
    let config = RankerConfig::load_default()?;
    println!("Current configuration:");
    println!("{}", serde_yaml::to_string(&config)?);

    Ok(())
}
