use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::info;

use varsync::catalog;
use varsync::{DownloadState, Engine, EngineEvent, SearchResult};

/// Resolve pasted package lists against installed packages and the remote
/// catalog, and download what is missing or outdated.
#[derive(Parser)]
#[command(name = "varsync")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file to use instead of the per-user one
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Never touch the network
    #[arg(long, global = true)]
    offline: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the local and remote status of every package named in the input
    Resolve {
        /// Text file holding the list; stdin when omitted
        file: Option<PathBuf>,
    },
    /// Download missing and outdated packages named in the input
    Download {
        /// Text file holding the list; stdin when omitted
        file: Option<PathBuf>,
        /// Only replace installed packages that have a newer version
        #[arg(long)]
        updates_only: bool,
    },
    /// Inspect or manage the remote catalog
    Catalog {
        #[command(subcommand)]
        action: CatalogAction,
    },
    /// List installed packages
    List,
    /// Remove partial downloads left behind by an interrupted run
    Clean,
}

#[derive(Subcommand)]
enum CatalogAction {
    /// Fetch the catalog again, ignoring the cache
    Refresh,
    /// Show what is loaded
    Status,
    /// Encrypt a plaintext catalog with the configured passphrase
    Seal { plaintext: PathBuf, output: PathBuf },
}

fn load_settings(cli: &Cli) -> Result<settings::SettingsYaml> {
    let mut settings = match &cli.config {
        Some(path) => settings::load_from(path),
        None => settings::get_settings(),
    }
    .map_err(|e| anyhow!(e))?;
    if cli.offline {
        settings.allow_network = false;
    }
    Ok(settings)
}

async fn read_input(file: Option<&Path>) -> Result<String> {
    match file {
        Some(path) => {
            fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
        }
        None => {
            let mut input = String::new();
            tokio::io::stdin()
                .read_to_string(&mut input)
                .await
                .context("Failed to read stdin")?;
            Ok(input)
        }
    }
}

fn describe(result: &SearchResult) -> String {
    let local = match (&result.local_name, result.size_bytes) {
        (Some(name), Some(size)) => format!("{name} ({})", utils::format_bytes(size)),
        (Some(name), None) => name.clone(),
        _ => String::from("not installed"),
    };
    let remote = match &result.remote_canonical_name {
        Some(name) if result.has_newer_remote_version => format!("{name} (update)"),
        Some(name) => name.clone(),
        None => String::from("not in catalog"),
    };
    format!("{:<40} {:<40} {}", result.requested_name, local, remote)
}

fn print_results(results: &[SearchResult]) {
    if results.is_empty() {
        println!("No package names found in the input.");
        return;
    }
    println!("{:<40} {:<40} REMOTE", "REQUESTED", "LOCAL");
    for result in results {
        println!("{}", describe(result));
    }
}

fn wants_download(result: &SearchResult, updates_only: bool) -> bool {
    if !result.is_available_remotely {
        return false;
    }
    if updates_only {
        result.has_newer_remote_version
    } else {
        !result.is_local || result.has_newer_remote_version
    }
}

// One bar per key, driven by engine events until the queue drains
fn spawn_progress(engine: &Engine) -> tokio::task::JoinHandle<()> {
    let mut events = engine.subscribe();
    tokio::spawn(async move {
        let bars = MultiProgress::new();
        let style = ProgressStyle::default_bar()
            .template("{msg:30} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        let mut by_key: HashMap<String, ProgressBar> = HashMap::new();
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            };
            match event {
                EngineEvent::DownloadProgress { key, bytes, total, .. } => {
                    let bar = by_key.entry(key.clone()).or_insert_with(|| {
                        let bar = bars.add(ProgressBar::new(total.unwrap_or(0)));
                        bar.set_style(style.clone());
                        bar.set_message(key);
                        bar
                    });
                    if let Some(total) = total {
                        bar.set_length(total);
                    }
                    bar.set_position(bytes);
                }
                EngineEvent::DownloadError { key, message } => {
                    let _ = bars.println(format!("{key}: {message}"));
                }
                EngineEvent::DownloadStateChanged { key, state } if state.is_terminal() => {
                    if let Some(bar) = by_key.remove(&key) {
                        let text = match state {
                            DownloadState::Completed => "done",
                            DownloadState::Cancelled => "cancelled",
                            _ => "failed",
                        };
                        bar.finish_with_message(format!("{key} {text}"));
                    }
                }
                _ => {}
            }
        }
    })
}

async fn run_download(engine: &Engine, input: &str, updates_only: bool) -> Result<()> {
    let cancel = CancellationToken::new();
    let results = engine.resolve(input, &cancel).await;
    let selected: Vec<String> = results
        .iter()
        .filter(|result| wants_download(result, updates_only))
        .map(|result| result.requested_name.clone())
        .collect();
    if selected.is_empty() {
        println!("Nothing to download.");
        return Ok(());
    }

    let progress = spawn_progress(engine);
    let queued = engine.download(&selected);
    info!("Queued {queued} downloads");
    println!("Downloading {queued} packages...");

    tokio::select! {
        _ = engine.wait_for_downloads() => {}
        _ = tokio::signal::ctrl_c() => {
            println!("Interrupted, cancelling downloads...");
            engine.clear_queue();
            engine.wait_for_downloads().await;
        }
    }
    progress.abort();

    let rows = engine.results();
    let failed: Vec<&SearchResult> = rows
        .iter()
        .filter(|row| row.download_state == DownloadState::Failed)
        .collect();
    for row in &failed {
        eprintln!(
            "{}: {}",
            row.requested_name,
            row.last_error.as_deref().unwrap_or("download failed")
        );
    }
    if failed.is_empty() {
        Ok(())
    } else {
        Err(anyhow!("{} downloads failed", failed.len()))
    }
}

async fn run_catalog(engine: &Engine, action: CatalogAction) -> Result<()> {
    let cancel = CancellationToken::new();
    match action {
        CatalogAction::Refresh => {
            if !engine.network_allowed() {
                return Err(anyhow!("Network access is disabled"));
            }
            if !engine.refresh_catalog(&cancel).await {
                return Err(anyhow!("Catalog refresh failed"));
            }
            println!("Catalog holds {} packages", engine.catalog().count());
        }
        CatalogAction::Status => {
            // Cache only
            engine.catalog().load("", false, &cancel).await;
            let catalog = engine.catalog();
            println!("Packages:   {}", catalog.count());
            println!("Cache:      {}", catalog.cache_path().display());
            match catalog.loaded_at() {
                Some(at) => println!("Loaded at:  {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
                None => println!("Loaded at:  never"),
            }
        }
        CatalogAction::Seal { plaintext, output } => {
            let plain = fs::read(&plaintext)
                .with_context(|| format!("Failed to read {}", plaintext.display()))?;
            catalog::parse_catalog(&plain).context("Plaintext is not a valid catalog")?;
            let sealed = catalog::seal(&plain, &engine.settings().catalog_passphrase)?;
            fs::write(&output, sealed)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!("Wrote {}", output.display());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    if let Err(e) = varsync::logging::init(Path::new(&settings.log_dir)) {
        eprintln!("Logging to file disabled: {e}");
    }

    let engine = Engine::new(settings, Arc::new(|| true), None)?;

    match cli.command {
        Commands::Resolve { file } => {
            let input = read_input(file.as_deref()).await?;
            let results = engine.resolve(&input, &CancellationToken::new()).await;
            print_results(&results);
        }
        Commands::Download { file, updates_only } => {
            let input = read_input(file.as_deref()).await?;
            run_download(&engine, &input, updates_only).await?;
        }
        Commands::Catalog { action } => run_catalog(&engine, action).await?,
        Commands::List => {
            let index = engine.local().rebuild().await;
            let mut packages: Vec<_> = index.packages().collect();
            packages.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
            for package in &packages {
                println!(
                    "{:<50} {:>10}  {}",
                    package.name,
                    utils::format_bytes(package.size),
                    package.path.display()
                );
            }
            println!("{} packages", packages.len());
        }
        Commands::Clean => {
            let removed = engine.sweep_partials()?;
            for path in &removed {
                println!("Removed {}", path.display());
            }
            println!("{} partial downloads removed", removed.len());
        }
    }

    engine.shutdown();
    Ok(())
}
