mod logging;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use refhub::{
    default_stale_after, parse_url_list, slug, CaptureConfig, CaptureWorker, ItemEdit,
    ItemStatus, ListFilter, NewReference, PartitionKey, ReferenceItem, ReferenceStore,
    RenderEngine, Viewport, WorkerOptions,
};

#[derive(Parser)]
#[command(
    name = "refhub",
    version,
    about = "Queue reference URLs and capture them as full-page screenshots"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// SQLite database path (default: <data root>/data/references.db)
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Root directory for captured images (default: <data root>/output)
    #[arg(long, global = true)]
    output_root: Option<PathBuf>,

    /// Data root for the default paths
    #[arg(long, env = "REFHUB_DATA_DIR", default_value = ".", global = true)]
    data_dir: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Args, Clone)]
struct Partition {
    /// Brand name
    #[arg(long)]
    brand: String,
    /// Season label, e.g. "2026 SS"
    #[arg(long)]
    season: String,
    /// Item name
    #[arg(long)]
    item: String,
}

#[derive(Args)]
struct UrlInput {
    /// URLs to queue
    urls: Vec<String>,
    /// Read URLs from a file, one per line ("-" for stdin)
    #[arg(long)]
    from_file: Option<PathBuf>,
}

#[derive(Args)]
struct CaptureArgs {
    /// Viewport width in pixels
    #[arg(long, default_value_t = 1600)]
    width: u32,
    /// Viewport height in pixels
    #[arg(long, default_value_t = 2200)]
    height: u32,
    /// Per-render timeout in milliseconds
    #[arg(long, default_value_t = 30000)]
    timeout_ms: u64,
    /// JPEG quality (1-100)
    #[arg(long, default_value_t = 85)]
    jpeg_quality: u8,
    /// Retries after a failed render
    #[arg(long, default_value_t = 2)]
    retries: u32,
    /// Maximum items claimed per batch
    #[arg(long, default_value_t = 200)]
    limit: usize,
    /// Partitions captured in parallel (default: CPU count)
    #[arg(long)]
    concurrency: Option<usize>,
    /// Fail PROCESSING items idle this long before claiming (0 disables).
    /// Defaults to the worst-case batch time, at least one hour.
    #[arg(long)]
    stale_after_secs: Option<u64>,
}

impl CaptureArgs {
    fn config(&self) -> CaptureConfig {
        CaptureConfig {
            viewport: Viewport {
                width: self.width,
                height: self.height,
            },
            timeout_ms: self.timeout_ms,
            jpeg_quality: self.jpeg_quality,
            max_retries: self.retries,
        }
    }

    fn options(&self) -> WorkerOptions {
        let defaults = WorkerOptions::default();
        WorkerOptions {
            batch_limit: self.limit,
            concurrency: self.concurrency.unwrap_or(defaults.concurrency).max(1),
            stale_after: match self.stale_after_secs {
                None => Some(default_stale_after(&self.config(), self.limit)),
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
            },
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Queue URLs for one (brand, season, item)
    Enqueue {
        #[command(flatten)]
        partition: Partition,
        #[command(flatten)]
        input: UrlInput,
    },
    /// Capture pending items
    Work {
        #[command(flatten)]
        capture: CaptureArgs,
        /// Keep claiming until the queue is empty, at most this many batches
        #[arg(long, default_value_t = 1)]
        batches: usize,
    },
    /// Queue URLs and capture one batch right away
    Capture {
        #[command(flatten)]
        partition: Partition,
        #[command(flatten)]
        input: UrlInput,
        #[command(flatten)]
        capture: CaptureArgs,
    },
    /// Show failed items, most recent first
    Failed {
        #[arg(long, default_value_t = 1000)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Move failed items back to pending (all of them when no ids are given)
    Retry {
        ids: Vec<String>,
    },
    /// List items, most recently updated first
    List {
        #[arg(long, default_value = "")]
        brand: String,
        #[arg(long, default_value = "")]
        season: String,
        #[arg(long, default_value = "")]
        item: String,
        /// PENDING, PROCESSING, SUCCESS or FAILED
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 5000)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Item counts per status
    Stats,
    /// Write every item to a CSV file
    Export {
        /// Target CSV path
        path: PathBuf,
    },
    /// Copy local images into the output tree and register them as captured
    Import {
        #[command(flatten)]
        partition: Partition,
        /// Image files
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Apply tag and metadata edits from a JSON array of edits
    Edit {
        /// JSON file ("-" for stdin)
        file: PathBuf,
    },
    /// Fail PROCESSING items left behind by an interrupted run
    Sweep {
        #[arg(long, default_value_t = 3600)]
        older_than_secs: u64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let db_path = cli
        .db_path
        .clone()
        .unwrap_or_else(|| cli.data_dir.join("data").join("references.db"));
    let output_root = cli
        .output_root
        .clone()
        .unwrap_or_else(|| cli.data_dir.join("output"));

    let store = Arc::new(
        ReferenceStore::open(&db_path)
            .with_context(|| format!("Failed to open {}", db_path.display()))?,
    );

    match cli.command {
        Commands::Enqueue { partition, input } => {
            let refs = references(&partition, &input)?;
            let report = store.enqueue(&refs)?;
            println!("inserted={} duplicated={}", report.inserted, report.duplicated);
        }
        Commands::Work { capture, batches } => {
            let worker = CaptureWorker::new(
                Arc::clone(&store),
                renderer()?,
                capture.config(),
                output_root,
                capture.options(),
            )?;
            let report = worker.drain(batches.max(1)).await?;
            worker.shutdown();
            println!(
                "claimed={} success={} failed={} recovered_stale={}",
                report.claimed, report.succeeded, report.failed, report.recovered_stale
            );
        }
        Commands::Capture {
            partition,
            input,
            capture,
        } => {
            let refs = references(&partition, &input)?;
            let queued = store.enqueue(&refs)?;
            let worker = CaptureWorker::new(
                Arc::clone(&store),
                renderer()?,
                capture.config(),
                output_root,
                capture.options(),
            )?;
            let report = worker.run_batch().await?;
            worker.shutdown();
            println!(
                "inserted={} duplicated={} success={} failed={}",
                queued.inserted, queued.duplicated, report.succeeded, report.failed
            );
        }
        Commands::Failed { limit, json } => {
            let items = store.select_failed(limit)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else {
                for item in &items {
                    println!(
                        "{} {} error={}",
                        item.id, item.source_url, item.error_message
                    );
                }
                println!("failed={}", items.len());
            }
        }
        Commands::Retry { ids } => {
            let ids = if ids.is_empty() {
                store
                    .select_failed(usize::MAX)?
                    .into_iter()
                    .map(|item| item.id)
                    .collect()
            } else {
                ids
            };
            let reset = store.reset_to_pending(&ids)?;
            println!("reset={}", reset);
        }
        Commands::List {
            brand,
            season,
            item,
            status,
            limit,
            json,
        } => {
            let status = status
                .as_deref()
                .map(str::parse::<ItemStatus>)
                .transpose()?;
            let items = store.list(&ListFilter {
                brand,
                season,
                item,
                status,
                limit,
            })?;
            if json {
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else {
                for item in &items {
                    print_item(item);
                }
                println!("count={}", items.len());
            }
        }
        Commands::Stats => {
            let counts = store.stats()?;
            for status in ItemStatus::ALL {
                println!("{}={}", status.as_str().to_ascii_lowercase(), counts.get(status));
            }
            println!("total={}", counts.total);
        }
        Commands::Export { path } => {
            let written = store.export_csv(&path)?;
            println!("exported={}", written.display());
        }
        Commands::Import { partition, files } => {
            let (imported, skipped) = import_assets(&store, &output_root, &partition, &files)?;
            println!("imported={} skipped={}", imported, skipped);
        }
        Commands::Edit { file } => {
            let raw = read_input(&file)?;
            let edits: Vec<ItemEdit> =
                serde_json::from_str(&raw).context("Edits must be a JSON array of objects")?;
            let updated = store.apply_edits(&edits)?;
            println!("updated={} missing={}", updated, edits.len() - updated);
        }
        Commands::Sweep { older_than_secs } => {
            let recovered = store.recover_stale(Duration::from_secs(older_than_secs))?;
            println!("recovered={}", recovered);
        }
    }
    Ok(())
}

#[cfg(feature = "cdp")]
fn renderer() -> anyhow::Result<Arc<dyn RenderEngine>> {
    Ok(refhub::new_renderer()?)
}

#[cfg(not(feature = "cdp"))]
fn renderer() -> anyhow::Result<Arc<dyn RenderEngine>> {
    bail!("refhub was built without a render engine; rebuild with `--features cdp`")
}

fn read_input(path: &Path) -> anyhow::Result<String> {
    if path.as_os_str() == "-" {
        return std::io::read_to_string(std::io::stdin()).context("Failed to read stdin");
    }
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn references(partition: &Partition, input: &UrlInput) -> anyhow::Result<Vec<NewReference>> {
    let mut raw = input.urls.join("\n");
    if let Some(file) = &input.from_file {
        raw.push('\n');
        raw.push_str(&read_input(file)?);
    }
    let urls = parse_url_list(&raw);
    if urls.is_empty() {
        bail!("No URLs given");
    }
    Ok(urls
        .into_iter()
        .map(|url| {
            NewReference::new(
                partition.brand.clone(),
                partition.season.clone(),
                partition.item.clone(),
                url,
            )
        })
        .collect())
}

fn import_assets(
    store: &ReferenceStore,
    output_root: &Path,
    partition: &Partition,
    files: &[PathBuf],
) -> anyhow::Result<(usize, usize)> {
    let key = PartitionKey {
        brand: partition.brand.clone(),
        season: partition.season.clone(),
        item: partition.item.clone(),
    };
    let raw_dir = slug::partition_dir(output_root, &key).join("raw");
    fs::create_dir_all(&raw_dir)
        .with_context(|| format!("Failed to create {}", raw_dir.display()))?;

    let (mut imported, mut skipped) = (0, 0);
    for file in files {
        let name = file
            .file_name()
            .with_context(|| format!("{} has no file name", file.display()))?
            .to_string_lossy()
            .into_owned();
        let reference = NewReference::new(
            key.brand.clone(),
            key.season.clone(),
            key.item.clone(),
            format!("local://{}", name),
        );
        if store.get_by_partition(&reference)?.is_some() {
            skipped += 1;
            continue;
        }

        let target = raw_dir.join(&name);
        fs::copy(file, &target)
            .with_context(|| format!("Failed to copy {}", file.display()))?;
        match store.register_asset(&reference, &target.to_string_lossy())? {
            Some(_) => imported += 1,
            None => skipped += 1,
        }
    }
    Ok((imported, skipped))
}

fn print_item(item: &ReferenceItem) {
    println!(
        "{} status={} {}/{}/{} url={} image={}",
        item.id,
        item.status,
        item.brand,
        item.season,
        item.item,
        item.source_url,
        item.image_path
    );
}
