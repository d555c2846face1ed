//! Catalog command-line tool.
//!
//! Lists and shows catalog entries, and opens datasets through the remote
//! accessor to inspect their shape, CRS and (optionally) a clipped window.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use catalog_common::BoundingBox;
use data_catalog::{presets, ConflictPolicy, Registry};
use remote_access::{AccessorConfig, DatasetHandle, RemoteAccessor};

#[derive(Parser, Debug)]
#[command(name = "catalog")]
#[command(about = "Inspect and open datasets from HydroMT-style data catalogs")]
struct Args {
    /// Catalog YAML files, loaded in order (later files override earlier ones)
    #[arg(short, long = "catalog", global = true, env = "CATALOG_FILES", value_delimiter = ',')]
    catalogs: Vec<PathBuf>,

    /// Load the shipped NOS and Lynker-Spatial catalogs before --catalog files
    #[arg(long, global = true)]
    predefined: bool,

    /// What to do when a name is defined twice: override, warn or strict
    #[arg(long, global = true, default_value = "override")]
    conflict_policy: ConflictPolicy,

    /// Fail instead of warning when an asset's CRS disagrees with its entry
    #[arg(long, global = true)]
    strict_crs: bool,

    /// Log level
    #[arg(long, global = true, default_value = "warn", env = "RUST_LOG")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List dataset names in load order
    List,

    /// Print the resolved entry as YAML
    Show {
        name: String,
    },

    /// Open a dataset lazily and describe it
    Open {
        name: String,

        /// Clip box in the dataset CRS: minx,miny,maxx,maxy
        #[arg(long)]
        bbox: Option<String>,

        /// Extra cells kept around --bbox
        #[arg(long, default_value_t = 0)]
        buffer: usize,

        /// Restrict to these variables or columns
        #[arg(long, value_delimiter = ',')]
        select: Vec<String>,
    },
}

fn init_tracing(args: &Args) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    if args.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_registry(args: &Args) -> Result<Registry> {
    let mut sources = Vec::new();
    if args.predefined {
        sources.extend(presets::predefined_catalogs(presets::default_catalog_dir()));
    }
    sources.extend(args.catalogs.iter().cloned());
    if sources.is_empty() {
        anyhow::bail!("no catalogs given; pass --catalog <yaml> or --predefined");
    }

    let registry = Registry::builder()
        .conflict_policy(args.conflict_policy)
        .add_sources(sources)
        .build()
        .context("loading catalogs")?;

    info!(entries = registry.len(), "Loaded catalogs");
    Ok(registry)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_tracing(&args);

    let registry = load_registry(&args)?;

    match &args.command {
        Command::List => {
            for entry in registry.iter() {
                println!("{}\t{}\t{}", entry.name, entry.driver, entry.path);
            }
        }
        Command::Show { name } => {
            let entry = registry.get(name)?;
            print!("{}", serde_yaml::to_string(entry)?);
        }
        Command::Open {
            name,
            bbox,
            buffer,
            select,
        } => {
            let config = AccessorConfig::from_env().with_strict_crs(args.strict_crs);
            let accessor = RemoteAccessor::new(config)?;
            let entry = registry.get(name)?;
            let bbox = bbox
                .as_deref()
                .map(BoundingBox::parse)
                .transpose()
                .context("parsing --bbox")?;

            let handle = accessor.open(entry, None).await?;
            describe(handle, bbox, *buffer, select).await?;

            let stats = accessor.stats().snapshot();
            debug!(requests = stats.requests, bytes = stats.bytes_fetched, "Remote access totals");
            eprintln!(
                "{} requests, {} bytes fetched, {} retries",
                stats.requests, stats.bytes_fetched, stats.retries
            );
        }
    }

    Ok(())
}

async fn describe(
    handle: DatasetHandle,
    bbox: Option<BoundingBox>,
    buffer: usize,
    select: &[String],
) -> Result<()> {
    match handle {
        DatasetHandle::Raster(mut dataset) => {
            if !select.is_empty() {
                dataset = dataset.select_variables(select)?;
            }
            if let Some(bbox) = &bbox {
                dataset = dataset.clip_bbox(bbox, buffer)?;
            }

            let (rows, cols) = dataset.shape();
            println!("name:      {}", dataset.name());
            println!("location:  {}", dataset.location());
            println!("shape:     {} rows x {} cols", rows, cols);
            println!("window:    {}", dataset.window());
            println!(
                "crs:       {}",
                dataset.crs().map(|c| c.to_string()).unwrap_or_else(|| "unknown".into())
            );
            if let Some(bounds) = dataset.bounds() {
                println!("bounds:    {}", bounds);
            }
            println!("chunks:    {:?}", dataset.chunks());
            println!("variables: {}", dataset.variable_names().join(", "));

            if bbox.is_some() {
                for name in dataset.variable_names() {
                    let array = dataset.read_variable(name).await?;
                    match array.stats() {
                        Some(s) => println!(
                            "  {}: valid={} min={} max={} mean={:.4}",
                            name, s.valid, s.min, s.max, s.mean
                        ),
                        None => println!("  {}: no valid cells", name),
                    }
                }
            }
        }
        DatasetHandle::Tabular(mut dataset) => {
            if !select.is_empty() {
                dataset = dataset.select_columns(select)?;
            }
            println!("name:       {}", dataset.name());
            println!("location:   {}", dataset.location());
            println!("rows:       {}", dataset.num_rows());
            println!("row groups: {}", dataset.num_row_groups());
            println!("columns:    {}", dataset.column_names().join(", "));
        }
        DatasetHandle::Vector(dataset) => {
            println!("name:     {}", dataset.name());
            println!("location: {}", dataset.location());
            println!("size:     {} bytes", dataset.size());
            if let Some(bbox) = &bbox {
                let features = dataset.collect(Some(bbox)).await?;
                println!("features: {} in bbox", features.len());
                println!("{}", serde_json::to_string_pretty(&features)?);
            }
        }
    }
    Ok(())
}
