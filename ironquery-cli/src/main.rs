use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ironquery_core::aggregation::parse_sort;
use ironquery_core::{
    format, ingest, Collection, EngineConfig, FindOptions, Predicate, Projection, Update, Value,
};
use serde_json::Value as JsonValue;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "ironquery")]
#[command(about = "IronQuery CLI - query and aggregate JSON record files")]
#[command(version)]
struct Cli {
    /// Engine configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print one compact JSON document per line instead of a pretty array
    #[arg(long, global = true)]
    lines: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Find records matching a filter
    Find {
        /// JSON array file to load
        #[arg(long)]
        data: PathBuf,
        /// Filter document (inline JSON or @file)
        #[arg(long, default_value = "{}")]
        filter: String,
        /// Projection document
        #[arg(long)]
        projection: Option<String>,
        /// Sort document, e.g. {"price": -1}
        #[arg(long)]
        sort: Option<String>,
        #[arg(long)]
        skip: Option<usize>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Run an aggregation pipeline
    Aggregate {
        /// JSON array file to load
        #[arg(long)]
        data: PathBuf,
        /// Pipeline array (inline JSON or @file)
        #[arg(long)]
        pipeline: String,
    },
    /// Preview an update of the first record whose key field equals the given id
    ///
    /// The update runs in memory and the updated record is printed; the
    /// --data file is not rewritten.
    #[command(after_help = "Note: changes are not written back to --data.")]
    Update {
        /// JSON array file to load (read only)
        #[arg(long)]
        data: PathBuf,
        /// Identifier field, e.g. product_id
        #[arg(long)]
        key: String,
        /// Identifier value; parsed as JSON, falling back to a plain string
        #[arg(long)]
        id: String,
        /// Update document, e.g. {"$push": {"reviews": {...}}}
        #[arg(long)]
        update: String,
        /// Projection applied to the updated record before printing
        #[arg(long)]
        show: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    let records = match cli.command {
        Commands::Find {
            data,
            filter,
            projection,
            sort,
            skip,
            limit,
        } => {
            let collection = load_collection(&data, config)?;
            let filter = Predicate::from_json(&json_arg(&filter, "filter")?)
                .context("Invalid filter")?;

            let mut options = FindOptions::new();
            if let Some(projection) = projection {
                options = options.with_projection(
                    Projection::from_json(&json_arg(&projection, "projection")?)
                        .context("Invalid projection")?,
                );
            }
            if let Some(sort) = sort {
                options = options.with_sort(parse_sort(&json_arg(&sort, "sort")?).context("Invalid sort")?);
            }
            if let Some(skip) = skip {
                options = options.with_skip(skip);
            }
            if let Some(limit) = limit {
                options = options.with_limit(limit);
            }

            collection
                .find_with_options(&filter, &options)
                .context("Find failed")?
        }
        Commands::Aggregate { data, pipeline } => {
            let collection = load_collection(&data, config)?;
            collection
                .aggregate_json(&json_arg(&pipeline, "pipeline")?)
                .context("Aggregation failed")?
        }
        Commands::Update {
            data,
            key,
            id,
            update,
            show,
        } => {
            let collection = load_collection(&data, config)?;
            let update = Update::from_json(&json_arg(&update, "update")?).context("Invalid update")?;
            let id = serde_json::from_str::<JsonValue>(&id)
                .map(|v| Value::from_json(&v))
                .unwrap_or(Value::String(id));

            let updated = collection
                .apply_update(&key, &id, &update)
                .with_context(|| format!("Update of {} = {} failed", key, id))?;

            match show {
                Some(show) => {
                    let projection = Projection::from_json(&json_arg(&show, "show")?)
                        .context("Invalid --show projection")?;
                    vec![projection.apply(&updated)?]
                }
                None => vec![updated],
            }
        }
    };

    let output = if cli.lines {
        format::lines(&records)?
    } else {
        format::pretty(&records)? + "\n"
    };
    print!("{}", output);
    Ok(())
}

/// Config file (when given) overlaid by the environment
fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let mut config = match path {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => EngineConfig::default(),
    };
    config.apply_env().context("Invalid environment configuration")?;
    config.apply_logging();
    Ok(config)
}

fn load_collection(data: &Path, config: EngineConfig) -> Result<Collection> {
    let records = ingest::load_json_array(data)
        .with_context(|| format!("Failed to load records from {}", data.display()))?;

    let name = data
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("records")
        .to_string();
    let collection = Collection::with_config(&name, config)?;
    let result = collection.insert_many(records);
    eprintln!("Loaded {} records into '{}'", result.inserted_count, name);
    Ok(collection)
}

/// Inline JSON, or `@path` to read it from a file
fn json_arg(arg: &str, what: &str) -> Result<JsonValue> {
    let text = match arg.strip_prefix('@') {
        Some(file) => fs::read_to_string(file)
            .with_context(|| format!("Failed to read {} file: {}", what, file))?,
        None => arg.to_string(),
    };
    serde_json::from_str(&text).with_context(|| format!("Invalid JSON in {}", what))
}
