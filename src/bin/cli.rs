use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use cushion_adapter::engine::{Fixtures, MemCluster};
use cushion_adapter::sdk::{Adapter, Installer, Keys, ModelRegistry, OptionSet, Staleness, Verb, ViewSearch};
use cushion_adapter::Connector;
use serde_json::Value;

/// Runs adapter operations against a fixture-backed in-memory bucket.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(short, long, env = "CUSHION_DATA_DIR", default_value = "data")]
    data_dir: String,

    #[arg(short, long, env = "CUSHION_BUCKET", default_value = "default")]
    bucket: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone)]
enum Commands {
    Get {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    #[command(visible_alias = "upsert")]
    Save {
        value: String,
        #[arg(required = true)]
        keys: Vec<String>,
    },
    Insert {
        value: String,
        #[arg(required = true)]
        keys: Vec<String>,
    },
    #[command(visible_alias = "replace")]
    Update {
        value: String,
        #[arg(required = true)]
        keys: Vec<String>,
    },
    #[command(visible_aliases = ["remove", "delete"])]
    Del {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Queries a view that emits `field` of every document as its key.
    View {
        ddoc: String,
        view: String,
        #[arg(long)]
        field: String,
        #[arg(long)]
        key: Vec<String>,
        #[arg(long)]
        stale: Option<String>,
    },
}

fn parse_value(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

fn keys_of(mut keys: Vec<String>) -> Keys {
    if keys.len() == 1 {
        Keys::One(keys.remove(0))
    } else {
        Keys::Many(keys)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut options = OptionSet::from_env()?;
    options.bucket = Some(cli.bucket.clone());

    let fixtures = Arc::new(Fixtures::new(&cli.data_dir)?);
    let cluster = MemCluster::with_fixtures(fixtures)?;
    let bucket = cluster.open_bucket(&options)?;

    let (verb, keys, value) = match cli.command {
        Commands::Get { keys } => (Verb::Get, keys, None),
        Commands::Save { value, keys } => (Verb::Save, keys, Some(parse_value(value))),
        Commands::Insert { value, keys } => (Verb::Insert, keys, Some(parse_value(value))),
        Commands::Update { value, keys } => (Verb::Update, keys, Some(parse_value(value))),
        Commands::Del { keys } => (Verb::Delete, keys, None),
        Commands::View { ddoc, view, field, key, stale } => {
            cluster.bucket(&cli.bucket)?.define_field_view(&ddoc, &view, &field)?;

            let mut registry = ModelRegistry::new();
            registry.register_record::<Value>("Document");
            let cushion = Installer::new(options.clone()).install(Adapter::with_bucket(bucket, options), registry)?;
            let methods = cushion.methods().context("query methods are not installed")?;

            let mut search = ViewSearch::new(view).design_doc(ddoc);
            search = match key.len() {
                0 => search,
                1 => search.key(parse_value(key[0].clone())),
                _ => search.keys(key.into_iter().map(parse_value).collect()),
            };
            if let Some(stale) = stale {
                search = search.stale(stale.parse::<Staleness>()?);
            }

            let found = methods.get_many("Document", search, None).await?;
            let docs = found
                .models
                .iter()
                .map(|m| m.to_value())
                .collect::<Result<Vec<_>, _>>()?;
            println!("{}", serde_json::to_string_pretty(&docs)?);
            return Ok(());
        }
    };

    let adapter = Adapter::with_bucket(bucket, options);
    let result = adapter.run(verb, keys_of(keys), value).await;
    // A failed batch may still have written some keys.
    adapter.settle().await;
    if verb != Verb::Get {
        cluster.flush(&cli.bucket)?;
    }
    let out = result?;
    println!("{}", serde_json::to_string_pretty(&out)?);

    Ok(())
}
