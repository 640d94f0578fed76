// src/main.rs
//
// Command-line edge connector.
// Browses the federated catalog and pulls kits into the local workspace.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use edge_connector::catalog::CatalogService;
use edge_connector::config::{default_config_template, Config};
use edge_connector::connectors::MemoryDataspace;
use edge_connector::engine::{KitDownloader, TransferEngine};
use edge_connector::traits::SharedDataspaceApi;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "edge-connector")]
#[command(about = "Dataspace edge connector: catalog search, offer resolution and kit transfer")]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(long, short)]
    config: Option<String>,

    /// Work on a saved federated catalog (JSON) instead of the live dataspace
    #[arg(long)]
    catalog_file: Option<String>,

    /// Generate a default configuration file
    #[arg(long)]
    generate_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print the current federated catalog
    Catalog,
    /// Filter the catalog, e.g. `kit_type == basic & bpn == P1`
    Search {
        query: String,
        /// Fail on an ill-formed query instead of printing an empty catalog
        #[arg(long)]
        strict: bool,
    },
    /// Print one offer
    Resolve { provider_id: String, kit_name: String },
    /// Download a kit into the workspace
    Download {
        provider_id: String,
        kit_name: String,
        /// JSON body; the pull becomes a POST when given
        #[arg(long)]
        body: Option<String>,
        /// Replace an existing workspace entry
        #[arg(long)]
        overwrite: bool,
    },
    /// Pull a kit's content and print it instead of storing it
    Read {
        provider_id: String,
        kit_name: String,
        #[arg(long)]
        body: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle config generation
    if args.generate_config {
        println!("{}", default_config_template());
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => Config::from_file(path).map_err(anyhow::Error::msg)?,
        None => Config::default(),
    };
    config.apply_env_overrides();

    let default_level = config.global.log_level.as_deref().unwrap_or("info");
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    let Some(command) = args.command else {
        eprintln!("No command given. Use --help to list commands.");
        eprintln!("Use --generate-config to create a config template.");
        std::process::exit(1);
    };

    let api: SharedDataspaceApi = match &args.catalog_file {
        Some(path) => MemoryDataspace::from_catalog_file(path)
            .map_err(anyhow::Error::msg)?
            .shared(),
        None => config
            .build_connector()
            .context("Failed to set up dataspace connector")?
            .shared(),
    };
    let catalog = CatalogService::new(api.clone());

    match command {
        Command::Catalog => print_json(&catalog.snapshot().await?)?,
        Command::Search { query, strict } => {
            let result = if strict {
                catalog.search_strict(&query).await?
            } else {
                catalog.search(&query).await?
            };
            print_json(&result)?;
        }
        Command::Resolve { provider_id, kit_name } => {
            match catalog.resolve(&provider_id, &kit_name).await? {
                Some(resolved) => print_json(&resolved.offer)?,
                None => bail!("KIT cannot be found"),
            }
        }
        Command::Download {
            provider_id,
            kit_name,
            body,
            overwrite,
        } => {
            let kits = downloader(&config, api, catalog);
            let outcome = kits
                .download(&provider_id, &kit_name, parse_body(body)?, overwrite)
                .await;
            print_json(&outcome)?;
            if !outcome.success {
                std::process::exit(1);
            }
        }
        Command::Read {
            provider_id,
            kit_name,
            body,
        } => {
            let kits = downloader(&config, api, catalog);
            let content = kits.read(&provider_id, &kit_name, parse_body(body)?).await?;
            print_json(&content)?;
        }
    }

    Ok(())
}

fn downloader(config: &Config, api: SharedDataspaceApi, catalog: CatalogService) -> KitDownloader {
    let engine = TransferEngine::new(api, config.workspace()).with_settle_policy(config.settle_policy());
    KitDownloader::new(catalog, Arc::new(engine))
}

fn parse_body(body: Option<String>) -> Result<Option<Value>> {
    body.map(|raw| serde_json::from_str(&raw).context("--body is not valid JSON"))
        .transpose()
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
