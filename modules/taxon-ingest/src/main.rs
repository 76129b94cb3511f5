use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use taxon_common::{Config, FileConfig, RelatedIds};
use taxon_ingest::{
    BatchOrchestrator, CompiledSchema, IngestHints, IngestRequest, ObjectStore, OpenAiOracle,
    PgObjectStore,
};

#[derive(Parser)]
#[command(name = "taxon", about = "Schema-driven ingestion into organisation object graphs")]
#[command(version)]
struct Cli {
    /// Path to config TOML file (overrides TAXON_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply database migrations
    Migrate,

    /// Ingest a JSON payload and print the batch response
    Ingest {
        /// Inbound connection the payload arrived on
        #[arg(long)]
        connection: String,

        /// Organisation id; resolved from the connection when omitted
        #[arg(long)]
        organisation: Option<String>,

        /// Run the pipeline without writing anything
        #[arg(long)]
        dry_run: bool,

        /// Skip classification and use this object type
        #[arg(long)]
        object_type: Option<String>,

        /// Explicit parent record
        #[arg(long)]
        parent: Option<Uuid>,

        /// What the payload is, passed to extraction
        #[arg(long)]
        description: Option<String>,

        /// Merge into an existing record at or above this similarity
        #[arg(long)]
        threshold: Option<f64>,

        /// Related record as <type>=<uuid> (repeatable)
        #[arg(long = "related", value_parser = parse_related)]
        related: Vec<(String, Uuid)>,

        /// Payload file (JSON object or array)
        payload: PathBuf,
    },

    /// Print compiled type descriptions and extraction schemas
    Schema {
        #[arg(long)]
        organisation: String,

        /// Only show this object type
        #[arg(long)]
        object_type: Option<String>,
    },
}

fn parse_related(raw: &str) -> Result<(String, Uuid), String> {
    let (object_type, id) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected <type>=<uuid>, got '{raw}'"))?;
    let id = Uuid::parse_str(id.trim()).map_err(|e| format!("invalid uuid '{id}': {e}"))?;
    Ok((object_type.trim().to_string(), id))
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("taxon=info".parse()?);
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    let cli = Cli::parse();
    let config = Config::from_env();
    config.log_redacted();

    let config_path = cli.config.unwrap_or_else(|| config.config_path.clone());
    let file_config = FileConfig::load_or_default(&config_path)?;

    let store = PgObjectStore::connect(config.require_database_url()?).await?;

    match cli.command {
        Commands::Migrate => store.migrate().await,

        Commands::Schema {
            organisation,
            object_type,
        } => {
            let catalog = store
                .load_catalog(&organisation)
                .await?
                .scoped_to(&organisation);
            let schema = CompiledSchema::compile(&catalog);

            let types: Vec<_> = schema
                .descriptions()
                .filter(|d| object_type.as_deref().map_or(true, |t| t == d.id))
                .map(|d| {
                    serde_json::json!({
                        "description": d,
                        "category": d.category.as_str(),
                        "schema": schema.extraction_schema(&d.id).map(|s| s.to_json_schema()),
                    })
                })
                .collect();

            if types.is_empty() {
                bail!("no object types found for organisation '{organisation}'");
            }
            println!("{}", serde_json::to_string_pretty(&types)?);
            Ok(())
        }

        Commands::Ingest {
            connection,
            organisation,
            dry_run,
            object_type,
            parent,
            description,
            threshold,
            related,
            payload,
        } => {
            let content = std::fs::read_to_string(&payload)
                .with_context(|| format!("Failed to read payload: {}", payload.display()))?;
            let payload: serde_json::Value =
                serde_json::from_str(&content).context("Payload is not valid JSON")?;

            let mut new_related_ids = RelatedIds::new();
            for (object_type, id) in related {
                new_related_ids.entry(object_type).or_default().insert(id);
            }

            let hints = IngestHints {
                object_type_id: object_type,
                parent_object_id: parent,
                data_description: description,
                required_match_threshold: threshold,
                new_related_ids,
            };

            let mut oracle = OpenAiOracle::new(
                config.require_openai_api_key()?,
                file_config.models.clone(),
                &file_config.ingest,
            )?;
            if let Some(url) = &config.openai_base_url {
                oracle = oracle.with_base_url(url);
            }
            let oracle = Arc::new(oracle);
            let store = Arc::new(store.with_embedder(oracle.clone()));

            let orchestrator = BatchOrchestrator::new(oracle, store, file_config.ingest.clone());

            let request = IngestRequest {
                connection_id: connection,
                organisation_id: organisation,
                dry_run,
                payload,
                hints,
            };

            let response = orchestrator.ingest(request).await;
            println!("{}", serde_json::to_string_pretty(&response)?);

            if !response.is_success() {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn related_argument_parses_type_and_id() {
        let id = Uuid::new_v4();
        assert_eq!(
            parse_related(&format!("product={id}")).unwrap(),
            ("product".to_string(), id)
        );
    }

    #[test]
    fn related_argument_rejects_bad_input() {
        assert!(parse_related("product").is_err());
        assert!(parse_related("product=not-a-uuid").is_err());
    }

    #[test]
    fn cli_accepts_ingest_flags() {
        let cli = Cli::try_parse_from([
            "taxon",
            "ingest",
            "--connection",
            "conn-1",
            "--dry-run",
            "--threshold",
            "0.9",
            "--related",
            &format!("product={}", Uuid::new_v4()),
            "payload.json",
        ])
        .unwrap();

        match cli.command {
            Commands::Ingest {
                dry_run,
                threshold,
                related,
                ..
            } => {
                assert!(dry_run);
                assert_eq!(threshold, Some(0.9));
                assert_eq!(related.len(), 1);
            }
            _ => panic!("expected ingest"),
        }
    }
}
