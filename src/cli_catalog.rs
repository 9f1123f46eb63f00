//! Catalog admin tool
//!
//! One-shot commands against a catalog database: filtered listings, create/update
//! from JSON files, deletes and outbox inspection. Mutations go through the
//! catalog service, so a running catalog-server publishes their events.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};
use param_catalog_server::catalog_service::CatalogService;
use param_catalog_server::catalog_store::{
    CatalogFilter, DatasourcePatch, DateRange, NewDatasource, NewTemplate, PageRequest,
    SqliteCatalogStore, TemplatePatch, DEFAULT_PAGE_SIZE,
};
use param_catalog_server::change_events::{unix_millis_now, OutboxStore, RequeueOutcome};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "cli-catalog")]
#[command(about = "Administer a param catalog database")]
struct CliArgs {
    /// Path to the SQLite catalog database file
    #[arg(long, value_name = "DB_PATH")]
    db_path: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum EntityKind {
    Datasource,
    Template,
}

#[derive(Args, Debug, Default)]
struct FilterArgs {
    /// Case-insensitive substring of the name
    #[arg(long)]
    nombre: Option<String>,

    /// Case-insensitive substring of the author
    #[arg(long)]
    autor: Option<String>,

    #[arg(long)]
    activo: Option<bool>,

    /// Inclusive creation date bounds (YYYY-MM-DD), both required
    #[arg(long, requires = "created_to")]
    created_from: Option<NaiveDate>,
    #[arg(long, requires = "created_from")]
    created_to: Option<NaiveDate>,

    /// Inclusive modification date bounds (YYYY-MM-DD), both required
    #[arg(long, requires = "modified_to")]
    modified_from: Option<NaiveDate>,
    #[arg(long, requires = "modified_from")]
    modified_to: Option<NaiveDate>,

    /// Zero-based page number
    #[arg(long, default_value_t = 0)]
    page: u32,

    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    size: u32,
}

impl FilterArgs {
    fn filter(&self) -> Result<CatalogFilter> {
        let mut filter = CatalogFilter::default();
        if let Some(nombre) = &self.nombre {
            filter = filter.with_nombre(nombre.clone());
        }
        if let Some(autor) = &self.autor {
            filter = filter.with_autor(autor.clone());
        }
        if let Some(activo) = self.activo {
            filter = filter.with_activo(activo);
        }
        if let (Some(from), Some(to)) = (self.created_from, self.created_to) {
            filter = filter.with_fecha_creacion(DateRange::new(from, to)?);
        }
        if let (Some(from), Some(to)) = (self.modified_from, self.modified_to) {
            filter = filter.with_fecha_modificacion(DateRange::new(from, to)?);
        }
        Ok(filter)
    }

    fn page_request(&self) -> Result<PageRequest> {
        Ok(PageRequest::new(self.page, self.size)?)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Lists entities matching the given filters.
    List {
        kind: EntityKind,
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Lists entities whose name is exactly NOMBRE.
    Find { kind: EntityKind, nombre: String },

    /// Shows one entity with its fields.
    Show { kind: EntityKind, id: Uuid },

    /// Creates an entity from a JSON payload file.
    Create { kind: EntityKind, file: PathBuf },

    /// Applies a partial JSON payload file to an entity.
    Update {
        kind: EntityKind,
        id: Uuid,
        file: PathBuf,
    },

    /// Deletes an entity and all of its fields.
    Delete { kind: EntityKind, id: Uuid },

    /// Shows the number of outbox events per status.
    OutboxStatus,

    /// Lists dead-lettered events.
    DeadLetters {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Moves a dead-lettered event back to pending.
    Requeue { seq: i64 },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_payload<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read payload file: {:?}", path))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse payload file: {:?}", path))
}

fn run(command: Command, store: Arc<SqliteCatalogStore>) -> Result<()> {
    let service = CatalogService::new(store.clone(), Arc::new(Notify::new()));

    match command {
        Command::List { kind, filter } => {
            let predicate_filter = filter.filter()?;
            let page = filter.page_request()?;
            match kind {
                EntityKind::Datasource => {
                    print_json(&service.list_datasources(&predicate_filter, page)?)?
                }
                EntityKind::Template => {
                    print_json(&service.list_templates(&predicate_filter, page)?)?
                }
            }
        }
        Command::Find { kind, nombre } => match kind {
            EntityKind::Datasource => print_json(&service.find_datasources_by_nombre(&nombre)?)?,
            EntityKind::Template => print_json(&service.find_templates_by_nombre(&nombre)?)?,
        },
        Command::Show { kind, id } => {
            let found = match kind {
                EntityKind::Datasource => service
                    .get_datasource(id)?
                    .map(serde_json::to_value)
                    .transpose()?,
                EntityKind::Template => service
                    .get_template(id)?
                    .map(serde_json::to_value)
                    .transpose()?,
            };
            match found {
                Some(value) => print_json(&value)?,
                None => bail!("{:?} {} not found", kind, id),
            }
        }
        Command::Create { kind, file } => match kind {
            EntityKind::Datasource => {
                let new: NewDatasource = read_payload(&file)?;
                print_json(&service.create_datasource(new)?)?
            }
            EntityKind::Template => {
                let new: NewTemplate = read_payload(&file)?;
                print_json(&service.create_template(new)?)?
            }
        },
        Command::Update { kind, id, file } => match kind {
            EntityKind::Datasource => {
                let patch: DatasourcePatch = read_payload(&file)?;
                print_json(&service.update_datasource(id, patch)?)?
            }
            EntityKind::Template => {
                let patch: TemplatePatch = read_payload(&file)?;
                print_json(&service.update_template(id, patch)?)?
            }
        },
        Command::Delete { kind, id } => {
            match kind {
                EntityKind::Datasource => service.delete_datasource(id)?,
                EntityKind::Template => service.delete_template(id)?,
            }
            info!("Deleted {:?} {}", kind, id);
        }
        Command::OutboxStatus => print_json(&store.status_counts()?)?,
        Command::DeadLetters { limit } => print_json(&store.list_dead_letters(limit)?)?,
        Command::Requeue { seq } => match store.requeue_dead_letter(seq, unix_millis_now())? {
            RequeueOutcome::Requeued => info!("Requeued outbox event {}", seq),
            RequeueOutcome::NotDeadLetter => bail!("Outbox event {} is not dead-lettered", seq),
            RequeueOutcome::Superseded { published_seq } => bail!(
                "Outbox event {} is superseded by published event {} of the same entity",
                seq,
                published_seq
            ),
        },
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = CliArgs::parse();
    if !args.db_path.exists() {
        bail!("Catalog database does not exist: {:?}", args.db_path);
    }

    let store = Arc::new(SqliteCatalogStore::new(&args.db_path, 1)?);
    run(args.command, store)
}
