use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use browserless_client::BrowserlessClient;
use rootline_common::{Config, FieldName, Provider};
use rootline_store::PgStore;
use rootline_sync::browser::{BrowserlessPageFactory, PagePool};
use rootline_sync::credentials::EnvCredentialStore;
use rootline_sync::{OperationRegistry, ScraperRegistry, StartedOperation, SyncDeps};

#[derive(Parser)]
#[command(name = "rootline", about = "Genealogy provider sync engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Crawl ancestors of a person on one provider.
    Crawl {
        #[arg(long)]
        provider: Provider,
        /// External ID of the starting person.
        #[arg(long)]
        root: String,
        #[arg(long)]
        generations: Option<u32>,
    },
    /// Review pending record hints for one provider.
    Hints {
        #[arg(long)]
        provider: Provider,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Print the field comparison for a person.
    Compare {
        /// Canonical ID, or an external ID on `--provider`.
        #[arg(long)]
        person: String,
        #[arg(long, default_value = "familysearch")]
        provider: Provider,
    },
    /// Accept a provider's value for one field.
    Apply {
        #[arg(long)]
        person: String,
        #[arg(long)]
        field: FieldName,
        #[arg(long)]
        provider: Provider,
        #[arg(long)]
        value: String,
    },
    /// Drop a local override.
    Revert {
        #[arg(long)]
        person: String,
        #[arg(long)]
        field: FieldName,
        #[arg(long, default_value = "familysearch")]
        provider: Provider,
    },
    /// List the trees visible to the signed-in account.
    Trees {
        #[arg(long)]
        provider: Provider,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("rootline=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    config.log_redacted();

    let store = PgStore::connect(&config.database_url).await?;
    store.migrate().await?;

    let deps = SyncDeps::builder()
        .store(Arc::new(store))
        .credentials(Arc::new(EnvCredentialStore))
        .settings(config.sync.clone())
        .build();

    let client = BrowserlessClient::with_timeout(
        &config.browserless_url,
        config.browserless_token.as_deref(),
        Duration::from_millis(config.sync.selector_timeout_ms * 2),
    )?;
    let pool = Arc::new(PagePool::new(
        Arc::new(BrowserlessPageFactory::new(client)),
        config.page_pool_size,
    ));
    let scrapers = ScraperRegistry::new(pool, config.sync.clone());
    let registry = Arc::new(OperationRegistry::new());
    let controller = deps.controller(registry.clone());

    match cli.command {
        Command::Crawl {
            provider,
            root,
            generations,
        } => {
            let scraper = scrapers.build(provider)?;
            let started = controller.start_ancestor_crawl(scraper, &root, generations)?;
            follow(started, &registry).await?;
        }
        Command::Hints { provider, limit } => {
            let scraper = scrapers.build(provider)?;
            let started = controller.start_hint_processing(scraper, limit).await?;
            follow(started, &registry).await?;
        }
        Command::Compare { person, provider } => {
            let id = resolve(&deps, &person, provider).await?;
            let comparison = deps.reconciler().field_comparison(id).await?;
            println!("{}", serde_json::to_string_pretty(&comparison)?);
        }
        Command::Apply {
            person,
            field,
            provider,
            value,
        } => {
            let id = resolve(&deps, &person, provider).await?;
            let outcome = deps
                .reconciler()
                .apply_provider_value(id, field, provider, &value)
                .await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::Revert {
            person,
            field,
            provider,
        } => {
            let id = resolve(&deps, &person, provider).await?;
            let removed = deps.reconciler().revert_override(id, field).await?;
            println!("{}", serde_json::json!({ "reverted": removed }));
        }
        Command::Trees { provider } => {
            let scraper = scrapers.build(provider)?;
            deps.session().ensure_logged_in(scraper.as_ref()).await?;
            for tree in scraper.list_trees().await? {
                println!("{}", serde_json::to_string(&tree)?);
            }
        }
    }

    Ok(())
}

async fn resolve(deps: &SyncDeps, person: &str, provider: Provider) -> Result<uuid::Uuid> {
    deps.identity()
        .resolve_id(person, provider)
        .await?
        .ok_or_else(|| anyhow::anyhow!("no person known as {person}"))
}

/// Print progress events as JSON lines. Ctrl-C requests cooperative
/// cancellation; the stream then runs to its terminal event.
async fn follow(started: StartedOperation, registry: &OperationRegistry) -> Result<()> {
    let StartedOperation {
        operation_id,
        mut events,
    } = started;
    let mut interrupted = false;

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                println!("{}", serde_json::to_string(&event)?);
                if event.reauth_required {
                    warn!("Provider session needs re-authentication");
                }
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                info!(operation_id = %operation_id, "Interrupt received, cancelling");
                registry.request_cancel(operation_id);
            }
        }
    }
    Ok(())
}
