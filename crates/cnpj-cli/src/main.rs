//! `cnpj-enrichment-queue`: the one first-party transport over the
//! [`cnpj_supervisor::Supervisor`] API.
//!
//! Wires `Config` → `PersistentStore` → `AdaptiveRateLimiter` →
//! `ProviderRouter` → `JobQueue` → `Supervisor`, then dispatches
//! one of `submit`/`status`/`restart`/`cleanup-duplicates`/`serve`.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use cnpj_config::{discover_providers, Config, DiscoveredProvider};
use cnpj_providers::{HttpProviderClient, ProviderClient, StubProviderClient};
use cnpj_queue::{JobQueue, JobQueueConfig};
use cnpj_ratelimiter::{AdaptiveRateLimiter, FeedbackPolicy, ProviderSpec};
use cnpj_router::ProviderRouter;
use cnpj_store::{PersistentStore, SqliteStore};
use cnpj_supervisor::{Supervisor, SubmitAck};

#[derive(Parser)]
#[command(name = "cnpj-enrichment-queue", about = "CNPJ enrichment job queue")]
struct Cli {
    #[command(flatten)]
    config: Config,

    /// Wire every declared provider to an in-memory stub instead of a
    /// real HTTP endpoint, so the queue can be exercised without network
    /// access or a live provider contract.
    #[arg(long, global = true)]
    demo: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Canonicalize and enqueue one or more CNPJs.
    Submit {
        /// 14-digit CNPJs, with or without `.`/`/`/`-` formatting.
        cnpjs: Vec<String>,
    },
    /// Print current job counts and the most recent jobs.
    Status,
    /// Ensure workers are running and force an immediate refill.
    Restart,
    /// Remove company records with no corresponding job record.
    CleanupDuplicates,
    /// Start the supervisor and block, running workers/refill/reaper
    /// until `Ctrl-C`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let supervisor = build_supervisor(&cli.config, cli.demo).await?;

    match cli.command {
        Command::Submit { cnpjs } => {
            let acks = supervisor.submit(&cnpjs).await;
            for (cnpj, ack) in acks {
                println!("{cnpj}: {}", describe_ack(ack));
            }
        }
        Command::Status => {
            let snapshot = supervisor.status_snapshot().await?;
            let counts = snapshot.counts;
            println!(
                "total={} queued={} processing={} completed={} error={} rate_limited={}",
                counts.total(),
                counts.queued,
                counts.processing,
                counts.completed,
                counts.error,
                counts.rate_limited,
            );
            for job in snapshot.recent {
                match job.error_message {
                    Some(message) => {
                        println!("  {} [{}] {message}", job.cnpj, job.status.as_str())
                    }
                    None => println!("  {} [{}]", job.cnpj, job.status.as_str()),
                }
            }
        }
        Command::Restart => {
            let outcome = supervisor.restart_queue().await?;
            println!(
                "restarted={} loaded_count={}",
                outcome.restarted, outcome.loaded_count
            );
        }
        Command::CleanupDuplicates => {
            let outcome = supervisor.cleanup_duplicates().await?;
            println!(
                "removed_jobrecords={} removed_companyrecords={}",
                outcome.removed_job_records, outcome.removed_company_records
            );
        }
        Command::Serve => {
            supervisor.start().await?;
            tracing::info!("queue running, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            tracing::info!("shutting down, in-flight jobs will finish or be healed on restart");
            supervisor.stop().await;
        }
    }

    Ok(())
}

fn describe_ack(ack: SubmitAck) -> &'static str {
    match ack {
        SubmitAck::Queued => "queued",
        SubmitAck::AlreadyPending => "already_pending",
        SubmitAck::AlreadyDone => "already_done",
        SubmitAck::Invalid => "invalid",
    }
}

async fn build_supervisor(config: &Config, demo: bool) -> anyhow::Result<Supervisor> {
    let store: Arc<dyn PersistentStore> = Arc::new(SqliteStore::new(&config.database_url).await?);

    let discovered = discover_providers()?;
    let specs: Vec<ProviderSpec> = discovered.iter().map(|p| p.spec.clone()).collect();
    let total_limit: u32 = specs
        .iter()
        .filter(|s| s.enabled)
        .map(|s| s.limit_per_minute)
        .sum();

    let policy = FeedbackPolicy {
        safety_threshold: config.safety_threshold,
        safety_low: config.safety_factor_low,
        safety_high: config.safety_factor_high,
        cooldown_base: Duration::from_secs(config.cooldown_base_secs),
        cooldown_max: Duration::from_secs(config.cooldown_max_secs),
    };
    let limiter = Arc::new(AdaptiveRateLimiter::with_policy(specs, policy));
    limiter.add_listener(cnpj_core::TracingListener);

    let clients = build_provider_clients(&discovered, demo, config.provider_http_timeout());
    let router = Arc::new(
        ProviderRouter::new(limiter, clients).with_per_request_wait(config.per_request_wait()),
    );

    let queue_config = JobQueueConfig {
        max_concurrent: config.max_concurrent_processing,
        refill_interval: config.refill_interval(),
        reaper_interval: config.reaper_interval(),
        stuck_threshold: config.stuck_threshold(),
        max_retries: config.max_retry_attempts,
        ..JobQueueConfig::default()
    }
    .with_total_provider_limit(total_limit);

    let queue = JobQueue::new(store.clone(), router, queue_config);
    queue.add_listener(cnpj_core::TracingListener);
    let supervisor = Supervisor::new(store, queue);

    if config.auto_restart_queue {
        supervisor.start().await?;
    }

    Ok(supervisor)
}

/// Builds one [`ProviderClient`] per discovered provider. Under `--demo`,
/// every provider is a [`StubProviderClient`] that reports `ok` for
/// anything asked of it, so `submit`/`serve` can be exercised end-to-end
/// without a network. Otherwise, providers with a declared
/// `PROVIDER_<NAME>_URL` get a generic `HttpProviderClient`; providers
/// without one are skipped with a warning, since this crate ships no
/// concrete mapping for any specific provider's JSON shape — the provider
/// contract is an external concern.
fn build_provider_clients(
    discovered: &[DiscoveredProvider],
    demo: bool,
    timeout: Duration,
) -> Vec<Arc<dyn ProviderClient>> {
    if demo {
        return discovered
            .iter()
            .map(|p| {
                let stub = StubProviderClient::new(p.spec.name.clone())
                    .with_default(cnpj_providers::ProviderOutcome::Ok(Default::default()));
                Arc::new(stub) as Arc<dyn ProviderClient>
            })
            .collect();
    }

    discovered
        .iter()
        .filter_map(|p| {
            let Some(url) = p.url.clone() else {
                tracing::warn!(provider = %p.spec.name, "no PROVIDER_{}_URL set, skipping", p.spec.name.to_uppercase());
                return None;
            };
            let mapper = generic_json_mapper();
            let client = HttpProviderClient::new(p.spec.name.clone(), url, mapper)
                .with_timeout(timeout);
            Some(Arc::new(client) as Arc<dyn ProviderClient>)
        })
        .collect()
}

/// A best-effort JSON-to-[`cnpj_core::CompanyRecord`] mapping for
/// providers whose payload already uses this crate's field names. Real
/// providers publish their own shapes; operators wiring a specific
/// provider are expected to supply their own mapper via
/// [`HttpProviderClient::new`] rather than relying on this default.
fn generic_json_mapper() -> cnpj_providers::http::ResponseMapper {
    Arc::new(|value: serde_json::Value| {
        let get_str = |key: &str| value.get(key).and_then(|v| v.as_str()).map(str::to_string);
        Ok(cnpj_core::CompanyRecord {
            cnpj: get_str("cnpj").unwrap_or_default(),
            legal_name: get_str("legal_name"),
            trade_name: get_str("trade_name"),
            street: get_str("street"),
            number: get_str("number"),
            complement: get_str("complement"),
            neighborhood: get_str("neighborhood"),
            city: get_str("city"),
            state: get_str("state"),
            zip_code: get_str("zip_code"),
            phone: get_str("phone"),
            email: get_str("email"),
            registration_status: get_str("registration_status"),
            primary_activity_code: get_str("primary_activity_code"),
            secondary_activity_codes: Vec::new(),
            simples_nacional: value.get("simples_nacional").and_then(|v| v.as_bool()),
            partners: Vec::new(),
            provider_name: String::new(),
        })
    })
}
