//! crowdclaim CLI: operator and handler interface to the claim engine.

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use crowdclaim::config::Config;
use crowdclaim::db::Db;
use crowdclaim::engine::{Completion, Engine, locate_claim};
use crowdclaim::model::{ClaimId, NewWorkUnit, WorkerIdentity};
use crowdclaim::outcome::Reply;
use crowdclaim::policy::PolicyRegistry;
use crowdclaim::retry::RetryPolicy;
use crowdclaim::telemetry::{TelemetryConfig, init_telemetry};
use secrecy::ExposeSecret;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "crowdclaim", about = "Claim coordination for crowdsourced surveys")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct IdentityArgs {
    /// Platform worker id
    #[arg(long)]
    worker: String,
    /// Platform study id
    #[arg(long)]
    study: String,
    /// Platform session id
    #[arg(long)]
    session: String,
}

impl IdentityArgs {
    fn identity(self) -> anyhow::Result<WorkerIdentity> {
        let identity = WorkerIdentity::new(self.worker, self.study, self.session);
        if !identity.is_complete() {
            anyhow::bail!("worker, study and session ids must be non-empty");
        }
        Ok(identity)
    }
}

#[derive(Subcommand)]
enum Command {
    /// Run pending database migrations
    Migrate,
    /// Bulk-create work units from a JSON lines file
    Load {
        /// Survey name (selects the policy and scope)
        survey: String,
        /// One `{"payload": ..., "conflict_key": ..., "tier": ...}` per line
        file: PathBuf,
    },
    /// Resume or assign a claim for a worker
    Claim {
        survey: String,
        #[command(flatten)]
        identity: IdentityArgs,
        /// Only assign units of this tier
        #[arg(long)]
        tier: Option<String>,
    },
    /// Submit the result for a claim
    Complete {
        /// Claim id handed out by `claim`
        claim_id: String,
        /// Result payload as JSON
        #[arg(long)]
        result: Option<String>,
    },
    /// Record worker feedback
    Feedback {
        survey: String,
        #[command(flatten)]
        identity: IdentityArgs,
        text: String,
    },
    /// Return stale open claims to the pool (run from cron)
    Reclaim { survey: String },
    /// Show unit and claim counters for a survey
    Status { survey: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "crowdclaim".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let db = Arc::new(
        Db::connect(
            config.database_url.expose_secret(),
            config.db_max_connections,
        )
        .await?,
    );

    if let Command::Migrate = cli.command {
        db.migrate().await?;
        println!("migrations applied");
        return Ok(());
    }

    let registry = PolicyRegistry::load_from_dir(&config.policy_dir)?;
    let engine_for = |survey: &str| -> anyhow::Result<Engine<Db>> {
        let policy = registry.require(survey)?.clone();
        Ok(Engine::new(Arc::clone(&db), policy)?)
    };

    match cli.command {
        Command::Migrate => Ok(()),
        Command::Load { survey, file } => cmd_load(&engine_for(&survey)?, &file).await,
        Command::Claim {
            survey,
            identity,
            tier,
        } => {
            let engine = engine_for(&survey)?;
            let identity = identity.identity()?;
            print_reply(&Reply::from(engine.assign(&identity, tier.as_deref()).await))
        }
        Command::Complete { claim_id, result } => {
            cmd_complete(&db, &registry, &claim_id, result.as_deref()).await
        }
        Command::Feedback {
            survey,
            identity,
            text,
        } => {
            let engine = engine_for(&survey)?;
            let identity = identity.identity()?;
            let stored = engine
                .record_feedback(&identity, &text)
                .await
                .map(|stored| serde_json::json!({ "stored": stored }));
            print_reply(&Reply::from(stored))
        }
        Command::Reclaim { survey } => {
            let engine = engine_for(&survey)?;
            let outcome = engine.reclaim().await;
            let failed = outcome.as_ref().err().cloned();
            print_reply(&Reply::from(outcome))?;
            if let Some(failure) = failed {
                anyhow::bail!("reclaim sweep for {survey} failed: {failure}");
            }
            Ok(())
        }
        Command::Status { survey } => {
            let tally = engine_for(&survey)?.tally().await?;
            println!("{}", serde_json::to_string_pretty(&tally.report())?);
            Ok(())
        }
    }
}

fn print_reply<T: Serialize>(reply: &Reply<T>) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(reply)?);
    Ok(())
}

async fn cmd_load(engine: &Engine<Db>, file: &Path) -> anyhow::Result<()> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("cannot read {}", file.display()))?;

    let mut units = Vec::new();
    for (n, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let unit: NewWorkUnit = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: bad work unit", file.display(), n + 1))?;
        units.push(unit);
    }

    let ids = engine.load_units(&units).await?;
    println!("loaded {} units into {}", ids.len(), engine.scope());
    Ok(())
}

/// Claim ids are global; the claim's own scope selects the policy.
async fn cmd_complete(
    db: &Arc<Db>,
    registry: &PolicyRegistry,
    claim_id: &str,
    result: Option<&str>,
) -> anyhow::Result<()> {
    let id: ClaimId = claim_id
        .parse()
        .with_context(|| format!("invalid claim id {claim_id:?}"))?;
    let result: serde_json::Value = match result {
        Some(json) => serde_json::from_str(json).context("result is not valid JSON")?,
        None => serde_json::json!({}),
    };

    let claim = match locate_claim(db.as_ref(), id, &RetryPolicy::for_complete()).await {
        Ok(claim) => claim,
        Err(failure) => return print_reply(&Reply::<Completion>::Error(failure)),
    };

    let policy = registry.require(&claim.scope)?.clone();
    let engine = Engine::new(Arc::clone(db), policy)?;
    print_reply(&Reply::from(engine.complete(id, result).await))
}
