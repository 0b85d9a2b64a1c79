use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use xencp_engine::config::{ENV_HOST, ENV_PASSWORD, ENV_USERNAME};
use xencp_engine::{CancelToken, Engine, EngineConfig, EntityId, EntityKind};

mod manifest;
mod output;
mod state;

use state::StateFile;

#[derive(Parser)]
#[command(name = "xencp")]
#[command(about = "Plan and apply declared XenServer pool state")]
struct Cli {
    /// Pool coordinator address
    #[arg(long, env = ENV_HOST)]
    host: String,

    #[arg(short, long, env = ENV_USERNAME, default_value = "root")]
    username: String,

    #[arg(short, long, env = ENV_PASSWORD, hide_env_values = true, default_value = "")]
    password: String,

    /// Accept self-signed host certificates
    #[arg(long)]
    insecure: bool,

    /// State file recording managed entities between runs
    #[arg(long, default_value = "xencp.state.json")]
    state: PathBuf,

    /// Upper bound for a single remote task, in seconds
    #[arg(long, default_value_t = 600)]
    task_timeout: u64,

    /// Upper bound for waiting on the pool lock, in seconds
    #[arg(long, default_value_t = 300)]
    lock_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the changes needed to reach the manifest
    Plan {
        /// Desired-state manifest (JSON)
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Apply the manifest to the pool
    Apply {
        /// Desired-state manifest (JSON)
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Show recorded entities, or the live attributes of one
    Show {
        #[arg(value_parser = parse_kind)]
        kind: Option<EntityKind>,
        key: Option<String>,
    },
    /// Bring an existing object under management
    Import {
        #[arg(value_parser = parse_kind)]
        kind: EntityKind,
        /// UUID of the live object
        uuid: String,
        /// Key to manage it under
        key: String,
    },
    /// Delete a managed entity
    Remove {
        #[arg(value_parser = parse_kind)]
        kind: EntityKind,
        key: String,
        /// Only forget the entity locally, leave it in the pool
        #[arg(long)]
        keep: bool,
    },
    /// List every object of a kind in the pool
    List {
        #[arg(value_parser = parse_kind)]
        kind: EntityKind,
    },
}

fn parse_kind(s: &str) -> std::result::Result<EntityKind, String> {
    s.parse().map_err(|e: xencp_engine::Error| e.to_string())
}

/// VMs and snapshots share a class; templates and dom0 are never listed as VMs.
fn is_of_kind(kind: EntityKind, fields: &BTreeMap<String, Value>) -> bool {
    let flag = |name: &str| fields.get(name).and_then(Value::as_bool).unwrap_or(false);
    match kind {
        EntityKind::Vm => !flag("is_a_template") && !flag("is_a_snapshot") && !flag("is_control_domain"),
        EntityKind::Snapshot => flag("is_a_snapshot"),
        _ => true,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "xencp=info,xencp_engine=info,reqwest=warn,hyper=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = EngineConfig {
        host: cli.host.clone(),
        username: cli.username.clone(),
        password: cli.password.clone(),
        insecure_tls: cli.insecure,
        task_timeout_secs: cli.task_timeout,
        lock_timeout_secs: cli.lock_timeout,
        ..Default::default()
    };
    let engine = Engine::connect(config).context("Failed to set up the engine")?;

    let cancel = CancelToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current step");
            on_signal.cancel();
        }
    });

    let result = run(&engine, &cli.state, cli.command, &cancel).await;

    if let Err(e) = engine.shutdown().await {
        warn!("Logout failed: {}", e);
    }
    result
}

async fn run(engine: &Engine, state_path: &Path, command: Commands, cancel: &CancelToken) -> Result<()> {
    let mut state = StateFile::load(state_path).await?;

    match command {
        Commands::Plan { file } => {
            let desired = manifest::load(&file).await?;
            let plan = engine.plan(&desired, state.records()).await?;
            output::print_plan(&plan);
        }

        Commands::Apply { file } => {
            let desired = manifest::load(&file).await?;
            let plan = engine.plan(&desired, state.records()).await?;
            output::print_plan(&plan);
            if plan.is_empty() {
                return Ok(());
            }

            let report = engine.apply(plan, cancel).await;
            output::print_report(&report);

            // Record what is really there, whether or not every step went through.
            let observed = engine
                .observe_all(&desired, state.records())
                .await
                .context("Failed to refresh state after apply")?;
            state.replace(&observed);
            state.save().await?;
            info!(path = %state.path().display(), records = state.records().len(), "State saved");

            if let Some((op, _)) = &report.failed {
                bail!("Apply stopped at {}; run apply again to resume", op);
            }
        }

        Commands::Show { kind, key } => match (kind, key) {
            (Some(kind), Some(key)) => {
                let prior = state.get(&EntityId::new(kind, key.clone()));
                match engine.observe(kind, &key, prior).await? {
                    Some(actual) => output::print_actual(&actual),
                    None => bail!("{}/{} not found in the pool", kind, key),
                }
            }
            (kind, _) => {
                let records: Vec<_> = state
                    .records()
                    .iter()
                    .filter(|r| kind.is_none_or(|k| r.kind == k))
                    .collect();
                output::print_records(&records);
            }
        },

        Commands::Import { kind, uuid, key } => {
            let actual = engine.import(kind, &uuid, &key).await?;
            state.upsert(&actual);
            state.save().await?;
            println!("Imported {} as {}", uuid, actual.id);
        }

        Commands::Remove { kind, key, keep } => {
            let id = EntityId::new(kind, key.clone());
            if keep {
                if !state.remove(&id) {
                    bail!("{} is not recorded in {}", id, state.path().display());
                }
                state.save().await?;
                println!("Forgot {}", id);
                return Ok(());
            }

            let prior = state.get(&id).cloned();
            let outcome = engine.reconcile(kind, &key, None, prior.as_ref(), cancel).await?;
            output::print_diagnostics(&outcome.diagnostics);
            match &outcome.new_actual {
                Some(actual) => state.upsert(actual),
                None => {
                    state.remove(&id);
                }
            }
            state.save().await?;
            if outcome.has_errors() {
                bail!("Failed to remove {}", id);
            }
            println!("Removed {}", id);
        }

        Commands::List { kind } => {
            let entities = engine.list_entities(kind).await?;
            let managed: Vec<String> = engine
                .list_managed(kind)
                .await?
                .into_iter()
                .map(|a| a.uuid)
                .collect();
            let fields: Vec<_> = entities
                .into_iter()
                .map(|(_, fields)| fields)
                .filter(|fields| is_of_kind(kind, fields))
                .collect();
            output::print_entities(&fields, &managed);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> BTreeMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_vm_listing_skips_templates_and_snapshots() {
        let vm = fields(json!({"uuid": "a", "is_a_template": false, "is_a_snapshot": false}));
        let template = fields(json!({"uuid": "b", "is_a_template": true}));
        let snapshot = fields(json!({"uuid": "c", "is_a_snapshot": true}));
        assert!(is_of_kind(EntityKind::Vm, &vm));
        assert!(!is_of_kind(EntityKind::Vm, &template));
        assert!(!is_of_kind(EntityKind::Vm, &snapshot));
        assert!(is_of_kind(EntityKind::Snapshot, &snapshot));
    }

    #[test]
    fn test_cli_parses_kinds() {
        let cli = Cli::try_parse_from(["xencp", "--host", "xen1", "remove", "sr", "store", "--keep"]).unwrap();
        match cli.command {
            Commands::Remove { kind, key, keep } => {
                assert_eq!(kind, EntityKind::StorageRepository);
                assert_eq!(key, "store");
                assert!(keep);
            }
            _ => panic!("expected remove"),
        }
        assert!(Cli::try_parse_from(["xencp", "--host", "xen1", "list", "router"]).is_err());
    }
}
