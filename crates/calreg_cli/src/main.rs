//! calreg: operator CLI for the calibration reference registry.
//!
//! Each invocation is one request: state (records, counters, batches, locks)
//! persists in a JSON file between calls.
//!
//! # Usage
//!
//! ```bash
//! # Register an existing hierarchy
//! calreg --user ops seed /archive/*.pmap /archive/*.imap /archive/*.rmap /archive/*.fits --set-contexts
//!
//! # Stage, then confirm under the instrument lock
//! calreg --user alice stage dark.fits --instrument miri --file-type dark
//! calreg --user alice confirm 6f1c...
//!
//! # Keep the instrument lock across several confirms
//! calreg --user alice lock acquire instrument:miri
//! calreg --user alice lock refresh
//! calreg --user alice lock release instrument:miri
//! ```

mod json_store;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use calreg_core::seed::SeedRequest;
use calreg_core::{
    Candidate, ContextKind, ContextSelector, FileState, HeldLock, LockKey, RegistryConfig,
    RegistryError, RegistryService, StageRequest,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use uuid::Uuid;

use crate::json_store::JsonFileStore;

#[derive(Parser)]
#[command(name = "calreg")]
#[command(version)]
#[command(about = "Calibration reference registry: stage, confirm and deliver reference and rule files")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Registry configuration file (YAML)
    #[arg(long, short, global = true, env = "CALREG_CONFIG", default_value = "calreg.yaml")]
    config: PathBuf,

    /// Registry state file; defaults to registry.json under the storage root
    #[arg(long, global = true, env = "CALREG_STATE")]
    state: Option<PathBuf>,

    /// Acting user: submitter and lock holder
    #[arg(long, short, global = true, env = "CALREG_USER", default_value = "operator")]
    user: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Register files that already make up a rule hierarchy
    Seed {
        files: Vec<PathBuf>,

        /// State to register them in: delivered, archived or operational
        #[arg(long, default_value = "operational")]
        state: String,

        /// Point the edit and operational contexts at the newest top-level file
        #[arg(long)]
        set_contexts: bool,
    },

    /// Certify and stage files as a new batch
    Stage {
        files: Vec<PathBuf>,

        /// Instrument of the reference files (and the lock guarding confirm)
        #[arg(short, long)]
        instrument: Option<String>,

        /// File type of the reference files
        #[arg(short, long)]
        file_type: Option<String>,

        #[arg(short, long, default_value = "")]
        description: String,

        /// Keep upload names instead of minting serial names
        #[arg(long)]
        keep_names: bool,

        /// Derive from this top-level file instead of the edit context
        #[arg(long)]
        base: Option<String>,
    },

    /// Derive, deliver and finalise a staged batch
    Confirm { batch_id: Uuid },

    /// Destroy everything a staged batch created
    Cancel { batch_id: Uuid },

    /// Instrument and project locks
    Lock {
        #[command(subcommand)]
        action: LockAction,
    },

    /// Show a file's record, advancing it if its delivery was consumed
    Status {
        name: Option<String>,

        /// Refresh every delivered file of the project
        #[arg(long)]
        sweep: bool,
    },

    /// Blacklist a file and everything that selects it
    Blacklist {
        name: String,

        /// Lift the blacklisting rooted at this file
        #[arg(long)]
        lift: bool,
    },

    /// Mark a single file rejected
    Reject {
        name: String,

        #[arg(long)]
        clear: bool,
    },

    /// Purge expired locks, cancel abandoned batches and roll back interrupted confirms
    Cleanup,

    /// Show or set the edit and operational contexts
    Context {
        /// edit or operational
        kind: Option<String>,

        /// Top-level file to point the context at
        name: Option<String>,
    },
}

#[derive(Subcommand)]
enum LockAction {
    /// Acquire a lock, e.g. `instrument:miri`
    Acquire {
        key: String,

        /// Seconds to wait for a busy lock
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    Release {
        /// Lock key; all of the user's locks when omitted
        key: Option<String>,
    },
    /// Extend the user's locks
    Refresh { key: Option<String> },
    List,
}

// =============================================================================
// MAIN
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,calreg_core=debug".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<RegistryError>() {
                Some(RegistryError::CertificationFailed(reports)) => {
                    eprintln!("error [SUBMIT:CERTIFICATION_FAILED]");
                    for report in reports {
                        eprintln!("{report}");
                    }
                }
                Some(registry) => eprintln!("error [{}]: {e:#}", registry.code()),
                None => eprintln!("error: {e:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_lock_key(key: &str) -> Result<LockKey> {
    LockKey::parse(key).ok_or_else(|| anyhow!("lock key must look like 'type:name', got '{key}'"))
}

async fn open_registry(cli: &Cli) -> Result<RegistryService> {
    let config = RegistryConfig::load(&cli.config)?;
    let state = cli
        .state
        .clone()
        .unwrap_or_else(|| config.storage_root.join("registry.json"));
    let store = Arc::new(JsonFileStore::open(&state)?);
    tracing::debug!(state = %store.path().display(), project = %config.project, "registry opened");
    Ok(RegistryService::build(config, store.clone(), store, None))
}

async fn run(cli: Cli) -> Result<()> {
    let registry = open_registry(&cli).await?;
    let user = cli.user.as_str();

    match cli.command {
        Commands::Seed {
            files,
            state,
            set_contexts,
        } => {
            let state = FileState::parse(&state).ok_or_else(|| anyhow!("unknown state '{state}'"))?;
            let report = registry
                .seeder
                .seed(SeedRequest {
                    sources: files,
                    state,
                    submitter: user.to_string(),
                    set_contexts,
                })
                .await?;
            print_json(&report)
        }

        Commands::Stage {
            files,
            instrument,
            file_type,
            description,
            keep_names,
            base,
        } => {
            let candidates = files
                .into_iter()
                .map(|path| {
                    let mut candidate = Candidate::new(path);
                    candidate.instrument = instrument.clone();
                    candidate.file_type = file_type.clone();
                    candidate
                })
                .collect();
            let outcome = registry
                .submissions
                .stage(StageRequest {
                    instrument,
                    submitter: user.to_string(),
                    description,
                    candidates,
                    auto_rename: !keep_names,
                    base: base.map_or(ContextSelector::Edit, ContextSelector::Named),
                })
                .await?;
            print_json(&outcome)
        }

        Commands::Confirm { batch_id } => {
            // A session lock taken with `lock acquire` is used as is and kept.
            let batch = registry.store.load_batch(batch_id).await?;
            let key = registry.submissions.lock_key_for(&batch);
            let outcome = match registry.lock_store.get_lock(&key).await? {
                Some(lock) if lock.holder == user && !lock.is_expired() => {
                    registry
                        .submissions
                        .confirm_with_lock(batch_id, &HeldLock::from(&lock))
                        .await?
                }
                _ => registry.submissions.confirm(batch_id, user).await?,
            };
            print_json(&outcome)
        }

        Commands::Cancel { batch_id } => {
            registry.submissions.cancel(batch_id, user).await?;
            println!("batch {batch_id} cancelled");
            Ok(())
        }

        Commands::Lock { action } => run_lock(&registry, user, action).await,

        Commands::Status { name, sweep } => {
            if sweep {
                let advanced = registry.status.sweep_delivered(&registry.config.project).await?;
                return print_json(&advanced);
            }
            let name = name.context("a file name or --sweep is required")?;
            registry.status.refresh_status(&name).await?;
            print_json(&registry.store.load_record(&name).await?)
        }

        Commands::Blacklist { name, lift } => {
            let affected = if lift {
                registry.blacklist.unblacklist(&name, user).await?
            } else {
                registry.blacklist.blacklist(&name, user).await?
            };
            print_json(&affected)
        }

        Commands::Reject { name, clear } => {
            registry.blacklist.set_rejected(&name, !clear, user).await?;
            print_json(&registry.store.load_record(&name).await?)
        }

        Commands::Cleanup => print_json(&registry.cleanup().await?),

        Commands::Context { kind, name } => match (kind, name) {
            (Some(kind), Some(name)) => {
                let kind = ContextKind::parse(&kind).ok_or_else(|| anyhow!("unknown context '{kind}'"))?;
                registry.set_context(kind, &name, user).await?;
                println!("{kind} → {name}");
                Ok(())
            }
            (kind, None) => {
                let kinds = match kind {
                    Some(kind) => vec![ContextKind::parse(&kind)
                        .ok_or_else(|| anyhow!("unknown context '{kind}'"))?],
                    None => vec![ContextKind::Edit, ContextKind::Operational],
                };
                for kind in kinds {
                    let current = registry.get_context(kind).await?;
                    println!("{kind}: {}", current.as_deref().unwrap_or("(unset)"));
                }
                Ok(())
            }
            (None, Some(_)) => Err(anyhow!("a context kind is required")),
        },
    }
}

async fn run_lock(registry: &RegistryService, user: &str, action: LockAction) -> Result<()> {
    let locks = &registry.locks;
    match action {
        LockAction::Acquire { key, timeout_secs } => {
            let key = parse_lock_key(&key)?;
            let timeout = timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(locks.policy().acquire_timeout);
            let held = locks
                .acquire_with(&key, user, timeout, locks.policy().max_age)
                .await?;
            print_json(&held)
        }
        LockAction::Release { key: Some(key) } => {
            let key = parse_lock_key(&key)?;
            match registry.lock_store.get_lock(&key).await? {
                Some(lock) if lock.holder == user => locks.release(&HeldLock::from(&lock)).await?,
                Some(lock) => return Err(anyhow!("{key} is held by {}, not {user}", lock.holder)),
                None => tracing::warn!(key = %key, "no such lock"),
            }
            Ok(())
        }
        LockAction::Release { key: None } => {
            let released = locks.release_all(user).await?;
            println!("released {released} lock(s)");
            Ok(())
        }
        LockAction::Refresh { key: Some(key) } => {
            let key = parse_lock_key(&key)?;
            let lock = registry
                .lock_store
                .get_lock(&key)
                .await?
                .with_context(|| format!("{key} is not locked"))?;
            if lock.holder != user {
                return Err(anyhow!("{key} is held by {}, not {user}", lock.holder));
            }
            print_json(&locks.reset_expiry(&HeldLock::from(&lock)).await?)
        }
        LockAction::Refresh { key: None } => {
            let refreshed = locks.reset_all_expiry(user).await?;
            println!("refreshed {refreshed} lock(s)");
            Ok(())
        }
        LockAction::List => print_json(&locks.list().await?),
    }
}
