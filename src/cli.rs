//! CLI definition and dispatch.

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::adapters::local_executor::{ExecutionMode, HandlerFailure, LocalExecutor};
use crate::adapters::memory_store::MemoryStore;
use crate::domain::admin::{Capabilities, evaluate_admin};
use crate::domain::entity::{Entity, EntityId, Status, WorkKind};
use crate::domain::error::QuantopsError;
use crate::domain::ownership::OwnerId;
use crate::domain::service::OrchestrationService;
use crate::domain::settings::{Settings, StoreBackend};
use crate::domain::state_machine::TransitionRequest;
use crate::ports::config_port::ConfigPort;
use crate::ports::store_port::{AtomicStore, ListFilter};
use crate::telemetry;

pub const LOCAL_EXECUTOR: &str = "local";

#[derive(Parser, Debug)]
#[command(name = "quantops", about = "Multi-tenant work orchestration for quant workloads")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug)]
pub struct Scope {
    #[arg(short, long)]
    pub config: PathBuf,
    #[arg(short, long)]
    pub owner: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Submit a unit of work
    Submit {
        #[command(flatten)]
        scope: Scope,
        #[arg(long)]
        kind: String,
        #[arg(long, default_value = "{}")]
        payload: String,
        #[arg(long)]
        key: Option<String>,
        /// Hand the new entity to the local executor
        #[arg(long)]
        dispatch: bool,
    },
    /// Show one entity
    Get {
        #[command(flatten)]
        scope: Scope,
        id: String,
    },
    /// List the owner's entities
    List {
        #[command(flatten)]
        scope: Scope,
        #[arg(long)]
        kind: Option<String>,
        #[arg(long)]
        status: Option<String>,
    },
    /// Move an entity to another status
    Transition {
        #[command(flatten)]
        scope: Scope,
        id: String,
        #[arg(long)]
        to: String,
        /// JSON result, kept only when entering the success status
        #[arg(long)]
        result: Option<String>,
        #[arg(long)]
        error_code: Option<String>,
        #[arg(long)]
        error_message: Option<String>,
    },
    Cancel {
        #[command(flatten)]
        scope: Scope,
        id: String,
    },
    Retry {
        #[command(flatten)]
        scope: Scope,
        id: String,
    },
    /// Hand an entity in its initial status to the default executor
    Dispatch {
        #[command(flatten)]
        scope: Scope,
        id: String,
    },
    /// Delete a finished entity
    Delete {
        #[command(flatten)]
        scope: Scope,
        id: String,
    },
    /// Evaluate admin capabilities without touching the store
    AdminCheck {
        #[arg(long)]
        actor: String,
        #[arg(long)]
        role: Option<String>,
        #[arg(long)]
        level: Option<i64>,
        #[arg(long)]
        legacy_admin: Option<bool>,
    },
}

pub fn run(cli: Cli) -> ExitCode {
    match cli.command {
        Command::Submit {
            scope,
            kind,
            payload,
            key,
            dispatch,
        } => with_service(&scope, |svc, owner| {
            let kind: WorkKind = kind.parse()?;
            let payload: Value = serde_json::from_str(&payload)?;
            let entity = if dispatch {
                svc.submit_and_dispatch(owner, kind, payload, key.as_deref())?
            } else {
                svc.submit(owner, kind, payload, key.as_deref())?
            };
            Ok(to_json(&entity)?)
        }),
        Command::Get { scope, id } => with_service(&scope, |svc, owner| {
            Ok(to_json(&svc.get(owner, &EntityId::from(id))?)?)
        }),
        Command::List {
            scope,
            kind,
            status,
        } => with_service(&scope, |svc, owner| {
            let filter = ListFilter {
                kind: kind.as_deref().map(str::parse).transpose()?,
                status: status.as_deref().map(str::parse).transpose()?,
            };
            Ok(to_json(&svc.list(owner, &filter)?)?)
        }),
        Command::Transition {
            scope,
            id,
            to,
            result,
            error_code,
            error_message,
        } => with_service(&scope, |svc, owner| {
            let to: Status = to.parse()?;
            let mut request = TransitionRequest::to(to);
            if let Some(raw) = result {
                request = request.with_result(serde_json::from_str(&raw)?);
            }
            if error_code.is_some() || error_message.is_some() {
                request = request.with_failure(
                    error_code.unwrap_or_default(),
                    error_message.unwrap_or_default(),
                );
            }
            Ok(to_json(&svc.transition(owner, &EntityId::from(id), request)?)?)
        }),
        Command::Cancel { scope, id } => with_service(&scope, |svc, owner| {
            Ok(to_json(&svc.cancel(owner, &EntityId::from(id))?)?)
        }),
        Command::Retry { scope, id } => with_service(&scope, |svc, owner| {
            Ok(to_json(&svc.retry(owner, &EntityId::from(id))?)?)
        }),
        Command::Dispatch { scope, id } => with_service(&scope, |svc, owner| {
            Ok(to_json(&svc.dispatch(owner, &EntityId::from(id))?)?)
        }),
        Command::Delete { scope, id } => with_service(&scope, |svc, owner| {
            svc.delete(owner, &EntityId::from(id.as_str()))?;
            Ok(json!({ "deleted": id }))
        }),
        Command::AdminCheck {
            actor,
            role,
            level,
            legacy_admin,
        } => run_admin_check(Capabilities {
            actor_id: actor,
            role,
            level,
            legacy_admin_flag: legacy_admin,
        }),
    }
}

pub fn load_config(path: &PathBuf) -> Result<FileConfigAdapter, ExitCode> {
    FileConfigAdapter::from_file(path).map_err(|e| {
        let err = QuantopsError::ConfigParse {
            file: path.display().to_string(),
            reason: e.to_string(),
        };
        eprintln!("error: {err}");
        ExitCode::from(&err)
    })
}

pub fn open_store(
    settings: &Settings,
    config: &dyn ConfigPort,
) -> Result<Arc<dyn AtomicStore>, QuantopsError> {
    match settings.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "sqlite")]
        StoreBackend::Sqlite => {
            use crate::adapters::sqlite_store::SqliteStore;
            Ok(Arc::new(SqliteStore::from_config(config)?))
        }
        #[cfg(not(feature = "sqlite"))]
        StoreBackend::Sqlite => {
            let _ = config;
            Err(QuantopsError::ConfigInvalid {
                section: "store".into(),
                key: "backend".into(),
                reason: "sqlite feature is required for the sqlite backend".into(),
            })
        }
    }
}

/// The CLI's executor echoes the payload back as the result.
fn echo_executor() -> LocalExecutor {
    WorkKind::ALL.into_iter().fold(
        LocalExecutor::new(LOCAL_EXECUTOR, ExecutionMode::Inline),
        |exec, kind| {
            exec.with_handler(kind, |_: &OwnerId, entity: &Entity| {
                Ok::<Value, HandlerFailure>(json!({ "echo": entity.payload }))
            })
        },
    )
}

pub fn build_service(
    settings: &Settings,
    config: &dyn ConfigPort,
) -> Result<OrchestrationService, QuantopsError> {
    let store = open_store(settings, config)?;
    OrchestrationService::builder(store)
        .settings(settings.service.clone())
        .executor(Arc::new(echo_executor()))
        .build()
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, QuantopsError> {
    Ok(serde_json::to_value(value)?)
}

fn with_service<F>(scope: &Scope, op: F) -> ExitCode
where
    F: FnOnce(&OrchestrationService, &OwnerId) -> Result<Value, QuantopsError>,
{
    let adapter = match load_config(&scope.config) {
        Ok(a) => a,
        Err(code) => return code,
    };

    let outcome = Settings::from_config(&adapter).and_then(|settings| {
        telemetry::init_logging(&settings.logging);
        let service = build_service(&settings, &adapter)?;
        let owner = OwnerId::new(scope.owner.as_str())?;
        op(&service, &owner)
    });

    match outcome {
        Ok(value) => print_json(&value),
        Err(e) => {
            eprintln!("error [{}]: {e}", e.code());
            (&e).into()
        }
    }
}

fn print_json(value: &Value) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(text) => {
            println!("{text}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            let err = QuantopsError::from(e);
            eprintln!("error: {err}");
            (&err).into()
        }
    }
}

/// Prints the decision; exits non-zero when the actor is not an admin.
fn run_admin_check(caps: Capabilities) -> ExitCode {
    let decision = evaluate_admin(&caps);
    let printed = print_json(&json!({
        "actor_id": caps.actor_id,
        "is_admin": decision.is_admin,
        "source": decision.source,
    }));
    if decision.is_admin {
        return printed;
    }
    let err = QuantopsError::AccessDenied {
        id: format!("admin:{}", caps.actor_id),
    };
    (&err).into()
}
