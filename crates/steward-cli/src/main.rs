use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use steward_core::app::{AppBuilder, Runtime, SubmitRequest};
use steward_core::config::{Backend, LogConfig, LogFormat, StewardConfig, duration_format};
use steward_core::domain::{
    ApprovalId, GrantId, RiskTier, TaskId, TaskStatus, TaskType, TenantId, UserId, Verdict,
};
use steward_core::typed::TypedTask;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod demo;

#[derive(Parser)]
#[command(name = "steward")]
#[command(about = "Task lifecycle and approval governance engine", long_about = None)]
struct Cli {
    /// TOML config file
    #[arg(long, short, global = true, env = "STEWARD_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, global = true, env = "STEWARD_TENANT", default_value = "default")]
    tenant: TenantId,

    /// Operator identity recorded in the audit log
    #[arg(long, global = true, env = "STEWARD_ACTOR", default_value = "operator")]
    actor: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the executor pool and background sweeps until Ctrl-C
    Serve,

    /// Submit a task
    Submit {
        task_type: TaskType,
        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,
        #[arg(long, default_value = "read-only")]
        risk: RiskTier,
        #[arg(long, env = "STEWARD_REQUESTER")]
        requester: UserId,
        #[arg(long)]
        idempotency_key: Option<String>,
        /// Grant scope (defaults from the policy table)
        #[arg(long)]
        scope: Option<String>,
        #[arg(long)]
        parent: Option<TaskId>,
    },

    /// Show a task
    Show {
        task_id: TaskId,
        #[arg(long)]
        events: bool,
        #[arg(long)]
        audit: bool,
    },

    /// Cancel a task
    Cancel { task_id: TaskId },

    /// Approve a pending approval
    Approve {
        approval_id: ApprovalId,
        #[arg(long)]
        reason: Option<String>,
    },

    /// Deny a pending approval
    Deny {
        approval_id: ApprovalId,
        #[arg(long)]
        reason: Option<String>,
    },

    /// List pending approvals
    Pending {
        #[arg(long)]
        user: Option<UserId>,
        /// Resolve every listed approval with this verdict
        #[arg(long, value_parser = parse_verdict)]
        resolve: Option<Verdict>,
    },

    /// Issue a standing approval grant
    Grant {
        user: UserId,
        scope: String,
        #[arg(long, default_value = "1h", value_parser = duration_format::parse_duration)]
        ttl: Duration,
    },

    /// Revoke one grant by id, or every active grant for --user/--scope
    Revoke {
        #[arg(conflicts_with_all = ["user", "scope"], required_unless_present = "user")]
        grant_id: Option<GrantId>,
        #[arg(long, requires = "scope")]
        user: Option<UserId>,
        #[arg(long, requires = "user")]
        scope: Option<String>,
    },

    /// Show a user's approval bypass mode after the tenant kill switch
    Bypass { user: UserId },

    /// Task counts per status
    Counts {
        /// Count across all tenants
        #[arg(long)]
        all: bool,
    },

    /// In-memory end-to-end walkthrough
    Demo,
}

fn parse_verdict(s: &str) -> Result<Verdict, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "approve" => Ok(Verdict::Approve),
        "deny" => Ok(Verdict::Deny),
        other => Err(format!("expected approve or deny, got {other:?}")),
    }
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match log.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn build_runtime(config: StewardConfig) -> Result<Runtime> {
    let step = Duration::from_millis(200);
    let runtime = demo::register(AppBuilder::new(config), step)?
        .expect_tasks(&[demo::Echo::TYPE, demo::Deploy::TYPE])
        .build()?;
    Ok(runtime)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if matches!(cli.command, Commands::Demo) {
        let config = demo_config();
        init_tracing(&config.log);
        return run_demo(config).await;
    }

    let config = StewardConfig::load(cli.config.as_deref())
        .with_context(|| format!("loading config {:?}", cli.config))?;
    init_tracing(&config.log);
    if config.store.backend == Backend::Memory && !matches!(cli.command, Commands::Serve) {
        warn!("store.backend = \"memory\": state is discarded when this command exits");
    }

    let bypass = config.bypass.clone();
    let runtime = build_runtime(config)?;
    let tenant = &cli.tenant;
    let actor = cli.actor.as_str();

    match cli.command {
        Commands::Serve => {
            let group = runtime.start();
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            info!("shutdown requested");
            group.shutdown_and_join().await;
        }
        Commands::Submit {
            task_type,
            payload,
            risk,
            requester,
            idempotency_key,
            scope,
            parent,
        } => {
            let payload = serde_json::from_str(&payload).context("--payload is not valid JSON")?;
            let mut req = SubmitRequest::new(tenant.clone(), requester, task_type, payload, risk);
            if let Some(key) = idempotency_key {
                req = req.idempotency_key(key);
            }
            if let Some(scope) = scope {
                req = req.scope(scope);
            }
            if let Some(parent) = parent {
                req = req.parent(parent);
            }
            print_json(&runtime.submit_task(req).await?)?;
        }
        Commands::Show {
            task_id,
            events,
            audit,
        } => {
            print_json(&runtime.get_task(tenant, task_id).await?)?;
            if events {
                print_json(&runtime.task_events(tenant, task_id).await?)?;
            }
            if audit {
                print_json(&runtime.task_audit(tenant, task_id).await?)?;
            }
        }
        Commands::Cancel { task_id } => {
            print_json(&runtime.cancel_task(tenant, task_id, actor).await?)?;
        }
        Commands::Approve {
            approval_id,
            reason,
        } => {
            let approval = runtime
                .decide_approval(tenant, approval_id, Verdict::Approve, actor, reason)
                .await?;
            print_json(&approval)?;
        }
        Commands::Deny {
            approval_id,
            reason,
        } => {
            let approval = runtime
                .decide_approval(tenant, approval_id, Verdict::Deny, actor, reason)
                .await?;
            print_json(&approval)?;
        }
        Commands::Pending { user, resolve } => match resolve {
            Some(verdict) => {
                let resolved = runtime
                    .bulk_resolve(tenant, user.as_ref(), verdict, actor, None)
                    .await?;
                print_json(&resolved)?;
            }
            None => print_json(&runtime.list_pending_approvals(tenant, user.as_ref()).await?)?,
        },
        Commands::Grant { user, scope, ttl } => {
            print_json(&runtime.issue_grant(tenant, &user, &scope, ttl, actor).await?)?;
        }
        Commands::Revoke {
            grant_id,
            user,
            scope,
        } => match (grant_id, user, scope) {
            (Some(id), _, _) => print_json(&runtime.revoke_grant(tenant, id, actor).await?)?,
            (None, Some(user), Some(scope)) => {
                let revoked = runtime.revoke_grants(tenant, &user, &scope, actor).await?;
                println!("revoked {revoked} grant(s)");
            }
            _ => bail!("pass a grant id, or both --user and --scope"),
        },
        Commands::Bypass { user } => {
            print_json(&serde_json::json!({
                "tenant": tenant,
                "user": user,
                "bypass_mode": bypass.configured_mode(tenant, &user),
                "effective_bypass_mode": bypass.effective_mode(tenant, &user),
                "tenant_allows_user_bypass": bypass.tenant_allows_user_bypass(tenant),
            }))?;
        }
        Commands::Counts { all } => {
            let counts = runtime
                .status_counts(if all { None } else { Some(tenant) })
                .await?;
            print_json(&counts)?;
        }
        Commands::Demo => {}
    }
    Ok(())
}

fn demo_config() -> StewardConfig {
    let mut config = StewardConfig::default();
    config.executor.workers = 2;
    config.executor.cancel_poll_interval = Duration::from_millis(50);
    config.approval.sweep_interval = Duration::from_millis(200);
    config.reconcile.interval = Duration::from_secs(1);
    config.bus.poll_interval = Duration::from_millis(20);
    config
}

async fn wait_for(runtime: &Runtime, tenant: &TenantId, id: TaskId, want: &[TaskStatus]) -> Result<TaskStatus> {
    for _ in 0..200 {
        let task = runtime.get_task(tenant, id).await?;
        if want.contains(&task.status) {
            return Ok(task.status);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    bail!("task {id} did not reach {want:?} in time")
}

async fn run_demo(config: StewardConfig) -> Result<()> {
    let runtime = build_runtime(config)?;
    let tenant = TenantId::new("demo-org")?;
    let alice = UserId::new("alice")?;
    let group = runtime.start();

    // 1) 低リスク: そのまま実行される
    let echo = runtime
        .submit_task(SubmitRequest::typed(
            tenant.clone(),
            alice.clone(),
            &demo::Echo {
                message: "hello from steward".into(),
            },
            RiskTier::ReadOnly,
        )?)
        .await?;
    let status = wait_for(&runtime, &tenant, echo.task.id, &[TaskStatus::Succeeded]).await?;
    info!(task_id = %echo.task.id, %status, "echo finished");

    // 2) 実行途中で承認を求める deploy
    let deploy = demo::Deploy {
        service: "billing".into(),
        version: "2.4.1".into(),
    };
    let sub = runtime
        .submit_task(
            SubmitRequest::typed(tenant.clone(), alice.clone(), &deploy, RiskTier::Mutating)?
                .idempotency_key("deploy-billing-2.4.1"),
        )
        .await?;
    wait_for(&runtime, &tenant, sub.task.id, &[TaskStatus::WaitingApproval]).await?;
    for approval in runtime.list_pending_approvals(&tenant, None).await? {
        info!(approval_id = %approval.id, sub_scope = ?approval.sub_scope, "approving");
        runtime
            .decide_approval(&tenant, approval.id, Verdict::Approve, "bob", Some("change window".into()))
            .await?;
    }
    let status = wait_for(&runtime, &tenant, sub.task.id, &[TaskStatus::Succeeded, TaskStatus::Failed]).await?;
    info!(task_id = %sub.task.id, %status, "deploy finished");

    // 同じキーで再投入しても新しいタスクは作られない
    let again = runtime
        .submit_task(
            SubmitRequest::typed(tenant.clone(), alice.clone(), &deploy, RiskTier::Mutating)?
                .idempotency_key("deploy-billing-2.4.1"),
        )
        .await?;
    info!(was_new = again.was_new, task_id = %again.task.id, "idempotent resubmission");

    // 3) 破壊的操作: grant がなければゲートで止まり、DENY でキャンセル
    let risky = runtime
        .submit_task(SubmitRequest::typed(
            tenant.clone(),
            alice.clone(),
            &demo::Echo {
                message: "drop table".into(),
            },
            RiskTier::Destructive,
        )?)
        .await?;
    runtime
        .bulk_resolve(&tenant, Some(&alice), Verdict::Deny, "bob", Some("not today".into()))
        .await?;
    wait_for(&runtime, &tenant, risky.task.id, &[TaskStatus::Canceled]).await?;

    // 4) grant があればゲートを飛ばす
    runtime
        .issue_grant(&tenant, &alice, "risk:destructive", Duration::from_secs(600), "bob")
        .await?;
    let granted = runtime
        .submit_task(SubmitRequest::typed(
            tenant.clone(),
            alice.clone(),
            &demo::Echo {
                message: "vacuum".into(),
            },
            RiskTier::Destructive,
        )?)
        .await?;
    wait_for(&runtime, &tenant, granted.task.id, &[TaskStatus::Succeeded]).await?;

    group.shutdown_and_join().await;

    print_json(&runtime.status_counts(Some(&tenant)).await?)?;
    print_json(&runtime.task_audit(&tenant, sub.task.id).await?)?;
    Ok(())
}
