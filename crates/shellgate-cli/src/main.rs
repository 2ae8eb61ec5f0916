//! Shellgate CLI
//!
//! The `shellgate` command classifies shell operations and runs plans of them
//! under graduated sandboxing.
//!
//! ## Commands
//!
//! - `classify`: show the risk profile of one command
//! - `preview`: classification plus the predicted state diff
//! - `run`: execute a plan with interactive confirmation
//! - `audit show` / `audit verify`: inspect the audit log
//! - `policy dump`: print the effective policy as TOML

mod prompt;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, Level};

use shellgate_core::audit::AuditLog;
use shellgate_core::{
    cancel_pair, predict, Classifier, ConfirmationChannel, ConfirmationDecision, FailurePolicy,
    JsonlAuditLog, Operation, OperationCategory, Orchestrator, PlanReport, PlanStatus,
    PlanSubmission, PolicyContext, RiskProfile, SandboxMode, ScriptedConfirmer, StateDiff,
    StepSubmission,
};

use prompt::StdinConfirmer;

#[derive(Parser)]
#[command(name = "shellgate")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Risk-classified, sandboxed execution of shell operations", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Policy file (TOML). Defaults to the user config dir when present.
    #[arg(long, global = true, env = "SHELLGATE_POLICY")]
    policy: Option<PathBuf>,

    /// Audit log (JSONL). Defaults to the user data dir.
    #[arg(long, global = true, env = "SHELLGATE_AUDIT_LOG")]
    audit_log: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the risk profile of a command
    Classify {
        /// The command, as one argument or several
        #[arg(required = true, num_args = 1..)]
        command: Vec<String>,

        /// Declared category hint (recorded, not trusted)
        #[arg(long)]
        hint: Option<String>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Classify a command and show what it is predicted to change
    Preview {
        #[arg(required = true, num_args = 1..)]
        command: Vec<String>,

        #[arg(long)]
        json: bool,
    },

    /// Run a plan of commands
    Run {
        /// One plan step per argument
        #[arg(conflicts_with = "file")]
        steps: Vec<String>,

        /// Plan submission as JSON
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Keep running independent steps after a failure
        #[arg(long)]
        continue_on_failure: bool,

        /// Minimum sandbox mode for every step
        #[arg(long)]
        floor: Option<SandboxMode>,

        /// Approve every confirmation without asking
        #[arg(long)]
        yes: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inspect the audit log
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },

    /// Inspect the policy
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },
}

#[derive(Subcommand)]
enum AuditAction {
    /// Print the most recent entries
    Show {
        #[arg(short, long, default_value = "20")]
        limit: usize,

        #[arg(long)]
        json: bool,
    },
    /// Verify the hash chain
    Verify,
}

#[derive(Subcommand)]
enum PolicyAction {
    /// Print the effective policy as TOML
    Dump,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    shellgate_core::telemetry::init_tracing(cli.json_logs, level);

    let policy = Arc::new(load_policy(cli.policy.as_deref())?);

    match cli.command {
        Commands::Classify {
            command,
            hint,
            json,
        } => cmd_classify(&policy, &command.join(" "), hint.as_deref(), json),
        Commands::Preview { command, json } => cmd_preview(&policy, &command.join(" "), json),
        Commands::Run {
            steps,
            file,
            continue_on_failure,
            floor,
            yes,
            json,
        } => {
            let submission = build_submission(steps, file.as_deref(), continue_on_failure, floor)?;
            let audit = open_audit(cli.audit_log.as_deref())?;
            cmd_run(policy, audit, submission, yes, json).await
        }
        Commands::Audit { action } => {
            let audit = open_audit(cli.audit_log.as_deref())?;
            match action {
                AuditAction::Show { limit, json } => cmd_audit_show(&audit, limit, json).await,
                AuditAction::Verify => cmd_audit_verify(&audit).await,
            }
        }
        Commands::Policy {
            action: PolicyAction::Dump,
        } => cmd_policy_dump(&policy),
    }
}

fn load_policy(explicit: Option<&Path>) -> Result<PolicyContext> {
    if let Some(path) = explicit {
        return PolicyContext::load(path)
            .with_context(|| format!("Failed to load policy {}", path.display()));
    }
    match PolicyContext::default_path().filter(|p| p.exists()) {
        Some(path) => {
            info!(path = %path.display(), "using default policy file");
            PolicyContext::load(&path)
                .with_context(|| format!("Failed to load policy {}", path.display()))
        }
        None => Ok(PolicyContext::default()),
    }
}

fn open_audit(explicit: Option<&Path>) -> Result<JsonlAuditLog> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => JsonlAuditLog::default_path()
            .context("No data directory for the audit log; pass --audit-log")?,
    };
    JsonlAuditLog::open(&path)
        .with_context(|| format!("Failed to open audit log {}", path.display()))
}

fn operation(policy: &PolicyContext, raw: &str, hint: Option<&str>) -> Result<Operation> {
    let cwd = match &policy.working_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Failed to read current directory")?,
    };
    let hint = hint
        .map(|h| h.parse::<OperationCategory>().map_err(anyhow::Error::msg))
        .transpose()
        .context("Invalid category hint")?;
    Ok(Operation::new(raw, hint, cwd))
}

fn print_profile(profile: &RiskProfile) {
    println!("Risk:      {}", profile.level);
    println!("Requires:  {}", profile.required_mode);
    if profile.requires_confirmation() {
        println!("Confirm:   yes");
    }
    if let Some(rule) = &profile.decisive_rule {
        println!("Rule:      {rule}");
    }
    for reason in &profile.reasons {
        println!("  - {reason}");
    }
}

fn cmd_classify(policy: &Arc<PolicyContext>, raw: &str, hint: Option<&str>, json: bool) -> Result<()> {
    let classifier = Classifier::from_policy(Arc::clone(policy)).context("Invalid rule set")?;
    let op = operation(policy, raw, hint)?;
    let profile = classifier.classify(&op);
    if json {
        println!("{}", serde_json::to_string_pretty(&profile)?);
        return Ok(());
    }
    println!("Command:   {}", op.normalized());
    println!("Category:  {}", op.category());
    print_profile(&profile);
    Ok(())
}

#[derive(Serialize)]
struct Preview<'a> {
    command: &'a str,
    category: OperationCategory,
    risk_profile: &'a RiskProfile,
    effective_mode: SandboxMode,
    preflight_available: bool,
    predicted: &'a StateDiff,
}

fn cmd_preview(policy: &Arc<PolicyContext>, raw: &str, json: bool) -> Result<()> {
    let classifier = Classifier::from_policy(Arc::clone(policy)).context("Invalid rule set")?;
    let op = operation(policy, raw, None)?;
    let profile = classifier.classify(&op);
    let predicted = predict(&op);
    let preview = Preview {
        command: op.normalized(),
        category: op.category(),
        risk_profile: &profile,
        effective_mode: profile.required_mode.max(policy.default_mode_floor),
        preflight_available: op.preflight_available(),
        predicted: &predicted,
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&preview)?);
        return Ok(());
    }
    println!("Command:   {}", preview.command);
    println!("Category:  {}", preview.category);
    print_profile(&profile);
    println!("Runs as:   {}", preview.effective_mode);
    println!("Predicted: {}", predicted.summary());
    for change in &predicted.changes {
        println!("  {change}");
    }
    Ok(())
}

fn build_submission(
    steps: Vec<String>,
    file: Option<&Path>,
    continue_on_failure: bool,
    floor: Option<SandboxMode>,
) -> Result<PlanSubmission> {
    let mut submission = match file {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read plan {}", path.display()))?;
            serde_json::from_str::<PlanSubmission>(&text)
                .with_context(|| format!("Invalid plan {}", path.display()))?
        }
        None if steps.is_empty() => bail!("Nothing to run: pass steps or --file"),
        None => PlanSubmission::new(steps.into_iter().map(StepSubmission::new).collect()),
    };
    if continue_on_failure {
        submission.failure_policy = FailurePolicy::ContinueSkippingDependents;
    }
    if floor.is_some() {
        submission.mode_floor = floor;
    }
    Ok(submission)
}

async fn cmd_run(
    policy: Arc<PolicyContext>,
    audit: JsonlAuditLog,
    submission: PlanSubmission,
    yes: bool,
    json: bool,
) -> Result<()> {
    let orchestrator =
        Orchestrator::from_policy(policy, Arc::new(audit)).context("Failed to build orchestrator")?;
    let confirmer: Box<dyn ConfirmationChannel> = if yes {
        Box::new(ScriptedConfirmer::always(ConfirmationDecision::Approve))
    } else {
        Box::new(StdinConfirmer::spawn())
    };

    let (cancel, signal) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nCancelling plan...");
            cancel.cancel();
        }
    });

    let report = orchestrator
        .run_plan(submission, confirmer.as_ref(), signal)
        .await
        .context("Plan run failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    if report.status != PlanStatus::Succeeded {
        bail!("plan {} ended {}", report.plan_id, report.status);
    }
    Ok(())
}

fn print_report(report: &PlanReport) {
    println!("Plan {} {}", report.plan_id, report.status);
    for step in &report.steps {
        let mode = step.mode_used.map(|m| m.to_string()).unwrap_or_else(|| "-".to_string());
        let level = step
            .risk_profile
            .as_ref()
            .map(|p| p.level.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<8} {:<28} {:<12} {:<11} {}",
            step.step_id.to_string(),
            step.status.to_string(),
            level,
            mode,
            step.command
        );
        if let Some(result) = &step.result {
            println!("           changes: {}", result.state_diff.summary());
            if !result.stdout.is_empty() {
                for line in result.stdout.lines() {
                    println!("           | {line}");
                }
            }
        }
        if let Some(failure) = &step.failure {
            println!("           {failure}");
        }
    }
    for rollback in &report.rollbacks {
        println!("  rollback {}: {}", rollback.step_id, rollback.summary());
    }
    if report.degraded() {
        println!("WARNING: a rollback failed or left irreversible changes; the system may be partially changed");
    }
}

async fn cmd_audit_show(audit: &JsonlAuditLog, limit: usize, json: bool) -> Result<()> {
    let entries = audit.entries().await.context("Failed to read audit log")?;
    let start = entries.len().saturating_sub(limit);
    for entry in &entries[start..] {
        if json {
            println!("{}", serde_json::to_string(entry)?);
        } else {
            println!("{}  {entry}", entry.short_digest());
        }
    }
    if entries.is_empty() && !json {
        println!("No audit entries in {}", audit.path().display());
    }
    Ok(())
}

async fn cmd_audit_verify(audit: &JsonlAuditLog) -> Result<()> {
    let count = audit.verify().await.context("Audit log verification failed")?;
    println!("{count} entries verified in {}", audit.path().display());
    Ok(())
}

fn cmd_policy_dump(policy: &PolicyContext) -> Result<()> {
    print!("{}", policy.to_toml_string()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "shellgate",
            "run",
            "--continue-on-failure",
            "--floor",
            "simulation",
            "mkdir -p /tmp/a",
            "ls /tmp/a",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                steps,
                continue_on_failure,
                floor,
                ..
            } => {
                assert_eq!(steps.len(), 2);
                assert!(continue_on_failure);
                assert_eq!(floor, Some(SandboxMode::Simulation));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_build_submission_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.json");
        std::fs::write(
            &path,
            r#"{"steps":[{"command":"ls"},{"command":"pwd","depends_on":[1]}]}"#,
        )
        .unwrap();
        let sub = build_submission(Vec::new(), Some(&path), true, None).unwrap();
        assert_eq!(sub.steps.len(), 2);
        assert_eq!(sub.steps[1].depends_on, vec![1]);
        assert_eq!(sub.failure_policy, FailurePolicy::ContinueSkippingDependents);
    }

    #[test]
    fn test_empty_run_rejected() {
        assert!(build_submission(Vec::new(), None, false, None).is_err());
    }
}
