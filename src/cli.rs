//! Command-line entry points for the scheduler and operators.
//!
//! Every command is side-effect-only and safe to run on an interval; `daemon`
//! runs `tick` on a fixed interval until interrupted.

use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info};

use crate::service::AppState;
use crate::storage::{CycleTrigger, Variant};

/// variant-lab command line.
#[derive(Parser, Debug)]
#[command(name = "variant-lab", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Evaluate running experiments or start a cycle when one is due
    Tick,

    /// Run an improvement cycle now
    Cycle {
        /// Trigger to record: scheduled, quality-drop, manual
        #[arg(long, default_value = "manual")]
        trigger: CycleTrigger,
    },

    /// Apply the decision engine to every active experiment
    Evaluate,

    /// Store this week's calibration snapshot
    Snapshot,

    /// Specialize the live variant for each large style cohort
    Cohorts,

    /// List variants
    Variants {
        /// Include inactive variants
        #[arg(long)]
        all: bool,
    },

    /// Show live variant, experiments, rules and recent cycles
    Status,

    /// Run `tick` periodically
    Daemon {
        /// Seconds between ticks
        #[arg(long, default_value = "3600")]
        interval_secs: u64,

        /// Also store a calibration snapshot on every tick
        #[arg(long)]
        with_snapshot: bool,
    },
}

/// Result of CLI command execution.
#[derive(Debug)]
pub struct CliResult {
    /// Exit code (0 = success)
    pub exit_code: i32,
    /// Output message
    pub message: String,
}

impl CliResult {
    /// Create a success result with the given message.
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            message: message.into(),
        }
    }

    /// Create an error result with the given message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            message: message.into(),
        }
    }
}

fn json_result<T: Serialize>(value: &T) -> CliResult {
    match serde_json::to_string_pretty(value) {
        Ok(s) => CliResult::success(s),
        Err(e) => CliResult::error(format!("Failed to render output: {}", e)),
    }
}

/// Execute a one-shot command. `daemon` is handled by [`run_daemon`].
pub async fn execute_command(command: Commands, state: &AppState) -> CliResult {
    match command {
        Commands::Tick => match state.orchestrator.check_and_trigger().await {
            Ok(outcome) => json_result(&outcome),
            Err(e) => CliResult::error(format!("Tick failed: {}", e)),
        },
        Commands::Cycle { trigger } => {
            match state.orchestrator.run_improvement_cycle(trigger).await {
                Ok(Some(cycle)) => json_result(&cycle),
                Ok(None) => CliResult::success("Another improvement cycle holds the lease; skipped."),
                Err(e) => CliResult::error(format!("Cycle failed: {}", e)),
            }
        }
        Commands::Evaluate => match state.orchestrator.evaluate_active_experiments().await {
            Ok(reports) => json_result(&reports),
            Err(e) => CliResult::error(format!("Evaluation failed: {}", e)),
        },
        Commands::Snapshot => match state.orchestrator.run_calibration_snapshot().await {
            Ok(Some(snapshot)) => json_result(&snapshot),
            Ok(None) => CliResult::success("Not enough paired records for a snapshot."),
            Err(e) => CliResult::error(format!("Snapshot failed: {}", e)),
        },
        Commands::Cohorts => match state.orchestrator.run_cohort_improvement_cycle().await {
            Ok(Some(report)) => json_result(&report),
            Ok(None) => CliResult::success("Another cohort cycle holds the lease; skipped."),
            Err(e) => CliResult::error(format!("Cohort cycle failed: {}", e)),
        },
        Commands::Variants { all } => execute_variants(state, all).await,
        Commands::Status => execute_status(state).await,
        Commands::Daemon { .. } => CliResult::error("daemon must be started through run_daemon"),
    }
}

fn format_rate(v: Option<f64>, digits: usize) -> String {
    v.map(|x| format!("{:.*}", digits, x))
        .unwrap_or_else(|| "-".to_string())
}

fn variant_line(v: &Variant) -> String {
    let role = match (v.is_active, v.is_candidate) {
        (true, true) => "candidate",
        (true, false) => "active",
        (false, _) => "retired",
    };
    format!(
        "  {:<24} {:<9} {:>3}%  n={:<5} score={:<5} rating={:<5} helpful={:<6} delta={:<5} {}",
        v.version,
        role,
        v.traffic_pct,
        v.sample_size,
        format_rate(v.avg_score, 2),
        format_rate(v.avg_user_rating, 2),
        v.helpful_pct()
            .map(|p| format!("{:.1}%", p))
            .unwrap_or_else(|| "-".to_string()),
        format_rate(v.avg_community_delta, 2),
        v.cohort.as_deref().unwrap_or("")
    )
}

async fn execute_variants(state: &AppState, all: bool) -> CliResult {
    let variants = match state.registry.list_all().await {
        Ok(v) => v,
        Err(e) => return CliResult::error(format!("Failed to list variants: {}", e)),
    };

    let shown: Vec<&Variant> = variants.iter().filter(|v| all || v.is_active).collect();
    if shown.is_empty() {
        return CliResult::success("No variants registered; the built-in baseline is serving.");
    }

    let mut output = format!("Variants ({})\n", shown.len());
    for v in shown {
        output.push_str(&variant_line(v));
        output.push('\n');
    }
    CliResult::success(output)
}

async fn execute_status(state: &AppState) -> CliResult {
    let mut output = String::new();
    output.push_str("\nImprovement Status\n");
    output.push_str("══════════════════════════════════════════════════════════════\n\n");

    match state.registry.live_variant().await {
        Ok(live) => output.push_str(&format!("Live variant: {}\n", variant_line(&live).trim())),
        Err(e) => output.push_str(&format!("Live variant: unknown (error: {})\n", e)),
    }

    match state.registry.active_candidates().await {
        Ok(candidates) if candidates.is_empty() => output.push_str("Experiments: none\n"),
        Ok(candidates) => {
            output.push_str(&format!("Experiments: {}\n", candidates.len()));
            for c in &candidates {
                output.push_str(&variant_line(c));
                output.push('\n');
            }
        }
        Err(e) => output.push_str(&format!("Experiments: unknown (error: {})\n", e)),
    }

    let floor = state.config.improvement.rule_confidence_floor;
    match state.storage.pending_rules(floor, 100).await {
        Ok(rules) => output.push_str(&format!(
            "Pending rules (confidence >= {:.2}): {}\n",
            floor,
            rules.len()
        )),
        Err(e) => output.push_str(&format!("Pending rules: unknown (error: {})\n", e)),
    }

    match state.storage.recent_snapshots(1).await {
        Ok(snapshots) => match snapshots.first() {
            Some(s) => output.push_str(&format!(
                "Calibration {}: delta={:+.2} r={} n={}\n",
                s.period,
                s.delta,
                format_rate(s.correlation, 3),
                s.sample_size
            )),
            None => output.push_str("Calibration: no snapshots\n"),
        },
        Err(e) => output.push_str(&format!("Calibration: unknown (error: {})\n", e)),
    }

    output.push('\n');
    match state.storage.recent_cycles(5).await {
        Ok(cycles) => {
            output.push_str(&format!("Recent cycles: {}\n", cycles.len()));
            for c in cycles {
                let age = Utc::now() - c.started_at;
                output.push_str(&format!(
                    "  [{}] {} {}h ago -> {}\n",
                    c.status,
                    c.trigger,
                    age.num_hours(),
                    c.candidate_version.as_deref().unwrap_or("no candidate")
                ));
            }
        }
        Err(e) => output.push_str(&format!("Recent cycles: unknown (error: {})\n", e)),
    }

    let counters = state.counters.snapshot();
    output.push_str(&format!(
        "\nGenerations this process: {} ok, {} repaired, {} fallback\n",
        counters.success, counters.repaired, counters.fallback
    ));
    let classifier = state.classifier_counters.snapshot();
    output.push_str(&format!(
        "Classifier calls this process: {} ok, {} fallback\n",
        classifier.success + classifier.repaired,
        classifier.fallback
    ));

    CliResult::success(output)
}

/// Tick every `interval` until Ctrl-C.
pub async fn run_daemon(state: &AppState, interval: Duration, with_snapshot: bool) {
    let mut ticker = tokio::time::interval(interval);
    info!(interval_secs = interval.as_secs(), "Scheduler started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match state.orchestrator.check_and_trigger().await {
                    Ok(outcome) => info!(outcome = ?outcome, "Tick complete"),
                    Err(e) => error!(error = %e, "Tick failed"),
                }
                if with_snapshot {
                    if let Err(e) = state.orchestrator.run_calibration_snapshot().await {
                        error!(error = %e, "Calibration snapshot failed");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }
}
