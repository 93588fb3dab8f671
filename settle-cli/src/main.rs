mod manifest;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use colored::Colorize;
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use settle_core::config::SettleConfig;
use settle_core::effect::Effect;
use settle_core::interpreter::{ApplyError, EffectOutcome, Interpreter};
use settle_core::plan::Plan;
use settle_core::resource::State;
use settle_core::sweeper::{ResourceTracker, SweepContext, SweepReport, SweeperRegistry};
use settle_provider_sim::{SimCloud, SimProvider};

use crate::manifest::Manifest;

#[derive(Parser)]
#[command(name = "settle")]
#[command(about = "Rehearse resource lifecycles against a simulated cloud", long_about = None)]
struct Cli {
    /// Path to the settings file (timeouts, polling, retry)
    #[arg(long, global = true, default_value = SettleConfig::DEFAULT_FILE)]
    config: PathBuf,

    /// Time each simulated pending state lasts, in milliseconds
    #[arg(long, global = true, default_value_t = 2000)]
    step_ms: u64,

    /// Number of state fetches that fail with a transient error
    #[arg(long, global = true, default_value_t = 0)]
    transient_errors: u32,

    /// Make the next create of this kind fail (repeatable)
    #[arg(long, global = true)]
    fail_create: Vec<String>,

    /// Log waits and retries
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the manifest
    Validate {
        /// Path to manifest file
        #[arg(default_value = "manifest.json")]
        file: PathBuf,
    },
    /// Create the manifest's resources and wait for each to settle
    Apply {
        /// Path to manifest file
        #[arg(default_value = "manifest.json")]
        file: PathBuf,

        /// Delete the resources again once they are all created
        #[arg(long)]
        destroy: bool,
    },
    /// Create the manifest's resources, then remove them with the sweepers
    Sweep {
        /// Path to manifest file
        #[arg(default_value = "manifest.json")]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let result = match &cli.command {
        Commands::Validate { file } => run_validate(file),
        Commands::Apply { file, destroy } => run_apply(&cli, file, *destroy).await,
        Commands::Sweep { file } => run_sweep(&cli, file).await,
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn run_validate(file: &Path) -> Result<()> {
    println!("{}", "Validating...".cyan());

    let resources = Manifest::load(file)?.resources()?;

    println!(
        "{}",
        format!("✓ {} resources validated successfully.", resources.len())
            .green()
            .bold()
    );
    for resource in &resources {
        println!("  • {}", resource.id);
    }
    Ok(())
}

/// Everything a run against the simulated cloud needs
struct Session {
    interpreter: Interpreter<SimProvider>,
    sweepers: SweeperRegistry,
    tracker: Arc<ResourceTracker>,
    cancel: CancellationToken,
}

impl Session {
    fn start(cli: &Cli) -> Result<Self> {
        let settings = SettleConfig::load_or_default(&cli.config)
            .with_context(|| format!("Failed to load settings from {}", cli.config.display()))?;

        let cloud = Arc::new(SimCloud::new(Duration::from_millis(cli.step_ms)));
        cloud.inject_transient_errors(cli.transient_errors);
        for kind in &cli.fail_create {
            cloud.fail_next_create(kind);
        }

        let cancel = CancellationToken::new();
        let on_interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling pending waits");
                on_interrupt.cancel();
            }
        });

        let provider = SimProvider::new(cloud);
        let sweepers = provider.sweepers(&settings)?;
        let tracker = Arc::new(ResourceTracker::new());
        let interpreter = Interpreter::with_settings(provider, settings)
            .with_cancellation(cancel.clone())
            .with_tracker(tracker.clone());

        Ok(Self {
            interpreter,
            sweepers,
            tracker,
            cancel,
        })
    }

    /// Apply every effect of `plan`, printing each outcome.
    ///
    /// Returns the states of created resources and whether all effects
    /// succeeded.
    async fn apply(&self, plan: &Plan) -> (Vec<State>, bool) {
        let result = self.interpreter.apply(plan).await;
        let mut created = Vec::new();

        for (effect, outcome) in plan.effects().iter().zip(&result.outcomes) {
            match outcome {
                Ok(outcome) => {
                    println!(
                        "  {} {}{}",
                        "✓".green(),
                        format_effect(effect),
                        format_outcome(outcome)
                    );
                    if let EffectOutcome::Created { state, .. } = outcome {
                        created.push(state.clone());
                    }
                }
                Err(e) => {
                    println!("  {} {} - {}", "✗".red(), format_effect(effect), e);
                    if let ApplyError::Wait { source, .. } = e
                        && source.is_failed()
                    {
                        println!("    {}", "left behind for the sweepers".yellow());
                    }
                }
            }
        }

        info!(
            "{} effects succeeded, {} failed",
            result.success_count, result.failure_count
        );
        (created, result.is_success())
    }

    /// Sweep whatever the tracker still holds
    async fn sweep(&self) -> Result<SweepReport> {
        println!("{}", "Sweeping...".cyan().bold());
        println!();
        let ctx = SweepContext {
            tracker: &self.tracker,
            cancel: &self.cancel,
        };
        let report = self.sweepers.run(&ctx, None).await?;
        print_sweep_report(&report);
        Ok(report)
    }
}

async fn run_apply(cli: &Cli, file: &Path, destroy: bool) -> Result<()> {
    let resources = Manifest::load(file)?.resources()?;
    let session = Session::start(cli)?;

    let plan: Plan = resources.into_iter().map(Effect::Create).collect();
    print_plan(&plan);

    println!("{}", "Applying changes...".cyan().bold());
    println!();
    let (created, mut success) = session.apply(&plan).await;

    if destroy {
        println!();
        println!("{}", "Destroying resources...".red().bold());
        println!();
        let deletes: Plan = created
            .iter()
            .rev()
            .filter_map(|state| {
                state.handle.clone().map(|handle| Effect::Delete {
                    id: state.id.clone(),
                    handle,
                })
            })
            .collect();
        let (_, deleted) = session.apply(&deletes).await;
        success &= deleted;

        // Failed creates and deletes leave handles behind
        if !session.tracker.is_empty() {
            println!();
            warn!("{} resources left behind", session.tracker.len());
            success &= session.sweep().await?.is_success();
        }
    }

    finish(success, created.len(), plan.mutation_count())
}

async fn run_sweep(cli: &Cli, file: &Path) -> Result<()> {
    let resources = Manifest::load(file)?.resources()?;
    let session = Session::start(cli)?;

    let plan: Plan = resources.into_iter().map(Effect::Create).collect();
    print_plan(&plan);

    println!("{}", "Applying changes...".cyan().bold());
    println!();
    let (_, applied) = session.apply(&plan).await;
    println!();

    let report = session.sweep().await?;
    finish_sweep(applied, &report, session.tracker.len())
}

fn finish_sweep(applied: bool, report: &SweepReport, left_behind: usize) -> Result<()> {
    if !report.is_success() || left_behind > 0 {
        bail!("{} resources could not be swept", left_behind);
    }
    if !applied {
        bail!("Apply failed. {} resources swept.", report.swept());
    }
    Ok(())
}

fn finish(success: bool, created: usize, planned: usize) -> Result<()> {
    println!();
    if !success {
        bail!("Apply failed. {} of {} resources settled.", created, planned);
    }
    println!(
        "{}",
        format!("Apply complete! {} resources settled.", created)
            .green()
            .bold()
    );
    Ok(())
}

fn print_plan(plan: &Plan) {
    println!("{}", "Execution Plan:".cyan().bold());
    println!();
    for effect in plan.effects() {
        println!("  {} {}", "+".green().bold(), effect.resource_id());
    }
    println!();
    println!("{}", plan.summary());
    println!();
}

fn print_sweep_report(report: &SweepReport) {
    for (name, result) in &report.results {
        match result {
            Ok(count) => println!("  {} {} ({} removed)", "✓".green(), name, count),
            Err(e) => println!("  {} {} - {}", "✗".red(), name, e),
        }
    }
    println!();
    println!("Swept {} resources.", report.swept());
}

fn format_effect(effect: &Effect) -> String {
    match effect {
        Effect::Create(r) => format!("Create {}", r.id),
        Effect::Update { id, .. } => format!("Update {}", id),
        Effect::Delete { id, .. } => format!("Delete {}", id),
        Effect::Read { id, .. } => format!("Read {}", id),
    }
}

fn format_outcome(outcome: &EffectOutcome) -> String {
    let report = match outcome {
        EffectOutcome::Created { report, .. }
        | EffectOutcome::Updated { report, .. }
        | EffectOutcome::Deleted { report, .. } => report,
        EffectOutcome::Read { .. } => return String::new(),
        EffectOutcome::Skipped { reason } => return format!(" (skipped: {})", reason),
    };
    format!(
        " ({} after {} fetches, {:.1}s)",
        report.state,
        report.fetches,
        report.elapsed.as_secs_f64()
    )
    .dimmed()
    .to_string()
}
