//! Tutora billing admin scripts.
//!
//! Operates on a JSON state file produced/consumed by the in-memory store.
//! Exit code is 0 on success and 1 on any failure. All subcommands accept
//! `--dry-run`, which reports what would change without writing the state
//! file back.

mod logger;

use std::{path::PathBuf, process::ExitCode, str::FromStr, sync::Arc};

use anyhow::Context;
use tracing::info;
use tutora_billing::{
    context::{BillingConfig, BillingContext, SystemClock},
    manager::{BillingManager, RebuildFlagsOptions},
    outbox::NullSink,
    store::memory::{MemoryStore, StoreState},
    zero_hours::{self, SweepCancel, SweepOptions},
};
use tutora_core::ids::{GuardianId, InvoiceId};

/// Tutora billing admin scripts.
#[derive(argh::FromArgs)]
struct Args {
    /// path to the JSON state file.
    #[argh(option)]
    state: PathBuf,

    #[argh(subcommand)]
    command: Command,
}

#[derive(argh::FromArgs)]
#[argh(subcommand)]
enum Command {
    CheckZeroHours(CheckZeroHoursArgs),
    ResequenceUnpaid(ResequenceUnpaidArgs),
    RebuildPaidFlags(RebuildPaidFlagsArgs),
}

/// Run the zero-hour generator across guardians.
#[derive(argh::FromArgs)]
#[argh(subcommand, name = "check-zero-hours")]
struct CheckZeroHoursArgs {
    /// report without writing anything.
    #[argh(switch)]
    dry_run: bool,

    /// restrict the sweep to one guardian id.
    #[argh(option)]
    guardian_id: Option<String>,

    /// stop after checking this many guardians.
    #[argh(option)]
    limit: Option<usize>,
}

/// Re-derive identifiers for unpaid invoices from fresh sequences.
#[derive(argh::FromArgs)]
#[argh(subcommand, name = "resequence-unpaid")]
struct ResequenceUnpaidArgs {
    /// report without writing anything.
    #[argh(switch)]
    dry_run: bool,
}

/// Resync paid-by-guardian flags from paid coverage.
#[derive(argh::FromArgs)]
#[argh(subcommand, name = "rebuild-paid-flags")]
struct RebuildPaidFlagsArgs {
    /// report without writing anything.
    #[argh(switch)]
    dry_run: bool,

    /// restrict to one invoice id.
    #[argh(option)]
    invoice_id: Option<String>,

    /// only invoices created in the last N days.
    #[argh(option)]
    since_days: Option<i64>,

    /// stop after this many invoices.
    #[argh(option)]
    limit: Option<usize>,
}

fn main() -> ExitCode {
    logger::init();

    let args: Args = argh::from_env();
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("error: could not start runtime: {err:#}");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let state = load_state(&args.state)?;
    let store = Arc::new(MemoryStore::from_state(state));
    let ctx = BillingContext::new(
        store.clone(),
        Arc::new(SystemClock),
        Arc::new(NullSink),
        BillingConfig::default(),
    );
    let manager = BillingManager::new(ctx.clone());

    let dry_run = match &args.command {
        Command::CheckZeroHours(cmd) => {
            let guardian = cmd
                .guardian_id
                .as_deref()
                .map(GuardianId::from_str)
                .transpose()
                .context("invalid --guardian-id")?;
            let options = SweepOptions {
                guardian,
                limit: cmd.limit,
                dry_run: cmd.dry_run,
            };
            let cancel = SweepCancel::new();
            let report =
                zero_hours::sweep(&ctx, &cancel, &options).await?;
            info!(
                checked = report.checked,
                generated = report.generated,
                suppressed = report.suppressed,
                "zero-hour sweep finished"
            );
            println!(
                "checked {} guardians, generated {}, suppressed {}",
                report.checked, report.generated, report.suppressed
            );
            cmd.dry_run
        }
        Command::ResequenceUnpaid(cmd) => {
            let changed =
                manager.resequence_unpaid(None, cmd.dry_run).await?;
            println!("resequenced {changed} unpaid invoices");
            cmd.dry_run
        }
        Command::RebuildPaidFlags(cmd) => {
            let invoice = cmd
                .invoice_id
                .as_deref()
                .map(InvoiceId::from_str)
                .transpose()
                .context("invalid --invoice-id")?;
            let options = RebuildFlagsOptions {
                invoice,
                since_days: cmd.since_days,
                limit: cmd.limit,
                dry_run: cmd.dry_run,
            };
            let touched = manager.rebuild_paid_flags(&options).await?;
            println!("rebuilt flags for {touched} settled invoices");
            cmd.dry_run
        }
    };

    if dry_run {
        info!("dry run; state file left untouched");
        return Ok(());
    }
    save_state(&args.state, &store.snapshot().await)
}

fn load_state(path: &PathBuf) -> anyhow::Result<StoreState> {
    if !path.exists() {
        return Ok(StoreState::default());
    }
    let bytes = std::fs::read(path)
        .with_context(|| format!("could not read {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("could not parse {}", path.display()))
}

fn save_state(path: &PathBuf, state: &StoreState) -> anyhow::Result<()> {
    let json = serde_json::to_vec_pretty(state)
        .context("could not serialize state")?;
    std::fs::write(path, json)
        .with_context(|| format!("could not write {}", path.display()))
}
