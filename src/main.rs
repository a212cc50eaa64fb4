use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::{info, warn};

use substep::bounded_executor::CancelToken;
use substep::config::{EngineConfig, RunMode, SigMode};
use substep::context::ExecutionContext;
use substep::directive::process_input;
use substep::execute::{StepExecutor, SubstepOutcome};
use substep::executor::ShellExecutor;
use substep::resolve::{expand_input_files, ArgValue};
use substep::step::StepSpec;
use substep::{schema, trace};

/// Run one workflow step: group its input, skip what signatures say is done,
/// and execute the remaining substeps.
#[derive(Parser, Debug)]
#[command(name = "substep")]
#[command(about = "Step execution engine with input grouping and run signatures", long_about = None)]
struct Cli {
    /// Path to the step YAML document
    step: Option<PathBuf>,

    /// Step input handed down by the workflow (files or glob patterns)
    #[arg(long = "input", num_args = 1..)]
    input: Vec<String>,

    /// Signature mode: default, ignore, assert, build, force
    #[arg(long)]
    sig_mode: Option<SigMode>,

    /// Upper bound on concurrent substep workers
    #[arg(long)]
    max_procs: Option<usize>,

    /// Hand bodies to the executor as dry runs
    #[arg(long)]
    dry_run: bool,

    /// Directory relative targets and engine state live in
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Queue for tasks that do not name one
    #[arg(long)]
    queue: Option<String>,

    /// Print the substep groups and exit
    #[arg(long)]
    print_groups: bool,

    /// Print the generated step document schema and exit
    #[arg(long)]
    print_schema: bool,

    /// Print the execution trace after the run
    #[arg(long)]
    trace: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn print_error_chain(err: &anyhow::Error) {
    eprintln!("Error: {err}");

    let mut n = 0;
    let mut cur = err.source();
    while let Some(cause) = cur {
        eprintln!("  {n}: {cause}");
        n += 1;
        cur = cause.source();
    }
}

fn main() {
    if let Err(err) = real_main() {
        print_error_chain(&err);
        std::process::exit(1);
    }
}

fn real_main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();

    if cli.print_schema {
        println!("{}", serde_json::to_string_pretty(schema::step_schema_json())?);
        return Ok(());
    }

    let step_path = cli
        .step
        .clone()
        .ok_or_else(|| anyhow!("missing step document path (see --help)"))?;
    let step = StepSpec::load_from_file(&step_path)
        .with_context(|| format!("failed to load step: {}", step_path.display()))?;

    let mut config = EngineConfig::from_env()?;
    if let Some(mode) = cli.sig_mode {
        config.sig_mode = mode;
    }
    if let Some(n) = cli.max_procs {
        if n == 0 {
            return Err(anyhow!("--max-procs must be >= 1"));
        }
        config.max_procs = n;
    }
    if cli.dry_run {
        config.run_mode = RunMode::DryRun;
    }
    if let Some(dir) = &cli.workdir {
        config.workdir = dir.clone();
    }
    if let Some(q) = &cli.queue {
        config.default_queue = q.clone();
    }

    // Relative targets resolve against the working directory.
    let workdir = config
        .workdir
        .canonicalize()
        .with_context(|| format!("invalid workdir '{}'", config.workdir.display()))?;
    std::env::set_current_dir(&workdir)
        .with_context(|| format!("failed to enter workdir '{}'", workdir.display()))?;
    config.workdir = workdir;

    let workflow_id = format!("wf-{}", &step.content_hash()?[..12]);
    let mut ctx = ExecutionContext::new(&workflow_id, &step.name);
    if !cli.input.is_empty() {
        let items: Vec<ArgValue> = cli
            .input
            .iter()
            .map(|s| ArgValue::Value(serde_json::Value::String(s.clone())))
            .collect();
        ctx = ctx.with_step_input(expand_input_files(&items, false)?);
    }

    if cli.print_groups {
        let groups = process_input(&step, &mut ctx)?;
        for (i, g) in groups.iter().enumerate() {
            let vars = serde_json::to_string(&g.vars)?;
            println!("{i}\t{}\t{vars}", g.input);
        }
        return Ok(());
    }

    let cancel = CancelToken::new();
    watch_interrupts(cancel.clone());

    let engine = StepExecutor::new(config, Arc::new(ShellExecutor::new())).with_cancel_token(cancel);
    let mut tr = trace::Trace::new(&workflow_id);
    let outcome = engine.run_step(&step, &mut ctx, &mut tr);

    if cli.trace {
        trace::print_trace(&tr, true);
    }
    let result = outcome?;

    let stopped = result
        .outcomes
        .iter()
        .filter(|o| matches!(o, SubstepOutcome::StoppedEarly(_)))
        .count();
    println!(
        "Step '{}' ({} mode): {} substep(s), {} completed, {} skipped, {} stopped early",
        result.step_name,
        result.mode,
        result.outcomes.len(),
        result.substep_completed,
        result.substep_skipped,
        stopped
    );
    if result.step_output.is_valid() {
        println!("step_output: {}", result.step_output);
    }
    Ok(())
}

/// Deliver Ctrl-C to the engine: the first one interrupts, a second one kills.
fn watch_interrupts(cancel: CancelToken) {
    thread::spawn(move || {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(err) => {
                warn!("interrupt handling unavailable: {err}");
                return;
            }
        };
        rt.block_on(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; stopping substeps");
                cancel.interrupt();
            }
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("second interrupt; killing running bodies");
                cancel.escalate();
            }
        });
    });
}
