use std::time::Duration;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use neuroflow::pipeline::{EXIT_CANCELLED, EXIT_CONFIG};
use neuroflow::{CancelToken, NeuroflowError, Pipeline, PipelineTemplate, Settings};

/// Run a pipeline template over every subject of a BIDS dataset.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
struct Args {
    /// Root of the input dataset (`sub-*/[ses-*/]<modality>/*.nii*`).
    #[clap(index = 1)]
    input_root: Utf8PathBuf,

    /// Where the derivatives tree is written.
    #[clap(index = 2)]
    output_dir: Utf8PathBuf,

    /// Pipeline template (JSON).
    #[clap(long)]
    template: Utf8PathBuf,

    /// Scratch space, artifact store and failure logs.
    #[clap(long, default_value = "work")]
    work_dir: Utf8PathBuf,

    /// Maximum number of tools running at once. Defaults to the number of
    /// CPUs.
    #[clap(long, short)]
    jobs: Option<usize>,

    /// Retries for transient tool failures.
    #[clap(long, default_value_t = 1)]
    retries: u32,

    /// Pause before each retry, in milliseconds.
    #[clap(long, default_value_t = 5000)]
    retry_delay_ms: u64,

    /// Timeout for nodes that don't declare one, in seconds.
    #[clap(long)]
    timeout_secs: Option<u64>,

    /// Only process these participants (`01` or `sub-01`).
    #[clap(long = "participant-label", num_args = 1..)]
    participants: Vec<String>,

    /// Threads each tool may use (OMP and ITK).
    #[clap(long, default_value_t = 1)]
    omp_threads: usize,

    /// Print a Mermaid diagram of every subject's graph after the run.
    #[clap(long)]
    graph: bool,
}

impl Args {
    fn settings(&self) -> Settings {
        let settings = Settings::default()
            .with_work_dir(self.work_dir.clone())
            .with_retries(self.retries, Duration::from_millis(self.retry_delay_ms))
            .with_timeout(self.timeout_secs.map(Duration::from_secs))
            .with_tool_threads(self.omp_threads);

        match self.jobs {
            Some(jobs) => settings.with_concurrency(jobs),
            None => settings,
        }
    }
}

/// Cancels `token` on Ctrl-C. The signal is awaited on a small
/// current-thread runtime so the worker pool stays untouched.
fn install_interrupt(token: CancelToken) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .context("couldn't start the signal runtime")?;

    std::thread::Builder::new()
        .name("neuroflow-signal".into())
        .spawn(move || {
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupted, stopping running tools");
                    token.cancel();
                }
            });
        })
        .context("couldn't spawn the signal thread")?;

    Ok(())
}

fn run(args: &Args) -> anyhow::Result<i32> {
    let template = PipelineTemplate::load(&args.template)?;
    let token = CancelToken::new();
    install_interrupt(token.clone())?;

    let pipeline = Pipeline::new(template, args.settings()).with_cancel(token);

    let summary = match pipeline.run(&args.input_root, &args.output_dir, &args.participants) {
        Ok(summary) => summary,
        Err(err @ (NeuroflowError::Config(_) | NeuroflowError::Store(_))) => {
            tracing::error!("{err}");
            return Ok(EXIT_CONFIG);
        }
        Err(err) => return Err(err.into()),
    };

    eprint!("{}", summary.render());

    if args.graph {
        for subject in &summary.subjects {
            if let Some(diagram) = subject.diagram() {
                println!("%% {}\n{}", subject.label, diagram);
            }
        }
    }

    if summary.cancelled {
        return Ok(EXIT_CANCELLED);
    }

    Ok(summary.exit_code())
}

fn main() {
    let args = Args::parse();

    if let Err(err) = neuroflow::init_logging() {
        eprintln!("couldn't initialize logging: {err}");
    }

    let code = match run(&args) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err:#}");
            EXIT_CONFIG
        }
    };

    std::process::exit(code);
}
