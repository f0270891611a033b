use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use mailpress::{
    BatchJob, BatchState, DirDocumentSink, DocumentMode, DocumentSink, EngineConfig,
    FormatRegistry, InMemoryBatchStore, Orchestrator, PoolOpts, SingleSurfaceSession, SurfacePool,
    SvgEngine, SvgEngineOpts, Template, builtin_registry, load_recipients,
};

#[derive(Parser, Debug)]
#[command(name = "mailpress", version)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, short, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the available print formats.
    Formats(FormatsArgs),
    /// Render a batch of recipients into print-ready PDFs.
    Render(RenderArgs),
}

#[derive(Parser, Debug)]
struct FormatsArgs {
    /// JSON array of custom formats replacing the built-in table.
    #[arg(long)]
    formats: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct RenderArgs {
    /// Template JSON.
    #[arg(long)]
    template: PathBuf,

    /// Recipients JSON (array of objects).
    #[arg(long)]
    recipients: PathBuf,

    /// Print format name.
    #[arg(long, default_value = "postcard-4x6")]
    format: String,

    /// `per-recipient` or `merged`.
    #[arg(long, default_value = "per-recipient")]
    mode: DocumentMode,

    /// Work items in flight at once (capped by the pool size).
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// Output directory for the PDFs.
    #[arg(long)]
    out: PathBuf,

    /// Engine configuration JSON.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override `pool.max_surfaces`.
    #[arg(long)]
    max_surfaces: Option<usize>,

    /// JSON array of custom formats replacing the built-in table.
    #[arg(long)]
    formats: Option<PathBuf>,

    /// Extra font directory (repeatable).
    #[arg(long = "font-dir")]
    font_dirs: Vec<PathBuf>,

    /// Do not load system fonts.
    #[arg(long, default_value_t = false)]
    no_system_fonts: bool,

    /// Pixels per template design unit.
    #[arg(long, default_value_t = 1.0)]
    device_scale: f64,

    /// Render sequentially on one surface instead of a pool.
    #[arg(long, default_value_t = false)]
    single: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.cmd {
        Command::Formats(args) => cmd_formats(args),
        Command::Render(args) => cmd_render(args),
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "mailpress=debug" } else { "mailpress=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_formats(path: Option<&PathBuf>) -> anyhow::Result<FormatRegistry> {
    match path {
        Some(p) => FormatRegistry::from_path(p)
            .with_context(|| format!("load formats '{}'", p.display())),
        None => Ok(builtin_registry().clone()),
    }
}

fn cmd_formats(args: FormatsArgs) -> anyhow::Result<()> {
    let formats = load_formats(args.formats.as_ref())?;
    for name in formats.names() {
        let f = formats.lookup(name)?;
        let (w, h) = f.page_px();
        println!(
            "{name:<16} {:>6.3}x{:<6.3} in  bleed {:.3} in  {} dpi  ({w}x{h} px)",
            f.width_units, f.height_units, f.bleed_units, f.dpi
        );
    }
    Ok(())
}

fn cmd_render(args: RenderArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(p) => EngineConfig::from_path(p)
            .with_context(|| format!("load config '{}'", p.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(n) = args.max_surfaces {
        config.pool.max_surfaces = n;
    }
    config.validate()?;

    let template = Template::from_path(&args.template)
        .with_context(|| format!("load template '{}'", args.template.display()))?;
    let recipients = load_recipients(&args.recipients)
        .with_context(|| format!("load recipients '{}'", args.recipients.display()))?;
    let formats = load_formats(args.formats.as_ref())?;

    let engine = Arc::new(SvgEngine::new(SvgEngineOpts {
        device_scale: args.device_scale,
        font_dirs: args.font_dirs.clone(),
        system_fonts: !args.no_system_fonts,
    })?);
    let sink = Arc::new(DirDocumentSink::new(&args.out)?);

    let job = if args.single {
        let session = SingleSurfaceSession::new(engine, config).with_formats(formats);
        let (job, docs) = session.run(&template, &recipients, &args.format, args.mode)?;
        for doc in &docs {
            sink.write(doc)?;
        }
        session.close();
        job
    } else {
        let pool = SurfacePool::new(engine, PoolOpts::from(&config.pool))?;
        let orchestrator = Orchestrator::new(
            pool,
            config,
            Arc::new(InMemoryBatchStore::new()),
            sink.clone(),
        )
        .with_formats(formats);
        let handle = orchestrator.start_batch(
            template,
            recipients,
            &args.format,
            args.mode,
            args.concurrency,
        )?;
        let job = handle.wait();
        orchestrator.shutdown();
        job
    };

    report(&job, &args.out);
    if job.state == BatchState::Failed {
        anyhow::bail!(
            "batch {} failed: {}",
            job.id,
            job.batch_error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn report(job: &BatchJob, out: &std::path::Path) {
    eprintln!(
        "batch {}: {:?}, {} rendered, {} failed of {}{}",
        job.id,
        job.state,
        job.completed,
        job.failed,
        job.total,
        if job.cancelled { " (cancelled)" } else { "" }
    );
    for r in job.failures() {
        if let Some(err) = &r.error {
            eprintln!("  recipient {}: {:?}: {}", r.recipient_index, err.kind, err.message);
        }
    }
    eprintln!("wrote {}", out.display());
}
