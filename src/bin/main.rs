//! forms2xml CLI - Convert Oracle Forms modules to XML and back
//!
//! Usage:
//!   forms2xml xml <src> [dst]
//!   forms2xml transform <src> [dst]
//!   forms2xml convert <src.fmb> [dst.fmb] [--no-transform] [--suffix <s>]
//!   forms2xml batch <src.fmb>... [--dst-dir <dir>] [--json]
//!
//! Examples:
//!   forms2xml xml forms/ORDERS.fmb
//!   forms2xml transform - - < ORDERS.xml > ORDERS-v11.xml
//!   forms2xml 6to11 forms/ORDERS.fmb
//!   forms2xml --decode-url http://converter:8008 batch forms/*.fmb --dst-dir out

use clap::{Parser, Subcommand};
use forms2xml::config::Settings;
use forms2xml::convert::{Converter, MimeType, RemoteConverter};
use forms2xml::logging;
use forms2xml::pipeline::{
    run_batch, same_file, AtomicDestination, Direction, JobError, JobSpec, Orchestrator,
    PipelineJob,
};
use forms2xml::rewrite::{FormsXmlProcessor, RewriteReport};
use forms2xml::worker::{ProcessSpawner, WorkerPool};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

type BoxError = Box<dyn Error>;

#[derive(Parser)]
#[command(name = "forms2xml")]
#[command(about = "forms2xml - Convert Oracle Forms modules to XML and back, migrating them on the way")]
#[command(version)]
struct Cli {
    /// Config file (default: $FORMS2XML_CONFIG, ./forms2xml.toml, user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Decode through this converter endpoint instead of local workers
    #[arg(long, global = true)]
    decode_url: Option<String>,

    /// Encode through this converter endpoint instead of local workers
    #[arg(long, global = true)]
    encode_url: Option<String>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a form to XML or XML to a form
    Xml {
        /// Source file, or - for stdin
        src: PathBuf,

        /// Destination (default: source with the other extension, stdout for stdin)
        dst: Option<PathBuf>,
    },

    /// Rewrite module XML to the target schema
    Transform {
        /// Source XML, or - for stdin
        src: PathBuf,

        /// Destination XML, or - for stdout
        dst: Option<PathBuf>,
    },

    /// Decode, rewrite and encode a form
    #[command(visible_aliases = ["6to11", "6211"])]
    Convert {
        /// Source form
        src: PathBuf,

        /// Destination form (default: source stem plus suffix)
        dst: Option<PathBuf>,

        /// Skip the rewrite stage
        #[arg(long)]
        no_transform: bool,

        /// Suffix of the derived destination
        #[arg(long)]
        suffix: Option<String>,

        /// Do not keep intermediate XML
        #[arg(long)]
        no_snapshots: bool,
    },

    /// Convert many forms
    Batch {
        /// Source forms
        #[arg(required = true)]
        sources: Vec<PathBuf>,

        /// Write destinations into this directory
        #[arg(long)]
        dst_dir: Option<PathBuf>,

        /// Jobs in flight at once
        #[arg(long)]
        concurrency: Option<usize>,

        /// Skip the rewrite stage
        #[arg(long)]
        no_transform: bool,

        /// Suffix of derived destinations
        #[arg(long)]
        suffix: Option<String>,

        /// Print the reports as JSON
        #[arg(long)]
        json: bool,
    },

    /// Serve conversions over HTTP
    #[cfg(feature = "server")]
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:8008")]
        listen: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let settings = match &cli.config {
        Some(path) => Settings::from_file(path),
        None => Settings::load(),
    };
    let settings = match settings {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Interrupted, stopping");
                shutdown.cancel();
            }
        });
    }

    let ctx = Context {
        settings,
        decode_url: cli.decode_url,
        encode_url: cli.encode_url,
        shutdown,
    };

    let result = match cli.command {
        Commands::Xml { src, dst } => cmd_xml(&ctx, src, dst).await,
        Commands::Transform { src, dst } => cmd_transform(&ctx, src, dst).await,
        Commands::Convert {
            src,
            dst,
            no_transform,
            suffix,
            no_snapshots,
        } => cmd_convert(&ctx, src, dst, no_transform, suffix, no_snapshots).await,
        Commands::Batch {
            sources,
            dst_dir,
            concurrency,
            no_transform,
            suffix,
            json,
        } => cmd_batch(&ctx, sources, dst_dir, concurrency, no_transform, suffix, json).await,
        #[cfg(feature = "server")]
        Commands::Serve { listen } => cmd_serve(&ctx, listen).await,
    };
    ctx.shutdown.cancel();

    match result {
        Ok(code) => code,
        Err(e) => {
            print_error(e.as_ref());
            ExitCode::FAILURE
        }
    }
}

/// Everything a command needs besides its own arguments.
struct Context {
    settings: Settings,
    decode_url: Option<String>,
    encode_url: Option<String>,
    shutdown: CancellationToken,
}

/// Decoder and encoder, sharing one pool when both are local.
struct Converters {
    decoder: Arc<dyn Converter>,
    encoder: Arc<dyn Converter>,
    pool: Option<Arc<WorkerPool>>,
}

impl Context {
    fn converters(&self, max_retries: u32) -> Result<Converters, BoxError> {
        let decode_url = self.decode_url.clone().or(self.settings.remote.decode_url.clone());
        let encode_url = self.encode_url.clone().or(self.settings.remote.encode_url.clone());
        let mut pool = None;
        let decoder = self.converter(decode_url.as_deref(), &mut pool, max_retries)?;
        let encoder = self.converter(encode_url.as_deref(), &mut pool, max_retries)?;
        Ok(Converters {
            decoder,
            encoder,
            pool,
        })
    }

    fn converter(
        &self,
        url: Option<&str>,
        pool: &mut Option<Arc<WorkerPool>>,
        max_retries: u32,
    ) -> Result<Arc<dyn Converter>, BoxError> {
        let worker = &self.settings.worker;
        if let Some(url) = url {
            let retry = self.settings.remote.retry_policy()?;
            return Ok(Arc::new(RemoteConverter::new(
                url,
                retry,
                worker.resolved_work_dir(),
            )?));
        }
        if let Some(pool) = pool.as_ref() {
            return Ok(pool.clone());
        }

        let spawner = ProcessSpawner::new(
            worker.to_command()?,
            worker.transport,
            worker.startup_timeout()?,
            worker.resolved_work_dir(),
        )?;
        let started = Arc::new(WorkerPool::start(
            Arc::new(spawner),
            worker.to_pool_config(max_retries)?,
            &self.shutdown,
        ));
        *pool = Some(started.clone());
        Ok(started)
    }

    fn orchestrator(&self, max_retries: u32) -> Result<Orchestrator, BoxError> {
        let converters = self.converters(max_retries)?;
        Ok(Orchestrator::new(
            converters.decoder,
            converters.encoder,
            self.processor(),
        ))
    }

    fn processor(&self) -> FormsXmlProcessor {
        FormsXmlProcessor::new(self.settings.rewrite.to_config())
    }
}

fn is_stdio(path: &Path) -> bool {
    path.as_os_str() == "-"
}

async fn cmd_xml(ctx: &Context, src: PathBuf, dst: Option<PathBuf>) -> Result<ExitCode, BoxError> {
    let max_retries = ctx.settings.worker.max_retries;

    if is_stdio(&src) {
        let mut input = BufReader::new(tokio::io::stdin());
        let mime = MimeType::sniff(input.fill_buf().await?);
        let converters = ctx.converters(max_retries)?;
        let converter = match mime {
            MimeType::Form => converters.decoder,
            MimeType::Xml => converters.encoder,
        };
        match dst.filter(|dst| !is_stdio(dst)) {
            None => {
                let mut out = tokio::io::stdout();
                converter.convert(&ctx.shutdown, &mut out, &mut input, mime).await?;
                out.flush().await?;
            }
            Some(dst) => {
                let mut dest = AtomicDestination::create(&dst)?;
                converter
                    .convert(&ctx.shutdown, dest.file(), &mut input, mime)
                    .await?;
                dest.commit().await?;
            }
        }
        return Ok(ExitCode::SUCCESS);
    }

    let mime = match MimeType::from_path(&src) {
        Some(mime) => mime,
        None => MimeType::sniff(&sniff_prefix(&src).await?),
    };
    let mut spec = JobSpec::new(&src, Direction::converting(mime));
    spec.destination = dst;
    let outcome = run_job(&ctx.orchestrator(max_retries)?, spec, &ctx.shutdown).await?;
    eprintln!("{} -> {}", src.display(), outcome.display());
    Ok(ExitCode::SUCCESS)
}

async fn sniff_prefix(path: &Path) -> std::io::Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;

    let mut prefix = Vec::with_capacity(64);
    tokio::fs::File::open(path)
        .await?
        .take(64)
        .read_to_end(&mut prefix)
        .await?;
    Ok(prefix)
}

async fn cmd_transform(
    ctx: &Context,
    src: PathBuf,
    dst: Option<PathBuf>,
) -> Result<ExitCode, BoxError> {
    let processor = ctx.processor();

    let report = if is_stdio(&src) {
        let input = BufReader::new(tokio::io::stdin());
        match dst.filter(|dst| !is_stdio(dst)) {
            None => processor.process_stream(tokio::io::stdout(), input).await?,
            Some(dst) => {
                let mut dest = AtomicDestination::create(&dst)?;
                let report = processor.process_stream(dest.file(), input).await?;
                dest.commit().await?;
                report
            }
        }
    } else {
        let input = BufReader::new(tokio::fs::File::open(&src).await?);
        match dst {
            Some(dst) if is_stdio(&dst) => {
                processor.process_stream(tokio::io::stdout(), input).await?
            }
            dst => {
                let mut spec = JobSpec::new(&src, Direction::Rewrite);
                spec.destination = dst;
                let dst = spec.destination();
                if same_file(&src, &dst)? {
                    return Err(JobError::Precondition(format!(
                        "source {} and destination {} are the same file",
                        src.display(),
                        dst.display()
                    ))
                    .into());
                }
                let mut dest = AtomicDestination::create(&dst)?;
                let report = processor.process_stream(dest.file(), input).await?;
                dest.commit().await?;
                eprintln!("{} -> {}", src.display(), dst.display());
                report
            }
        }
    };

    print_report(&report);
    Ok(ExitCode::SUCCESS)
}

async fn cmd_convert(
    ctx: &Context,
    src: PathBuf,
    dst: Option<PathBuf>,
    no_transform: bool,
    suffix: Option<String>,
    no_snapshots: bool,
) -> Result<ExitCode, BoxError> {
    let pipeline = &ctx.settings.pipeline;
    let mut spec = JobSpec::new(&src, Direction::Roundtrip)
        .with_rewrite(pipeline.rewrite && !no_transform)
        .with_suffix(suffix.unwrap_or_else(|| pipeline.suffix.clone()))
        .with_snapshots(pipeline.snapshots && !no_snapshots);
    spec.destination = dst;

    let orchestrator = ctx.orchestrator(pipeline.max_retries)?;
    let outcome = orchestrator
        .run(PipelineJob::new(spec), &ctx.shutdown)
        .await?;
    if let Some(report) = &outcome.report {
        print_report(report);
    }
    eprintln!("{} -> {}", src.display(), outcome.destination.display());
    Ok(ExitCode::SUCCESS)
}

async fn cmd_batch(
    ctx: &Context,
    sources: Vec<PathBuf>,
    dst_dir: Option<PathBuf>,
    concurrency: Option<usize>,
    no_transform: bool,
    suffix: Option<String>,
    json: bool,
) -> Result<ExitCode, BoxError> {
    let pipeline = &ctx.settings.pipeline;
    let options = pipeline.batch_options(concurrency)?;
    let suffix = suffix.unwrap_or_else(|| pipeline.suffix.clone());

    let specs: Vec<JobSpec> = sources
        .into_iter()
        .map(|src| {
            let mut spec = JobSpec::new(src, Direction::Roundtrip)
                .with_rewrite(pipeline.rewrite && !no_transform)
                .with_suffix(suffix.clone())
                .with_snapshots(pipeline.snapshots);
            if let Some(dir) = &dst_dir {
                let derived = spec.destination();
                if let Some(name) = derived.file_name() {
                    spec.destination = Some(dir.join(name));
                }
            }
            spec
        })
        .collect();

    if let Some(dir) = &dst_dir {
        tokio::fs::create_dir_all(dir).await?;
    }

    let orchestrator = ctx.orchestrator(pipeline.max_retries)?;
    let reports = run_batch(&orchestrator, specs, options, &ctx.shutdown).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            match &report.error {
                None => println!(
                    "OK      {} -> {}",
                    report.source.display(),
                    report.destination.display()
                ),
                Some(error) => println!(
                    "FAILED  {} (after {} attempts): {}",
                    report.source.display(),
                    report.attempts,
                    error
                ),
            }
        }
    }

    if reports.iter().all(|report| report.succeeded()) {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

#[cfg(feature = "server")]
async fn cmd_serve(ctx: &Context, listen: String) -> Result<ExitCode, BoxError> {
    use forms2xml::server::{serve, AppState};

    let converters = ctx.converters(ctx.settings.worker.max_retries)?;
    let state = Arc::new(AppState {
        decoder: converters.decoder,
        encoder: converters.encoder,
        pool: converters.pool,
        cancel: ctx.shutdown.clone(),
    });
    serve(&listen, state).await?;
    Ok(ExitCode::SUCCESS)
}

async fn run_job(
    orchestrator: &Orchestrator,
    spec: JobSpec,
    cancel: &CancellationToken,
) -> Result<PathBuf, JobError> {
    let outcome = orchestrator.run(PipelineJob::new(spec), cancel).await?;
    Ok(outcome.destination)
}

fn print_report(report: &RewriteReport) {
    for parent in &report.unknown_parents {
        eprintln!("Unknown parent module: {}", parent);
    }
    if !report.elided.is_empty() {
        eprintln!("Removed: {}", report.elided.join(", "));
    }
    if !report.synthesized.is_empty() {
        eprintln!("Added: {}", report.synthesized.join(", "));
    }
    if !report.duplicates.is_empty() {
        eprintln!("Declared twice: {}", report.duplicates.join(", "));
    }
}

/// Print an error and every cause not already part of its message.
fn print_error(err: &dyn Error) {
    let mut shown = err.to_string();
    eprintln!("Error: {}", shown);
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !shown.contains(&text) {
            eprintln!("  caused by: {}", text);
            shown.push_str(&text);
        }
        source = cause.source();
    }
}
