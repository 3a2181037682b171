use anyhow::{bail, Context};
use bytesize::ByteSize;
use clap::{Parser, Subcommand, ValueEnum};
use crossbeam_channel::{never, select, tick};
use livetree_core::{
    export, ClockSpec, GlobOptions, GlobTree, InMemoryView, NotifyWatcher, PathSpec,
    QueryContext, QueryResult,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "livetree", about = "Live in-memory view of a directory tree")]
struct Args {
    /// Root directory to watch
    root: PathBuf,
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Crawl once and print a summary
    Crawl,
    /// Crawl once and list matching files
    Find {
        #[arg(long)]
        glob: Vec<String>,
        #[arg(long)]
        suffix: Vec<String>,
        #[arg(long)]
        path: Vec<String>,
        /// Directory levels to descend below each --path
        #[arg(long, default_value_t = u32::MAX)]
        depth: u32,
        #[arg(long)]
        include_deleted: bool,
        #[arg(long)]
        include_dot_files: bool,
        #[arg(long)]
        case_insensitive: bool,
        #[arg(long, value_enum, default_value_t = Format::Json)]
        format: Format,
    },
    /// Watch the root and print what changed at every interval
    Watch {
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Json,
    Csv,
}

fn init_logging(verbose: bool) -> anyhow::Result<()> {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default))?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    Ok(())
}

fn print_result(result: &QueryResult, format: Format) -> anyhow::Result<()> {
    match format {
        Format::Json => {
            println!("{}", serde_json::to_string_pretty(&export::to_json(result))?);
        }
        Format::Csv => export::to_csv(&result.files, std::io::stdout().lock())?,
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose)?;
    let view = InMemoryView::open(&args.root)
        .with_context(|| format!("cannot open {}", args.root.display()))?;

    match args.command {
        Command::Crawl => {
            let summary = view.client_mode_crawl();
            let store = view.read();
            let bytes: u64 = store
                .recent_files()
                .filter_map(|id| store[id].stat.filter(|_| store[id].exists))
                .filter(|st| !st.kind.is_dir())
                .map(|st| st.size)
                .sum();
            println!(
                "Crawled {} files in {} directories, {} in {:.2?} (clock {})",
                summary.files,
                summary.dirs,
                ByteSize::b(bytes),
                summary.elapsed,
                summary.clock
            );
        }
        Command::Find {
            glob,
            suffix,
            path,
            depth,
            include_deleted,
            include_dot_files,
            case_insensitive,
            format,
        } => {
            let globs = if glob.is_empty() {
                None
            } else {
                let options = GlobOptions {
                    include_dot_files,
                    case_insensitive,
                };
                Some(GlobTree::new(&glob, options)?)
            };
            let paths: Vec<PathSpec> = path.into_iter().map(|p| PathSpec::new(p, depth)).collect();
            view.client_mode_crawl();
            let ctx = QueryContext::new().include_deleted(include_deleted);
            let result = view.query(ctx, |view, ctx| {
                if let Some(globs) = &globs {
                    view.glob_generator(ctx, globs)?;
                }
                if !suffix.is_empty() {
                    view.suffix_generator(ctx, &suffix)?;
                }
                if !paths.is_empty() {
                    view.path_generator(ctx, &paths)?;
                }
                if globs.is_none() && suffix.is_empty() && paths.is_empty() {
                    view.all_files_generator(ctx)?;
                }
                Ok(())
            })?;
            print_result(&result, format)?;
        }
        Command::Watch {
            interval_ms,
            duration,
        } => {
            if interval_ms == 0 {
                bail!("--interval-ms must be positive");
            }
            let view = Arc::new(view);
            let watcher = NotifyWatcher::new(view.root_path())?;
            let threads = view.start_threads(Box::new(watcher))?;
            if !view.wait_until_ready_to_query(Duration::from_secs(600)) {
                bail!("initial crawl did not finish in time");
            }
            let mut clock = view.current_clock();
            info!(root = %view.root_path().display(), %clock, "watching");

            let ticker = tick(Duration::from_millis(interval_ms));
            let deadline = match duration {
                Some(secs) => crossbeam_channel::after(Duration::from_secs(secs)),
                None => never(),
            };
            loop {
                select! {
                    recv(ticker) -> _ => {
                        let ctx = QueryContext::new().include_deleted(true);
                        let result = view.query_since(ctx, ClockSpec::Clock(clock))?;
                        clock = result.clock;
                        if result.is_fresh_instance || !result.files.is_empty() {
                            println!("{}", serde_json::to_string(&export::to_json(&result))?);
                        }
                    }
                    recv(deadline) -> _ => break,
                }
            }
            threads.stop();
            info!(%clock, "stopped watching");
        }
    }
    Ok(())
}
