use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

use rededup::analyze::Analyzer;
use rededup::describe::{describe, DescribeOptions, SortBy, SortChildren};
use rededup::difftree::{diff_tree, DiffTreeOptions, ShowSide, DEFAULT_MAX_DEPTH};
use rededup::error::exit_code_for;
use rededup::hash::HashAlgorithm;
use rededup::index::inspect::inspect;
use rededup::index::{Importer, IndexBuilder};
use rededup::meta::MetadataPolicy;
use rededup::repository::{discover, Repository};

#[derive(Parser, Debug)]
#[command(name = "rededup", version, about = "Content-addressed duplicate index and analyzer", long_about = None)]
struct Cli {
    /// Repository root (default: $REDEDUP_REPOSITORY, then the nearest
    /// ancestor directory containing `.rededup`)
    #[arg(long, global = true)]
    repository: Option<PathBuf>,

    /// Shorthand for --log-level debug
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Log filter (error, warn, info, debug, trace); RUST_LOG wins
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Destroy and re-create the index from the tree
    Rebuild {
        /// Content hash to index with (sha256, blake3)
        #[arg(long)]
        hash_algorithm: Option<HashAlgorithm>,
    },
    /// Re-hash changed files and prune vanished ones
    Refresh,
    /// Copy index entries from a nested or enclosing repository
    Import { source: PathBuf },
    /// Classify paths against the index, writing `<path>.report/`
    Analyze {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Compare access times too
        #[arg(long)]
        include_atime: bool,

        /// Compare change times too
        #[arg(long)]
        include_ctime: bool,

        /// Ignore file ownership
        #[arg(long)]
        exclude_owner: bool,

        /// Ignore file group
        #[arg(long)]
        exclude_group: bool,
    },
    /// Print duplicate records from reports
    Describe {
        paths: Vec<PathBuf>,

        /// Force the directory-level view for paths inside a tree report
        #[arg(long)]
        directory: bool,

        /// Print every record, ignoring the limit
        #[arg(long)]
        all: bool,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long, default_value = "size")]
        sort_by: SortBy,

        #[arg(long, default_value = "dup-size")]
        sort_children: SortChildren,

        #[arg(long)]
        keep_input_order: bool,

        /// Exact byte counts instead of human-readable sizes
        #[arg(long)]
        bytes: bool,

        /// Per-file breakdown under directory reports
        #[arg(long)]
        details: bool,
    },
    /// Join an analyzed tree against a repository directory
    DiffTree {
        analyzed: PathBuf,
        repository_dir: PathBuf,

        #[arg(long)]
        hide_content_match: bool,

        #[arg(long)]
        max_depth: Option<usize>,

        /// Walk without a depth limit
        #[arg(long)]
        unlimited: bool,

        #[arg(long, default_value = "both")]
        show: ShowSide,
    },
    /// Dump the index as text
    Inspect,
}

fn init_logging(cli: &Cli) -> Result<()> {
    let directive = match (&cli.log_level, cli.verbose) {
        (Some(level), _) => level.clone(),
        (None, true) => "debug".into(),
        (None, false) => "warn".into(),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    match &cli.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::stderr)
                .init();
        }
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let root = discover(cli.repository.as_deref())?;
    let stdout = io::stdout();

    match cli.command {
        Command::Rebuild { hash_algorithm } => {
            let repo = Repository::open_for_rebuild(&root, hash_algorithm)?;
            IndexBuilder::new(&repo).rebuild()?;
        }
        Command::Refresh => {
            let repo = Repository::open(&root)?;
            IndexBuilder::new(&repo).refresh()?;
        }
        Command::Import { source } => {
            let repo = Repository::open(&root)?;
            Importer::new(&repo).import(&source)?;
        }
        Command::Analyze {
            paths,
            include_atime,
            include_ctime,
            exclude_owner,
            exclude_group,
        } => {
            let repo = Repository::open(&root)?;
            let policy = MetadataPolicy {
                atime: include_atime,
                ctime: include_ctime,
                owner: !exclude_owner,
                group: !exclude_group,
                ..MetadataPolicy::default()
            };
            let analyzer = Analyzer::new(&repo, policy);
            for path in &paths {
                analyzer.analyze(path)?;
            }
        }
        Command::Describe {
            paths,
            directory,
            all,
            limit,
            sort_by,
            sort_children,
            keep_input_order,
            bytes,
            details,
        } => {
            // reports are read without touching the store, but the
            // truncating gate still applies to every non-rebuild command
            let _repo = Repository::open(&root)?;
            let paths = if paths.is_empty() {
                vec![PathBuf::from(".")]
            } else {
                paths
            };
            let opts = DescribeOptions {
                directory,
                all,
                limit,
                sort_by,
                sort_children,
                keep_input_order,
                bytes,
                details,
            };
            let mut out = stdout.lock();
            describe(&paths, &opts, &mut out)?;
            out.flush()?;
        }
        Command::DiffTree {
            analyzed,
            repository_dir,
            hide_content_match,
            max_depth,
            unlimited,
            show,
        } => {
            let repo = Repository::open(&root)?;
            let opts = DiffTreeOptions {
                hide_content_match,
                max_depth: if unlimited {
                    None
                } else {
                    Some(max_depth.unwrap_or(DEFAULT_MAX_DEPTH))
                },
                show,
            };
            let mut out = stdout.lock();
            diff_tree(&repo, &analyzed, &repository_dir, &opts, &mut out)?;
            out.flush()?;
        }
        Command::Inspect => {
            let repo = Repository::open(&root)?;
            let mut out = stdout.lock();
            inspect(repo.store(), &mut out)?;
            out.flush()?;
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let logging = init_logging(&cli);
    if let Err(err) = logging.and_then(|()| run(cli)) {
        eprintln!("rededup: {err:#}");
        process::exit(exit_code_for(&err));
    }
}
