use clap::{Parser, Subcommand, ValueEnum};
use num_bigint::BigUint;
use num_traits::ToPrimitive;
use slot_finder::shard::existing_shard_paths;
use slot_finder::{
    run_sharded, AcceptAll, Bip39Checksum, CheckpointStore, ChecksumMode, CombinationIndexer,
    CommandOracle, Progress, RetryingOracle, SearchConfig, SearchDriver, SearchError, StopHandle,
    Template, Validate, Validator, Vocabulary,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "slot-finder")]
#[command(about = "Exhaustively fill unknown slots of a token sequence, resumably", long_about = None)]
struct Cli {
    #[arg(short, long, global = true, help = "Enable debug logging")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ChecksumArg {
    None,
    Bip39,
}

impl From<ChecksumArg> for ChecksumMode {
    fn from(arg: ChecksumArg) -> Self {
        match arg {
            ChecksumArg::None => ChecksumMode::None,
            ChecksumArg::Bip39 => ChecksumMode::Bip39,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Search (or resume searching) every combination of the free slots")]
    Search {
        #[arg(long, help = "Configuration file (JSON) - CLI options override its values")]
        config: Option<String>,

        #[arg(short = 'w', long, help = "Vocabulary file, one token per line")]
        vocabulary: Option<PathBuf>,

        #[arg(short, long, help = "Template, e.g. \"apple ? river ?\" (? marks an unknown slot)")]
        template: Option<String>,

        #[arg(short, long, help = "Attempt ledger file")]
        ledger_file: Option<PathBuf>,

        #[arg(short = 'f', long, help = "Checkpoint file")]
        checkpoint_file: Option<PathBuf>,

        #[arg(long, help = "File receiving every confirmed match")]
        found_file: Option<PathBuf>,

        #[arg(short = 'c', long, help = "Save a checkpoint every N seconds")]
        checkpoint_interval: Option<u64>,

        #[arg(short, long, help = "Report progress every N indices")]
        progress_interval: Option<u64>,

        #[arg(short = 'j', long, help = "Number of parallel workers")]
        workers: Option<usize>,

        #[arg(long, help = "Stop at the first confirmed match")]
        stop_on_first_match: bool,

        #[arg(long, value_enum, help = "Local well-formedness check")]
        checksum: Option<ChecksumArg>,

        #[arg(long, help = "Oracle timeout in milliseconds")]
        oracle_timeout_ms: Option<u64>,

        #[arg(long, help = "Retries for failed oracle calls")]
        oracle_retries: Option<u32>,

        #[arg(long, help = "Delete existing ledger and checkpoint before starting")]
        force_restart: bool,

        #[arg(
            last = true,
            required = true,
            help = "Oracle program and arguments; receives the candidate on stdin, exit 0 = match"
        )]
        oracle: Vec<String>,
    },

    #[command(about = "Show a saved checkpoint")]
    Status {
        #[arg(help = "Checkpoint file", default_value = "checkpoint.json")]
        checkpoint_file: PathBuf,
    },

    #[command(about = "Print the candidate for a given index")]
    Decode {
        #[arg(help = "Vocabulary file")]
        vocabulary: PathBuf,

        #[arg(help = "Template")]
        template: String,

        #[arg(help = "Combination index")]
        index: String,
    },

    #[command(about = "Print the size of the search space")]
    Space {
        #[arg(help = "Vocabulary file")]
        vocabulary: PathBuf,

        #[arg(help = "Template")]
        template: String,
    },

    #[command(about = "Generate a default search configuration file")]
    InitConfig {
        #[arg(help = "Output file path (default: search_config.json)")]
        output: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Search {
            config,
            vocabulary,
            template,
            ledger_file,
            checkpoint_file,
            found_file,
            checkpoint_interval,
            progress_interval,
            workers,
            stop_on_first_match,
            checksum,
            oracle_timeout_ms,
            oracle_retries,
            force_restart,
            oracle,
        } => {
            let mut search_config = match config {
                Some(path) => match SearchConfig::load_from_file(Path::new(&path)) {
                    Ok(c) => c,
                    Err(e) => {
                        eprintln!("Error: Failed to load config '{}': {}", path, e);
                        std::process::exit(1);
                    }
                },
                None => SearchConfig::default(),
            };

            if let Some(v) = vocabulary {
                search_config.vocabulary_file = v;
            }
            if let Some(t) = template {
                search_config.template = t;
            }
            if let Some(l) = ledger_file {
                search_config.ledger_file = l;
            }
            if let Some(c) = checkpoint_file {
                search_config.checkpoint_file = c;
            }
            if found_file.is_some() {
                search_config.found_file = found_file;
            }
            if let Some(c) = checkpoint_interval {
                search_config.checkpoint_interval_secs = c;
            }
            if let Some(p) = progress_interval {
                search_config.progress_interval = p;
            }
            if let Some(w) = workers {
                search_config.workers = w;
            }
            if stop_on_first_match {
                search_config.stop_on_first_match = true;
            }
            if let Some(c) = checksum {
                search_config.checksum = c.into();
            }
            if let Some(t) = oracle_timeout_ms {
                search_config.oracle_timeout_ms = t;
            }
            if let Some(r) = oracle_retries {
                search_config.oracle_retries = r;
            }

            let Some((program, args)) = oracle.split_first() else {
                eprintln!("Error: No oracle command given");
                std::process::exit(1);
            };
            if let Err(e) = run_search(&search_config, program, args, force_restart) {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Status { checkpoint_file } => show_status(&checkpoint_file),
        Commands::Decode {
            vocabulary,
            template,
            index,
        } => decode_index(&vocabulary, &template, &index),
        Commands::Space {
            vocabulary,
            template,
        } => show_space(&vocabulary, &template),
        Commands::InitConfig { output } => {
            init_config_file(output.as_deref().unwrap_or("search_config.json"));
        }
    }
}

fn load_indexer(vocabulary: &Path, template: &str) -> Result<CombinationIndexer, SearchError> {
    let vocabulary = Vocabulary::load(vocabulary)?;
    let template = Template::parse(template)?;
    CombinationIndexer::checked(vocabulary, template)
}

fn load_indexer_or_exit(vocabulary: &Path, template: &str) -> CombinationIndexer {
    match load_indexer(vocabulary, template) {
        Ok(indexer) => indexer,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn remove_state(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            eprintln!("Warning: Could not delete {}: {}", path.display(), e);
        }
    }
}

fn run_search(
    config: &SearchConfig,
    program: &str,
    args: &[String],
    force_restart: bool,
) -> Result<(), SearchError> {
    let indexer = load_indexer(&config.vocabulary_file, &config.template)?;

    if force_restart {
        println!("Deleting existing search state (--force-restart)...\n");
        remove_state(&config.ledger_file);
        remove_state(&config.checkpoint_file);
        for path in existing_shard_paths(&config.ledger_file)
            .into_iter()
            .chain(existing_shard_paths(&config.checkpoint_file))
        {
            remove_state(&path);
        }
    }

    let oracle = RetryingOracle::new(
        CommandOracle::new(program, args.to_vec(), config.oracle_timeout()),
        config.oracle_retries,
        Duration::from_millis(250),
    );

    let validator: Box<dyn Validate> = match config.checksum {
        ChecksumMode::None => Box::new(Validator::new(AcceptAll, oracle)),
        ChecksumMode::Bip39 => {
            let checker = Bip39Checksum::new(indexer.vocabulary().clone()).ok_or_else(|| {
                SearchError::ParameterMismatch {
                    field: "vocabulary_size",
                    expected: "2048".to_string(),
                    found: indexer.vocabulary().len().to_string(),
                }
            })?;
            if !Bip39Checksum::is_valid_length(indexer.template().len()) {
                return Err(SearchError::InvalidTemplate(format!(
                    "bip39 checksum needs 12, 15, 18, 21 or 24 words, got {}",
                    indexer.template().len()
                )));
            }
            Box::new(Validator::new(checker, oracle))
        }
    };

    let stop = StopHandle::new();
    let handler_stop = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("\nStop requested, finishing current candidate...");
        handler_stop.request_stop();
    }) {
        eprintln!("Warning: Could not install Ctrl-C handler: {}", e);
    }

    println!("========================================");
    println!("  SLOT SEARCH");
    println!("========================================");
    println!("Template: {}", indexer.template());
    println!("Vocabulary: {} tokens", indexer.vocabulary().len());
    println!("Free slots: {:?}", indexer.template().free_positions());
    println!("Search space: {}", indexer.space_size());
    println!("Workers: {}", config.workers.max(1));
    println!("Ledger file: {}", config.ledger_file.display());
    println!(
        "Checkpoint file: {} (every {}s)",
        config.checkpoint_file.display(),
        config.checkpoint_interval_secs
    );
    println!("========================================\n");

    let options = config.driver_options();

    if config.workers <= 1 {
        let mut driver =
            SearchDriver::new(&indexer, validator.as_ref(), options).with_stop_handle(stop);
        let outcome = driver.run(|p| print_progress(None, p))?;

        print_summary(
            &outcome.state.total_attempts,
            &outcome.state.found,
            outcome.elapsed,
            outcome.is_complete(),
        );
        println!("  Validated this run: {}", outcome.state.validated);
        println!("  Skipped (already attempted): {}", outcome.state.skipped);
        if outcome.state.malformed > 0 {
            println!("  Rejected by checksum: {}", outcome.state.malformed);
        }
        if outcome.state.oracle_failures > 0 {
            println!("  Oracle failures (treated as no match): {}", outcome.state.oracle_failures);
        }
        if outcome.state.persistence_failures > 0 {
            println!(
                "  ⚠️  Persistence failures: {} (resume may repeat work)",
                outcome.state.persistence_failures
            );
        }
    } else {
        let outcome = run_sharded(
            &indexer,
            validator.as_ref(),
            &options,
            config.workers,
            stop,
            |shard, p| print_progress(Some(shard), p),
        )?;
        let complete = outcome.phase == slot_finder::DriverPhase::Completed;
        print_summary(&outcome.total_attempts(), outcome.found(), outcome.elapsed, complete);
        println!("  Covered prefix: {}", outcome.checkpoint.total_attempts);
        if outcome.persistence_failures > 0 {
            println!(
                "  ⚠️  Persistence failures: {} (resume may repeat work)",
                outcome.persistence_failures
            );
        }
    }

    Ok(())
}

fn print_progress(shard: Option<usize>, progress: &Progress) {
    let prefix = match shard {
        Some(id) => format!("[Shard {}]", id),
        None => "[Search]".to_string(),
    };
    let secs = progress.elapsed.as_secs_f64();
    let rate = if secs > 0.0 {
        progress.processed.to_f64().unwrap_or(0.0) / secs
    } else {
        0.0
    };
    println!(
        "{} {}/{} ({:.4}%) | Matches: {} | Time: {:.1}s | {:.0}/s{}",
        prefix,
        progress.processed,
        progress.total,
        progress.fraction * 100.0,
        progress.valid_count,
        secs,
        rate,
        if progress.checkpointed { " | ✓ Checkpoint saved" } else { "" }
    );
}

fn print_summary(total_attempts: &BigUint, found: &[String], elapsed: Duration, complete: bool) {
    println!("\n========================================");
    if complete {
        println!("  SEARCH COMPLETE");
    } else {
        println!("  SEARCH STOPPED (resumable)");
    }
    println!("========================================");
    println!("  Total attempts: {}", total_attempts);
    println!("  Matches found: {}", found.len());
    println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
    if !found.is_empty() {
        println!("\nMatches:");
        for candidate in found {
            println!("  - {}", candidate);
        }
    }
}

fn show_status(checkpoint_file: &Path) {
    match CheckpointStore::new(checkpoint_file).load() {
        Ok(Some(checkpoint)) => checkpoint.display_info(),
        Ok(None) => {
            eprintln!("Error: No checkpoint at {}", checkpoint_file.display());
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Error: Failed to load checkpoint: {}", e);
            std::process::exit(1);
        }
    }
}

fn decode_index(vocabulary: &Path, template: &str, index: &str) {
    let indexer = load_indexer_or_exit(vocabulary, template);
    let index: BigUint = match index.parse() {
        Ok(n) => n,
        Err(_) => {
            eprintln!("Error: Invalid index '{}'", index);
            std::process::exit(1);
        }
    };
    match indexer.encode(&index) {
        Some(candidate) => println!("{}", candidate),
        None => {
            eprintln!(
                "Error: Index {} outside search space of {}",
                index,
                indexer.space_size()
            );
            std::process::exit(1);
        }
    }
}

fn show_space(vocabulary: &Path, template: &str) {
    let indexer = load_indexer_or_exit(vocabulary, template);
    println!("Vocabulary size: {}", indexer.vocabulary().len());
    println!("Free slots: {}", indexer.template().free_count());
    println!("Search space: {}", indexer.space_size());
}

fn init_config_file(output: &str) {
    let config = SearchConfig::default();

    match config.save_to_file(Path::new(output)) {
        Ok(_) => {
            println!("✅ Configuration file created: {}", output);
            println!("\nEdit vocabulary_file and template, then run:");
            println!("  slot-finder search --config {} -- <oracle command>", output);
        }
        Err(e) => {
            eprintln!("Error: Failed to create config file: {}", e);
            std::process::exit(1);
        }
    }
}
