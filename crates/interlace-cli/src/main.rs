//! CLI for interlace — observe, force and confirm concurrency-bug
//! interleavings.

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "interlace")]
#[command(about = "interlace — expose concurrency bugs by forcing their interleavings")]
#[command(version = interlace_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Knobs shared by every run mode. Flags override the config file.
#[derive(Args)]
struct CommonOpts {
    /// JSON config file; flags below override its fields
    #[arg(long)]
    config: Option<PathBuf>,

    /// Monitoring granularity in bytes
    #[arg(long)]
    unit_size: Option<u64>,

    /// Vulnerability window in dynamic instructions
    #[arg(long)]
    vw: Option<u64>,

    /// Seed for the scheduler's random choices (reproducible runs)
    #[arg(long)]
    seed: Option<u64>,

    /// iRoot database path
    #[arg(long)]
    iroot_db: Option<PathBuf>,

    /// Memoization database path
    #[arg(long)]
    memo_db: Option<PathBuf>,

    /// Shared-instruction database path
    #[arg(long)]
    sinst_db: Option<PathBuf>,

    /// Race database path
    #[arg(long)]
    race_db: Option<PathBuf>,

    /// Test-history file path
    #[arg(long)]
    test_history: Option<PathBuf>,

    /// Static program-info database path
    #[arg(long)]
    static_info_db: Option<PathBuf>,

    /// Write statistics to this file at exit
    #[arg(long)]
    stat_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Observe an event trace and record candidate iRoots
    Profile {
        /// Event trace (JSON lines, one event per line)
        #[arg(long)]
        trace: PathBuf,

        /// Also observe complex idioms (2..5)
        #[arg(long)]
        complex_idioms: bool,

        /// Restrict the complex search to single-variable idioms
        #[arg(long)]
        single_var_idioms: bool,

        /// Observe synchronization events only
        #[arg(long)]
        sync_only: bool,

        /// Record observations as auxiliary (shadow)
        #[arg(long)]
        shadow: bool,

        #[command(flatten)]
        common: CommonOpts,
    },

    /// Actively test one candidate iRoot against an event trace
    Test {
        /// Event trace (JSON lines, one event per line)
        #[arg(long)]
        trace: PathBuf,

        /// Explicit iRoot id to test (0 selects from the memo database)
        #[arg(long, default_value_t = 0)]
        target_iroot: u32,

        /// Restrict selection to one idiom (1..5; 0 = any)
        #[arg(long, default_value_t = 0)]
        target_idiom: u32,

        /// Use nice values instead of real-time FIFO priorities
        #[arg(long)]
        relaxed: bool,

        /// CPU to pin all threads to
        #[arg(long)]
        cpu: Option<usize>,

        /// Do not memoize fail-to-expose outcomes
        #[arg(long)]
        no_memo_failed: bool,

        /// Apply priorities to the OS (requires privileges); without
        /// this, priority commands are computed but not applied
        #[arg(long)]
        apply_priorities: bool,

        #[command(flatten)]
        common: CommonOpts,
    },

    /// Detect happens-before data races over an event trace
    Race {
        /// Event trace (JSON lines, one event per line)
        #[arg(long)]
        trace: PathBuf,

        /// Track potentially racy instructions
        #[arg(long)]
        track_racy_inst: bool,

        #[command(flatten)]
        common: CommonOpts,
    },

    /// Summarize the databases
    Report {
        #[command(flatten)]
        common: CommonOpts,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let outcome = match cli.command {
        Commands::Profile {
            trace,
            complex_idioms,
            single_var_idioms,
            sync_only,
            shadow,
            common,
        } => commands::profile(
            &trace,
            complex_idioms,
            single_var_idioms,
            sync_only,
            shadow,
            &common,
        ),
        Commands::Test {
            trace,
            target_iroot,
            target_idiom,
            relaxed,
            cpu,
            no_memo_failed,
            apply_priorities,
            common,
        } => commands::test(
            &trace,
            target_iroot,
            target_idiom,
            relaxed,
            cpu,
            no_memo_failed,
            apply_priorities,
            &common,
        ),
        Commands::Race {
            trace,
            track_racy_inst,
            common,
        } => commands::race(&trace, track_racy_inst, &common),
        Commands::Report { common } => commands::report(&common),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
