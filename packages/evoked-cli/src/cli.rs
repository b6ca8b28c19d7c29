use clap::{Args, Parser, Subcommand, ValueEnum};
use evoked_rt::AverageMode;

#[derive(Parser)]
#[command(
    name = "evoked",
    version,
    about = "Real-time evoked averaging command-line tool",
    long_about = "Drive the real-time evoked averaging engine.\n\
                  `simulate` runs the engine on a synthetic stimulus paradigm and prints\n\
                  the resulting evoked average as JSON."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the engine on synthetic stimulus-locked data
    Simulate(SimulateArgs),
    /// Print the default averaging configuration
    Defaults(DefaultsArgs),
    /// Validate an averaging configuration file
    Validate(ValidateArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum ModeArg {
    Running,
    Cumulative,
}

impl From<ModeArg> for AverageMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Running => AverageMode::Running,
            ModeArg::Cumulative => AverageMode::Cumulative,
        }
    }
}

#[derive(Args)]
pub struct SimulateArgs {
    /// Averaging configuration JSON (channel layout must match the synthetic source)
    #[arg(long)]
    pub config: Option<String>,

    /// Number of data channels (a trigger channel is added)
    #[arg(long, default_value_t = 4)]
    pub channels: usize,

    /// Sampling rate in Hz
    #[arg(long, default_value_t = 1000.0)]
    pub sr: f64,

    /// Number of blocks to generate
    #[arg(long, default_value_t = 200)]
    pub blocks: usize,

    /// Samples per block
    #[arg(long, default_value_t = 100)]
    pub block_size: usize,

    /// Samples between stimuli
    #[arg(long, default_value_t = 700)]
    pub interval: usize,

    /// Half-width of the uniform background noise
    #[arg(long, default_value_t = 2.0)]
    pub noise: f64,

    /// Inject a large spike into every n-th response
    #[arg(long)]
    pub artifact_every: Option<usize>,

    /// Random seed
    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// Averaging mode
    #[arg(long, value_enum)]
    pub mode: Option<ModeArg>,

    /// Number of averages
    #[arg(long)]
    pub averages: Option<u32>,

    /// Pre-stimulus length in milliseconds
    #[arg(long)]
    pub pre_ms: Option<f64>,

    /// Post-stimulus length in milliseconds
    #[arg(long)]
    pub post_ms: Option<f64>,

    /// Enable baseline correction
    #[arg(long, default_value_t = false)]
    pub baseline: bool,

    /// Baseline start in milliseconds relative to the trigger (default: epoch start)
    #[arg(long, allow_hyphen_values = true)]
    pub baseline_from_ms: Option<f64>,

    /// Baseline end in milliseconds relative to the trigger (default: 0)
    #[arg(long, allow_hyphen_values = true)]
    pub baseline_to_ms: Option<f64>,

    /// Reject epochs whose absolute peak exceeds this value
    #[arg(long)]
    pub artifact_threshold: Option<f64>,

    /// Trigger threshold
    #[arg(long)]
    pub threshold: Option<f64>,

    /// Sample buffer capacity in blocks
    #[arg(long, env = "EVOKED_BUFFER_CAPACITY", default_value_t = 64)]
    pub buffer_capacity: usize,

    /// Include every intermediate evoked result, not only the last
    #[arg(long, default_value_t = false)]
    pub all: bool,

    /// Output file (default: stdout)
    #[arg(short, long)]
    pub output: Option<String>,

    /// Compact JSON output (no indentation)
    #[arg(long, default_value_t = false)]
    pub compact: bool,

    /// Suppress progress messages on stderr
    #[arg(long, default_value_t = false)]
    pub quiet: bool,
}

#[derive(Args)]
pub struct DefaultsArgs {
    /// Number of data channels (a trigger channel is added)
    #[arg(long, default_value_t = 4)]
    pub channels: usize,

    /// Output file (default: stdout)
    #[arg(short, long)]
    pub output: Option<String>,

    /// Compact JSON output (no indentation)
    #[arg(long, default_value_t = false)]
    pub compact: bool,
}

#[derive(Args)]
pub struct ValidateArgs {
    /// Averaging configuration JSON file
    #[arg(long)]
    pub file: String,

    /// Output as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}
