use clap::{Args, Parser, Subcommand};
use tracing::metadata::LevelFilter;

#[derive(Parser, Debug, Clone)]
#[command(name = "nmt_train", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Maximum level of emitted log events
    #[arg(short = 'l', long, global = true, default_value_t = LevelFilter::INFO)]
    pub log_level: LevelFilter,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Stream one epoch of minibatches and report their statistics
    #[command(name = "batches", arg_required_else_help = true)]
    Batches(BatchesConfig),

    /// Compute per-sentence costs of a corpus under a model
    #[command(name = "score", arg_required_else_help = true)]
    Score(ScoreConfig),

    /// Write freshly initialized parameters to a file
    #[command(name = "init", arg_required_else_help = true)]
    Init(InitConfig),
}

#[derive(Args, Debug, Clone)]
pub struct CorpusConfig {
    /// Source side text file, optionally gzipped
    pub source: String,

    /// Target side text file, optionally gzipped
    pub target: String,

    /// Source vocabularies, one per factor
    #[arg(short = 'd', long = "source-dict", required = true, num_args = 1..)]
    pub source_dicts: Vec<String>,

    #[arg(short = 't', long)]
    pub target_dict: String,

    /// JSON model options, defaults used when absent
    #[arg(short = 'c', long, default_value = None)]
    pub config: Option<String>,

    #[arg(short = 'b', long, default_value = None)]
    pub batch_size: Option<usize>,

    #[arg(short = 'm', long, default_value = None)]
    pub maxlen: Option<usize>,

    /// Reshuffle the corpus before every epoch
    #[arg(short = 's', long, default_value_t = false)]
    pub shuffle: bool,
}

#[derive(Args, Debug, Clone)]
pub struct BatchesConfig {
    #[command(flatten)]
    pub corpus: CorpusConfig,

    /// Second source text file, read in lock-step with the first
    #[arg(long, default_value = None)]
    pub source2: Option<String>,

    #[arg(long, default_value = None, requires = "source2")]
    pub align1: Option<String>,

    #[arg(long, default_value = None, requires = "source2")]
    pub align2: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ScoreConfig {
    #[command(flatten)]
    pub corpus: CorpusConfig,

    /// Flat JSON parameter file, a seeded initialization is scored when absent
    #[arg(short = 'p', long, default_value = None)]
    pub params: Option<String>,

    #[arg(long, default_value_t = 1234)]
    pub seed: u64,

    /// Sample dropout masks as during training
    #[arg(long, default_value_t = false)]
    pub training: bool,
}

#[derive(Args, Debug, Clone)]
pub struct InitConfig {
    /// Output path of the flat JSON parameter file
    pub output: String,

    #[arg(short = 'c', long, default_value = None)]
    pub config: Option<String>,

    #[arg(long, default_value_t = 1234)]
    pub seed: u64,

    /// Initialize a dual-source model
    #[arg(long, default_value_t = false)]
    pub dual: bool,
}
