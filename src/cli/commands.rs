//! CLI command definitions

use crate::execution::SchedulingStrategy;
use clap::Args;

/// Run a plan
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to plan YAML file
    #[arg(short, long)]
    pub file: String,

    /// Scheduling strategy (overrides the plan's engine section)
    #[arg(long, value_enum)]
    pub strategy: Option<SchedulingStrategyArg>,

    /// SQLite database for execution history (defaults to the user data dir)
    #[arg(long)]
    pub db: Option<String>,

    /// Don't save execution to history
    #[arg(long)]
    pub no_history: bool,

    /// Expire the plan execution after this many seconds
    #[arg(long, default_value_t = 60)]
    pub timeout_secs: u64,
}

/// Validate a plan configuration
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to plan YAML file
    #[arg(short, long)]
    pub file: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show execution history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// SQLite database for execution history (defaults to the user data dir)
    #[arg(long)]
    pub db: Option<String>,

    /// Plan id to filter by
    #[arg(short, long)]
    pub plan: Option<String>,

    /// Number of recent executions to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Show the node executions of a specific plan execution
    #[arg(long)]
    pub execution_id: Option<String>,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Scheduling strategy argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SchedulingStrategyArg {
    Inline,
    Spawned,
}

impl From<SchedulingStrategyArg> for SchedulingStrategy {
    fn from(arg: SchedulingStrategyArg) -> Self {
        match arg {
            SchedulingStrategyArg::Inline => SchedulingStrategy::Inline,
            SchedulingStrategyArg::Spawned => SchedulingStrategy::Spawned,
        }
    }
}
