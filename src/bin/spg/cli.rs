use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use clap_verbosity_flag::Verbosity;
use std::path::PathBuf;

const RUN_CAUTION: &str = "\
CAUTION!
1. Invoke the job in the directory where you want the program to run
2. If your program uses -, -- arguments or redirection symbols < or >,
   wrap the program and arguments with quote: ' or \"";

const RUNS_CAUTION: &str = "\
CAUTION!
1. Invoke the job in the directory where you want the program to run
2. If your program uses -, -- arguments or redirection symbols < or >,
   wrap the program and arguments with quote: ' or \"
3. You can assign maximum of 50 jobs at one time.
4. Executed commands will be erased from input command file";

const SCAN_CAUTION: &str = "\
Every command except 'list' scans the target machines anew over SSH.
Narrow the target with -g/-m and avoid running it in a loop.";

const KILL_CAUTION: &str = "\
CAUTION!!
1. Jobs to be killed should satisfy all the given options.
2. When pid is given, only single machine should be specified.
3. When given a multi-process job, this command kills its session leader.
4. When group/machine are both given, group is ignored.";

#[derive(Debug, Parser)]
#[command(
    name = "spg",
    author,
    version = spg::core::version(),
    about = "Monitor, launch and terminate jobs across machine groups"
)]
#[command(styles = spg::utils::STYLES, after_help = SCAN_CAUTION)]
pub struct Spg {
    #[command(subcommand)]
    pub command: Commands,

    /// Do not print the scan progress
    #[arg(short, long)]
    pub silent: bool,

    /// Path to the config file
    #[arg(long, global = true, hide = true)]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub verbosity: Verbosity,
}

#[derive(Debug, Clone, Default, Args)]
pub struct TargetArgs {
    /// Target machine groups
    #[arg(short, long, num_args = 1.., value_name = "GROUP")]
    pub group: Vec<String>,

    /// Target machines. Overrides --group
    #[arg(short, long, num_args = 1.., value_name = "MACHINE")]
    pub machine: Vec<String>,
}

#[derive(Debug, Clone, Default, Args)]
pub struct UserArgs {
    /// Target user name. Defaults to the current user
    #[arg(short, long)]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Default, Args)]
pub struct JobArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    #[command(flatten)]
    pub user: UserArgs,

    /// Jobs of all users
    #[arg(short, long)]
    pub all: bool,

    /// Process ids, e.g. "1234", "1234,1240" or "1230-1240". Needs a single machine
    #[arg(short, long, num_args = 1.., value_name = "PID")]
    pub pid: Vec<String>,

    /// Jobs whose command contains every given word
    #[arg(short, long, num_args = 1.., value_name = "WORD")]
    pub command: Vec<String>,

    /// Jobs running less than the given time, e.g. "1w 5d 11h 50m 1s"
    #[arg(short, long, num_args = 1.., value_name = "TIME")]
    pub time: Vec<String>,

    /// Jobs started at this time. Must match the Start column of 'spg job' exactly
    #[arg(short, long)]
    pub start: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Print information of registered machines
    List(TargetArgs),

    /// Print free compute units and memory
    Free(TargetArgs),

    /// Print running jobs
    Job(JobArgs),

    /// Print job counts per user and group
    User(TargetArgs),

    /// Run a single job on a machine
    #[command(after_help = RUN_CAUTION)]
    Run {
        /// Target machine
        machine: String,

        /// Command to run
        #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Run the commands of a file on free machines of a group
    #[command(after_help = RUNS_CAUTION)]
    Runs {
        /// File containing one command per line
        file: PathBuf,

        /// Target machine group
        group: String,

        /// Only use machines with an id of at least START
        #[arg(requires = "end")]
        start: Option<u32>,

        /// Only use machines with an id of at most END
        end: Option<u32>,

        /// Most commands to dispatch. Defaults to `max_runs` of the config
        #[arg(long = "max", value_name = "N")]
        max: Option<usize>,
    },

    /// Kill jobs
    #[command(name = "KILL", after_help = KILL_CAUTION)]
    Kill {
        #[command(flatten)]
        filter: JobArgs,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Generate shell completion scripts
    Completions {
        /// The shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },

    #[command(hide = true)]
    Machine(TargetArgs),

    #[command(hide = true)]
    Me(TargetArgs),

    #[command(hide = true)]
    All(TargetArgs),

    #[command(name = "kill", hide = true)]
    KillPids {
        machine: String,
        #[arg(required = true)]
        pid: Vec<String>,
    },

    #[command(hide = true)]
    Killall {
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        user: UserArgs,
    },

    #[command(hide = true)]
    Killmachine {
        machine: String,
        #[command(flatten)]
        user: UserArgs,
    },

    #[command(hide = true)]
    Killthis {
        #[arg(required = true)]
        pattern: Vec<String>,
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        user: UserArgs,
    },

    #[command(hide = true)]
    Killbefore {
        #[arg(required = true)]
        time: Vec<String>,
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        user: UserArgs,
    },
}
