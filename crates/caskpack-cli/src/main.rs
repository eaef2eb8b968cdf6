use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

mod command_flows;
mod completion;
mod config;
mod dispatch;
mod render;

#[derive(Parser, Debug)]
#[command(name = "caskpack")]
#[command(about = "Install, upgrade and remove application casks", long_about = None)]
struct Cli {
    /// Installation prefix (defaults to ~/.caskpack).
    #[arg(long, global = true, env = "CASKPACK_PREFIX")]
    prefix: Option<PathBuf>,
    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone, Copy, Default)]
struct GreedyArgs {
    /// Also select casks with version `latest` or `auto_updates true`.
    #[arg(long)]
    greedy: bool,
    /// Also select casks with version `latest`.
    #[arg(long)]
    greedy_latest: bool,
    /// Also select casks with `auto_updates true`.
    #[arg(long)]
    greedy_auto_updates: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Install {
        #[arg(required = true)]
        casks: Vec<String>,
        #[arg(long)]
        force: bool,
    },
    Upgrade {
        casks: Vec<String>,
        #[command(flatten)]
        greedy: GreedyArgs,
        #[arg(long)]
        dry_run: bool,
    },
    Reinstall {
        #[arg(required = true)]
        casks: Vec<String>,
    },
    Uninstall {
        #[arg(required = true)]
        casks: Vec<String>,
        #[arg(long)]
        force: bool,
    },
    List,
    Outdated {
        casks: Vec<String>,
        #[command(flatten)]
        greedy: GreedyArgs,
    },
    Info {
        cask: String,
        #[arg(long)]
        json: bool,
    },
    Tap {
        name: String,
        remote: Option<String>,
    },
    Untap {
        name: String,
    },
    Doctor {
        /// Forget an interrupted upgrade after inspecting it by hand.
        #[arg(long)]
        clear_interrupted: bool,
    },
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CliCompletionShell {
    Bash,
    Zsh,
    Fish,
    Powershell,
}

impl From<CliCompletionShell> for Shell {
    fn from(value: CliCompletionShell) -> Self {
        match value {
            CliCompletionShell::Bash => Shell::Bash,
            CliCompletionShell::Zsh => Shell::Zsh,
            CliCompletionShell::Fish => Shell::Fish,
            CliCompletionShell::Powershell => Shell::PowerShell,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    dispatch::init_logging(cli.verbose);

    match dispatch::run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            render::print_error(&err);
            ExitCode::from(dispatch::exit_code_for(&err))
        }
    }
}
