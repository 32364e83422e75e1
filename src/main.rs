//! Shipflow - linear-history git workflow engine.
//!
//! Launch branches, ship them through pull requests and move between
//! in-progress work without losing changes.

use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use shipflow::core::{CancelToken, Config};
use shipflow::git::{self, CliGit, HooksInspector, RepoLocation};
use shipflow::platform::{RemotePlatform, Unconfigured};
use shipflow::session::SessionRepository;
use shipflow::workflow::{
    AbortOptions, AbortReport, CheckStatus, CleanupReport, Engine, LaunchReport, Operation,
    Outcome, SessionSummary, ShipOptions, ShipReport, ShipStatus, SwapReport, SwitchReport,
};
use shipflow::WorkflowError;

/// Linear-history git workflow engine
#[derive(Parser)]
#[command(name = "shipflow")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a branch from the protected branch and start a session
    Launch {
        /// What the work is about; used to derive the branch name
        description: Option<String>,

        /// Explicit branch name
        #[arg(short, long)]
        branch: Option<String>,
    },

    /// Like launch, on the shorter hotfix path (no approval gate)
    Hotfix {
        /// What the fix is about; used to derive the branch name
        description: Option<String>,

        /// Explicit branch name
        #[arg(short, long)]
        branch: Option<String>,
    },

    /// Commit, push, open a pull request, wait for checks and merge
    Ship {
        /// Merge without stopping at the approval gate
        #[arg(short = 'y', long, alias = "confirm")]
        yes: bool,
    },

    /// Park the current changes and move to another branch
    Swap {
        /// Branch to move to (launched if it has no session)
        branch: String,
    },

    /// Carry the current changes to a new branch and retire this session
    Switch {
        /// New branch name
        branch: String,
    },

    /// End a session without merging
    Abort {
        /// Branch whose session to abort (default: current branch)
        branch: Option<String>,

        /// Also delete the branch locally and on the remote
        #[arg(long)]
        delete_branch: bool,

        /// Stash uncommitted changes before leaving the branch
        #[arg(long)]
        stash: bool,
    },

    /// List sessions
    Sessions {
        /// Include finished and aborted sessions
        #[arg(short, long)]
        all: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Remove expired sessions, old finished sessions and stale locks
    Cleanup,

    /// Manage the protected-branch git hook
    Hooks {
        #[command(subcommand)]
        operation: HooksOperation,
    },

    /// Show configuration
    Config {
        /// Show config file path
        #[arg(long)]
        path: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum HooksOperation {
    /// Install a pre-push hook that blocks pushes to the protected branch
    Install {
        /// Overwrite an existing hook
        #[arg(short, long)]
        force: bool,
    },

    /// Remove the shipflow-managed hook
    Uninstall,

    /// Show which checked hooks are present
    Status,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose { EnvFilter::new("debug") } else { EnvFilter::new("warn") };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(io::stderr))
        .with(filter)
        .init();

    if let Err(e) = dotenvy::dotenv() {
        tracing::debug!("no .env loaded: {e}");
    }

    match cli.command {
        Commands::Launch { description, branch } => {
            run(Operation::Launch { description, branch }, cli.verbose)?;
        }
        Commands::Hotfix { description, branch } => {
            run(Operation::Hotfix { description, branch }, cli.verbose)?;
        }
        Commands::Ship { yes } => {
            run(Operation::Ship(ShipOptions { confirm: yes }), cli.verbose)?;
        }
        Commands::Swap { branch } => {
            run(Operation::Swap { branch }, cli.verbose)?;
        }
        Commands::Switch { branch } => {
            run(Operation::Switch { branch }, cli.verbose)?;
        }
        Commands::Abort { branch, delete_branch, stash } => {
            run(Operation::Abort(AbortOptions { branch, delete_branch, stash }), cli.verbose)?;
        }
        Commands::Sessions { all, format } => {
            cmd_sessions(all, format, cli.verbose)?;
        }
        Commands::Cleanup => {
            run(Operation::Cleanup, cli.verbose)?;
        }
        Commands::Hooks { operation } => {
            cmd_hooks(operation)?;
        }
        Commands::Config { path } => {
            cmd_config(path)?;
        }
        Commands::Completions { shell } => {
            cmd_completions(shell);
        }
    }

    Ok(())
}

/// Repository location plus the configuration that applies to it.
fn open_workspace() -> Result<(RepoLocation, Config)> {
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    let location = git::discover(&cwd, "origin").context("Not in a Git repository")?;
    let config = Config::load(&location.root)?;
    let location = if config.general.remote == "origin" {
        location
    } else {
        git::discover(&cwd, &config.general.remote)?
    };
    Ok((location, config))
}

fn build_engine(location: &RepoLocation, config: Config) -> Engine {
    let repo = SessionRepository::open(config.data_dir(&location.git_dir));
    let platform = remote_platform(&config, location.remote_url.as_deref());
    let cancel = CancelToken::install_ctrlc().unwrap_or_else(|e| {
        tracing::debug!("Ctrl-C handler not installed: {e}");
        CancelToken::new()
    });

    Engine::new(config, repo, Box::new(CliGit::new(&location.root)), platform)
        .with_cancel(cancel)
        .with_hooks(HooksInspector::new(&location.git_dir))
}

#[cfg(feature = "github")]
fn remote_platform(config: &Config, remote_url: Option<&str>) -> Box<dyn RemotePlatform> {
    use shipflow::platform::GitHubPlatform;

    match GitHubPlatform::from_env(remote_url, config.request_timeout()) {
        Ok(platform) => Box::new(platform.with_poll_interval(config.poll_interval())),
        Err(e) => {
            tracing::debug!("GitHub not configured: {e}");
            Box::new(Unconfigured::new(e.to_string()))
        }
    }
}

#[cfg(not(feature = "github"))]
fn remote_platform(_config: &Config, _remote_url: Option<&str>) -> Box<dyn RemotePlatform> {
    Box::new(Unconfigured::new("built without the github feature"))
}

/// Run an orchestrated operation and print its outcome.
fn run(operation: Operation, verbose: bool) -> Result<()> {
    let (location, config) = open_workspace()?;
    let engine = build_engine(&location, config);

    let outcome = engine.execute(operation).map_err(with_hint)?;
    match outcome {
        Outcome::Launched(report) => print_launch(&report),
        Outcome::Shipped(report) => print_ship(&report),
        Outcome::Swapped(report) => print_swap(&report),
        Outcome::Switched(report) => print_switch(&report),
        Outcome::Aborted(report) => print_abort(&report),
        Outcome::Sessions(sessions) => print_sessions(&sessions, verbose),
        Outcome::Cleaned(report) => print_cleanup(&report),
    }
    Ok(())
}

/// Attach the recovery hint to an error for display.
fn with_hint(err: WorkflowError) -> anyhow::Error {
    match err.recovery_hint() {
        Some(hint) => anyhow::anyhow!("{err}\n\n{hint}"),
        None => err.into(),
    }
}

fn print_launch(report: &LaunchReport) {
    let session = &report.session;
    println!("✓ Launched {} ({} session {})", session.branch_name, session.workflow_type, session.short_id());
    if !report.branch_created {
        println!("  Continuing on an existing branch");
    }
    if report.stash_applied {
        println!("  Uncommitted changes carried over");
    }
    for warning in &report.warnings {
        println!("⚠ {warning}");
    }
}

fn print_ship(report: &ShipReport) {
    for check in &report.preflight.checks {
        if check.status != CheckStatus::Pass {
            println!("{check}");
        }
    }

    let branch = &report.session.branch_name;
    match report.status {
        ShipStatus::AwaitingConfirmation => {
            if let Some(pr) = &report.pull_request {
                println!("✓ Checks passed on PR #{} ({})", pr.number, pr.url);
            }
            println!("Run 'shipflow ship --yes' to merge {branch}.");
        }
        ShipStatus::Completed => {
            if report.merged_externally {
                println!("✓ {branch} was already merged; cleaned up");
            } else if let Some(pr) = &report.pull_request {
                println!("✓ Shipped {branch} in PR #{} ({})", pr.number, pr.url);
            } else {
                println!("✓ Shipped {branch}");
            }
            for issue in &report.postflight {
                println!("⚠ {issue}");
            }
        }
    }
}

fn print_swap(report: &SwapReport) {
    if let Some(stash) = &report.stashed {
        println!("  Parked changes in {stash}");
    }
    let verb = if report.launched { "Launched" } else { "Swapped to" };
    println!("✓ {verb} {} ({})", report.target.branch_name, report.target.current_state);
    if report.restored {
        println!("  Restored parked changes");
    }
}

fn print_switch(report: &SwitchReport) {
    let target = &report.target.session;
    println!("✓ Switched to {} ({})", target.branch_name, target.current_state);
    if report.carried.is_some() {
        println!("  Uncommitted changes carried over");
    }
    println!("  Retired session for {}", report.origin.branch_name);
}

fn print_abort(report: &AbortReport) {
    println!("✓ Aborted session for {}", report.session.branch_name);
    if let Some(stash) = &report.stash {
        println!("  Changes saved in stash '{stash}'");
    }
    if report.branch_deleted {
        println!("  Deleted branch {}", report.session.branch_name);
    }
}

fn print_cleanup(report: &CleanupReport) {
    if report.total() == 0 {
        println!("Nothing to clean up.");
        return;
    }
    println!(
        "✓ Removed {} expired, {} finished sessions and {} stale locks",
        report.expired, report.terminal, report.orphaned_locks
    );
    for stash in &report.abandoned_stashes {
        println!("⚠ Expired session left changes in stash '{stash}' (see 'git stash list')");
    }
}

/// List sessions.
fn cmd_sessions(all: bool, format: OutputFormat, verbose: bool) -> Result<()> {
    let (location, config) = open_workspace()?;
    let engine = build_engine(&location, config);
    let sessions = engine.sessions(all);

    if format == OutputFormat::Json {
        let rows: Vec<_> = sessions
            .iter()
            .map(|s| {
                serde_json::json!({
                    "session": s.session,
                    "locked_by": s.lock.as_ref().map(|l| l.holder_pid),
                    "allowed_actions": s.allowed_actions.iter().map(ToString::to_string).collect::<Vec<_>>(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    print_sessions(&sessions, verbose);
    if verbose {
        print_working_tree(&location);
    }
    Ok(())
}

fn print_sessions(sessions: &[SessionSummary], verbose: bool) {
    if sessions.is_empty() {
        println!("No active sessions.");
        return;
    }

    for summary in sessions {
        let session = &summary.session;
        let lock = summary.lock.as_ref().map(|l| format!(" [locked by pid {}]", l.holder_pid)).unwrap_or_default();
        println!(
            "  {} {:<40} {:<18} {}{lock}",
            session.short_id(),
            session.branch_name,
            session.current_state,
            session.workflow_type
        );

        if verbose {
            if let Some(pr) = &session.metadata.pull_request {
                println!("      PR #{} ({}) {}", pr.number, pr.state, pr.url);
            }
            if let Some(stash) = &session.metadata.stash {
                println!("      stash: {}", stash.stash_ref);
            }
            let actions: Vec<_> = summary.allowed_actions.iter().map(ToString::to_string).collect();
            println!("      next: {}", actions.join(", "));
            println!("      expires: {}", session.expires_at.format("%Y-%m-%d"));
            for step in &session.state_history {
                println!(
                    "      {} {} -> {} ({})",
                    step.timestamp.format("%Y-%m-%d %H:%M"),
                    step.from,
                    step.to,
                    step.trigger
                );
            }
        }
    }
}

#[cfg(feature = "git")]
fn print_working_tree(location: &RepoLocation) {
    use shipflow::git::GitRepository;

    if let Some(repo) = GitRepository::discover(&location.root) {
        let (staged, unstaged, untracked) = repo.status_counts();
        println!("\nWorking tree: {staged} staged, {unstaged} unstaged, {untracked} untracked");
    }
}

#[cfg(not(feature = "git"))]
fn print_working_tree(_location: &RepoLocation) {}

/// Handle hook commands.
fn cmd_hooks(operation: HooksOperation) -> Result<()> {
    let (location, config) = open_workspace()?;
    let hooks = HooksInspector::new(&location.git_dir);

    match operation {
        HooksOperation::Install { force } => {
            let path = hooks.install_guard(&config.general.protected_branch, force)?;
            println!("Installed pre-push guard: {}", path.display());
        }
        HooksOperation::Uninstall => {
            if hooks.uninstall_guard()? {
                println!("Removed shipflow pre-push guard");
            } else {
                println!("No shipflow-managed hook installed.");
            }
        }
        HooksOperation::Status => {
            println!("Hooks in {}:\n", hooks.hooks_dir().display());
            for name in git::hooks::CHECKED_HOOKS {
                match hooks.hook(name) {
                    Some(info) => {
                        let managed = if info.is_managed { " (shipflow)" } else { "" };
                        let exec = if info.is_executable { "" } else { " [not executable]" };
                        println!("  ✓ {name}{managed}{exec}");
                    }
                    None => println!("  ✗ {name}"),
                }
            }
        }
    }

    Ok(())
}

/// Show configuration.
fn cmd_config(show_path: bool) -> Result<()> {
    let root = match open_workspace() {
        Ok((location, _)) => location.root,
        Err(_) => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    };

    if show_path {
        match Config::find_file(&root).or_else(|| Config::config_dir().map(|d| d.join("config.toml"))) {
            Some(path) => println!("{}", path.display()),
            None => println!("No configuration directory available"),
        }
        return Ok(());
    }

    let config = Config::load(&root)?;
    println!("{}", config.to_toml()?);
    Ok(())
}

/// Generate shell completions.
fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "shipflow", &mut io::stdout());
}
