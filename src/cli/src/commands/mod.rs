//! CLI command definitions and dispatch.

mod build;
mod multi;
mod repl;

use std::path::{Path, PathBuf};

use box_core::config::{cache_enabled, default_cache_dir, parse_vars, BuildConfig, TermFlags};
use box_core::error::BoxError;
use clap::{Args, Parser, Subcommand};

pub use multi::MultiArgs;

/// box - container image builder driven by plan files.
#[derive(Parser)]
#[command(name = "box", version, about, override_usage = "box [OPTIONS] [FILE]\n       box [OPTIONS] <COMMAND>")]
pub struct Cli {
    #[command(flatten)]
    pub flags: BuildFlags,

    /// Plan to build (default: box.plan)
    pub file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Build several plans concurrently
    Multi(MultiArgs),
    /// Evaluate plan statements interactively
    #[command(alias = "shell")]
    Repl,
}

/// Flags shared by every build mode.
#[derive(Args, Debug, Default, Clone)]
pub struct BuildFlags {
    /// Provide a variable to the plan (KEY=VALUE), can be repeated
    #[arg(short = 'v', long = "var", global = true)]
    pub var: Vec<String>,

    /// Disable the build cache
    #[arg(short = 'n', long, global = true)]
    pub no_cache: bool,

    /// Disable colors this run
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Force colors this run
    #[arg(long, global = true)]
    pub force_color: bool,

    /// Disable TTY features this run
    #[arg(long, global = true)]
    pub no_tty: bool,

    /// Force TTY features this run
    #[arg(long, global = true)]
    pub force_tty: bool,

    /// Tag the last image with this name
    #[arg(short = 't', long, global = true)]
    pub tag: Option<String>,

    /// Omit a verb from the plan language, can be repeated
    #[arg(short = 'o', long, global = true)]
    pub omit: Vec<String>,

    /// Do not trim output to the terminal width
    #[arg(long, global = true)]
    pub no_trim: bool,
}

impl BuildFlags {
    /// Resolve the flags into the configuration for one plan.
    pub fn build_config(&self, file: &Path, is_terminal: bool) -> Result<BuildConfig, BoxError> {
        let (tty, color) = TermFlags {
            no_tty: self.no_tty,
            force_tty: self.force_tty,
            no_color: self.no_color,
            force_color: self.force_color,
        }
        .resolve(is_terminal);

        let cache = cache_enabled(self.no_cache);

        Ok(BuildConfig {
            file_name: file.to_path_buf(),
            vars: parse_vars(&self.var)?,
            cache,
            omit: self.omit.clone(),
            show_run: true,
            color,
            tty,
            trim: !self.no_trim,
            cache_dir: cache.then(default_cache_dir),
        })
    }
}

/// Unrecoverable fault inside the evaluator. Exits with status 2.
#[derive(Debug)]
pub struct InternalFault(pub String);

impl std::fmt::Display for InternalFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Aborting due to interpreter error: {}", self.0)
    }
}

impl std::error::Error for InternalFault {}

/// Process exit status for a top-level error: 2 for internal faults, 1 otherwise.
pub fn exit_code(err: &(dyn std::error::Error + 'static)) -> i32 {
    if err.is::<InternalFault>() {
        2
    } else {
        1
    }
}

/// Cancellation is reported by the interrupt itself, not as an error line.
pub fn is_cancelled(err: &(dyn std::error::Error + 'static)) -> bool {
    err.downcast_ref::<BoxError>()
        .map(|e| e.is_cancelled())
        .unwrap_or(false)
}

/// `sha256:abcd` -> `abcd`
pub(crate) fn strip_algorithm(image: &str) -> &str {
    image.split_once(':').map(|(_, id)| id).unwrap_or(image)
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Some(Command::Multi(args)) => multi::execute(args, &cli.flags).await,
        Some(Command::Repl) => repl::execute(&cli.flags).await,
        None => build::execute(cli.file, &cli.flags).await,
    }
}
