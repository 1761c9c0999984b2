use std::{env, error::Error, path::PathBuf, process, str::FromStr};

use argp::{FromArgs, HelpStyle};
use enable_ansi_support::enable_ansi_support;
use nustool::{run, SubCommand};
use supports_color::Stream;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(FromArgs, Debug)]
/// Tool for inspecting and extracting Wii U NUS packages.
struct TopLevel {
    #[argp(subcommand)]
    command: SubCommand,
    #[argp(option, short = 'C')]
    /// Change working directory.
    chdir: Option<PathBuf>,
    #[argp(option, short = 'L', from_str_fn(parse_level))]
    /// Minimum logging level. (Default: info, env: RUST_LOG)
    /// Possible values: off, error, warn, info, debug, trace
    log_level: Option<LevelFilter>,
    #[argp(switch)]
    /// Disable color output. (env: NO_COLOR)
    no_color: bool,
}

fn parse_level(s: &str) -> Result<LevelFilter, String> {
    LevelFilter::from_str(s).map_err(|_| format!("Invalid log level '{}'", s))
}

fn use_colors(no_color: bool) -> bool {
    if no_color || env::var_os("NO_COLOR").is_some_and(|v| !v.is_empty() && v != "0") {
        return false;
    }
    let _ = enable_ansi_support();
    supports_color::on(Stream::Stdout).is_some_and(|c| c.has_basic)
}

fn init_logging(level: Option<LevelFilter>, ansi: bool) {
    let format =
        tracing_subscriber::fmt::format().with_ansi(ansi).with_target(false).without_time();
    let filter = match level {
        Some(level) => EnvFilter::default().add_directive(level.into()),
        None => EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    };
    tracing_subscriber::fmt().event_format(format).with_env_filter(filter).init();
}

fn main() {
    let args: TopLevel = argp::parse_args_or_exit(&HelpStyle::default());
    init_logging(args.log_level, use_colors(args.no_color));

    let result = match &args.chdir {
        Some(dir) => env::set_current_dir(dir).map_err(|e| {
            nus::Error::Io(format!("Changing working directory to {}", dir.display()), e)
        }),
        None => Ok(()),
    }
    .and_then(|_| run(args.command));
    if let Err(e) = result {
        eprintln!("Failed: {}", e);
        if let Some(source) = e.source() {
            eprintln!("Caused by: {}", source);
        }
        process::exit(e.errno().unsigned_abs().min(255) as i32);
    }
}
