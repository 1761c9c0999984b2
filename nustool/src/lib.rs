use argp::FromArgs;

pub mod cmd;
pub(crate) mod util;

#[derive(FromArgs, Debug)]
#[argp(subcommand)]
pub enum SubCommand {
    Info(cmd::info::Args),
    Ls(cmd::ls::Args),
    Extract(cmd::extract::Args),
}

pub fn run(command: SubCommand) -> nus::Result<()> {
    match command {
        SubCommand::Info(c_args) => cmd::info::run(c_args),
        SubCommand::Ls(c_args) => cmd::ls::run(c_args),
        SubCommand::Extract(c_args) => cmd::extract::run(c_args),
    }
}
