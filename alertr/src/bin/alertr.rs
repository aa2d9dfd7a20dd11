use clap::Parser;
use color_eyre::Result;

use alertr::cli::{CliArguments, SubCommand};
use alertr::{node, server};

/// This is the main entry point of alertr.
///
/// At first we do some basic setup:
/// - Parse the cli
/// - Initialize logging
///
/// Afterwards, either the server is started or a node command is executed.
fn main() -> Result<()> {
    let opt = CliArguments::parse();

    // Init the logger and set the verbosity level depending on the `-v` flags.
    alertr::tracing::install_tracing(opt.verbose)?;
    color_eyre::install()?;

    match opt.cmd {
        SubCommand::Server => server::run(opt.config, opt.profile, false),
        subcommand => node::run(subcommand, opt.config, opt.profile),
    }
}
