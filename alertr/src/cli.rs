use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand, ValueHint};

#[derive(Parser, Debug)]
#[command(
    name = "alertr",
    about = "Run an alertr server or talk to one as a node",
    author,
    version
)]
pub struct CliArguments {
    /// Verbose mode (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// If provided, alertr only uses this config file.
    ///
    /// This path can also be set via the $ALERTR_CONFIG_PATH environment variable.
    /// The commandline option overwrites the environment variable!
    #[arg(short, long, global = true, value_hint = ValueHint::FilePath)]
    pub config: Option<PathBuf>,

    /// The name of the profile that should be loaded from your config file.
    #[arg(short, long, global = true)]
    pub profile: Option<String>,

    #[command(subcommand)]
    pub cmd: SubCommand,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum SubCommand {
    /// Start the server and accept nodes until interrupted.
    ///
    /// A default configuration file and self-signed certificates are created on the first start.
    Server,

    /// Connect as a node and stay connected until interrupted.
    ///
    /// The connection is checked regularly and re-established if it breaks.
    /// Everything the server sends is logged.
    Node,

    /// Connect as a node and ping the server.
    Ping {
        /// How many pings should be sent.
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
    },

    /// Connect as a node and send a single message to the server.
    Send {
        /// The message type, e.g. `sensoralert` or `statechange`.
        message: String,

        /// The payload of the message. Must be a JSON object.
        #[arg(default_value = "{}")]
        payload: String,
    },
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        CliArguments::command().debug_assert();
    }

    #[test]
    fn global_arguments_after_subcommand() {
        let arguments =
            CliArguments::parse_from(["alertr", "send", "statechange", "-vv", "-p", "garage"]);

        assert_eq!(arguments.verbose, 2);
        assert_eq!(arguments.profile.as_deref(), Some("garage"));
        assert_eq!(
            arguments.cmd,
            SubCommand::Send {
                message: "statechange".into(),
                payload: "{}".into(),
            }
        );
    }

    #[test]
    fn ping_count() {
        let arguments = CliArguments::parse_from(["alertr", "ping", "-n", "3"]);
        assert_eq!(arguments.cmd, SubCommand::Ping { count: 3 });
    }
}
