use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "tether",
    about = "Drive a long-running terminal agent session from several devices",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the session server
    Serve {
        /// Address to bind (overrides [server].bind)
        #[arg(long)]
        bind: Option<String>,

        /// Port to listen on (overrides [server].port)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Print a session's resolved messages as JSON
    Messages {
        /// Session id (the conversation log's file stem)
        session: String,
    },

    /// Show effective configuration
    Config {
        /// Emit machine-readable JSON
        #[arg(long)]
        json: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_overrides_parse() {
        let cli = Cli::try_parse_from(["tether", "serve", "--port", "9000", "-v"]).unwrap();
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Command::Serve { bind, port } => {
                assert!(bind.is_none());
                assert_eq!(port, Some(9000));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn messages_requires_session() {
        assert!(Cli::try_parse_from(["tether", "messages"]).is_err());
        let cli = Cli::try_parse_from(["tether", "messages", "abc-123"]).unwrap();
        assert!(matches!(cli.command, Command::Messages { session } if session == "abc-123"));
    }

    #[test]
    fn config_json_flag() {
        let cli = Cli::try_parse_from(["tether", "-vv", "config", "--json"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Command::Config { json: true }));
    }
}
