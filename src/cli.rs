//! Command-line interface

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "gasline-dispatch", about = "Dispatch core for a bottled-gas delivery operation")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the dispatch core (default)
    Serve,
    /// Run database migrations and exit
    Migrate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_args_defaults_to_serve() {
        let cli = Cli::parse_from(["gasline-dispatch"]);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_migrate_subcommand() {
        let cli = Cli::parse_from(["gasline-dispatch", "migrate"]);
        assert!(matches!(cli.command, Some(Command::Migrate)));
    }
}
