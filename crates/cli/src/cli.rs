use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use feedwatch_engine::Scope;

/// Watches accounts for new posts and follows and pushes them to Discord.
///
/// Credentials and paths come from the environment (a `.env` file is
/// read if present); channel limits and detection timing from the
/// optional settings file.
#[derive(Parser, Debug)]
#[command(name = "feedwatch", version, about)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run detection cycles until SIGINT/SIGTERM.
    Run,

    /// Run one broadcast pass, wait for deliveries to flush, then exit.
    Once,

    /// Inspect or edit tracking lists.
    Subs {
        #[command(subcommand)]
        action: SubsAction,
    },

    /// Check every configured bearer token against a known account.
    CheckToken {
        /// Username used for the probe lookup.
        #[arg(long, default_value = "X")]
        probe: String,
    },
}

#[derive(Args, Debug, Clone)]
pub struct ScopeArgs {
    /// Observer (Discord user id) whose targeted list to use.
    /// Omit for the global broadcast list.
    #[arg(long)]
    pub observer: Option<String>,
}

impl ScopeArgs {
    pub fn scope(&self) -> Scope {
        match &self.observer {
            Some(id) => Scope::Observer(id.clone()),
            None => Scope::Broadcast,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum SubsAction {
    /// Print a tracking list.
    List {
        #[command(flatten)]
        scope: ScopeArgs,
    },

    /// Track an account. Looks the account up to derive priority and tags.
    Add {
        #[command(flatten)]
        scope: ScopeArgs,
        username: String,
        /// Skip the lookup and store a bare entry.
        #[arg(long)]
        no_lookup: bool,
    },

    /// Stop tracking an account.
    Remove {
        #[command(flatten)]
        scope: ScopeArgs,
        username: String,
    },

    /// Replace the broadcast list with the names in a text file.
    Sync {
        /// Defaults to `<config_dir>/users.txt`.
        #[arg(long)]
        file: Option<PathBuf>,
        /// Look up new accounts to fill in metadata.
        #[arg(long)]
        fetch: bool,
    },

    /// List observers that have a targeted list.
    Observers,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        CliArgs::command().debug_assert();
    }

    #[test]
    fn parses_observer_scope() {
        let args = CliArgs::parse_from(["feedwatch", "subs", "add", "--observer", "42", "@alice"]);
        match args.command {
            Command::Subs {
                action: SubsAction::Add { scope, username, no_lookup },
            } => {
                assert_eq!(scope.scope(), Scope::Observer("42".into()));
                assert_eq!(username, "@alice");
                assert!(!no_lookup);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn list_defaults_to_broadcast() {
        let args = CliArgs::parse_from(["feedwatch", "subs", "list"]);
        match args.command {
            Command::Subs {
                action: SubsAction::List { scope },
            } => assert_eq!(scope.scope(), Scope::Broadcast),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
