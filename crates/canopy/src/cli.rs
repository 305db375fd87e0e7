//! Command line definitions

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "canopy",
    version,
    about = "Multi-repository workspaces built from git worktrees"
)]
pub struct Cli {
    /// Config file applied on top of the global one
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create a workspace with one worktree per repository
    New {
        id: String,
        /// Branch for every worktree (defaults to the workspace id)
        #[arg(short, long)]
        branch: Option<String>,
        /// Repository as `URL` or `NAME=URL`; repeatable
        #[arg(short, long = "repo", value_name = "REPO", required = true)]
        repos: Vec<String>,
    },
    /// Close a workspace, deleting it unless --archive is given
    Close {
        id: String,
        /// Keep the metadata so the workspace can be restored
        #[arg(long)]
        archive: bool,
        /// Skip the uncommitted/unpushed check
        #[arg(short, long)]
        force: bool,
    },
    /// Recreate an archived workspace
    Restore {
        id: String,
        /// Replace an active workspace with the same id
        #[arg(short, long)]
        force: bool,
    },
    /// Rename a workspace
    Rename { id: String, new_id: String },
    /// Add a repository to a workspace
    AddRepo {
        id: String,
        /// Repository as `URL` or `NAME=URL`
        repo: String,
    },
    /// Remove a repository from a workspace
    RemoveRepo {
        id: String,
        name: String,
        #[arg(short, long)]
        force: bool,
    },
    /// Check out another branch in every repository
    Switch { id: String, branch: String },
    /// Run a command in every repository of a workspace
    Run(RunArgs),
    /// List workspaces
    List {
        /// Include archived workspaces
        #[arg(short, long)]
        all: bool,
    },
    /// Show per-repository status
    Status { id: String },
    /// Print the directory of a workspace
    Path { id: String },
}

#[derive(Debug, Args)]
pub struct RunArgs {
    pub id: String,
    /// Run in all repositories at once
    #[arg(short, long)]
    pub parallel: bool,
    /// Keep going after a repository fails
    #[arg(short = 'k', long)]
    pub continue_on_error: bool,
    #[arg(last = true, required = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_with_trailing_command() {
        let cli = Cli::try_parse_from([
            "canopy", "run", "PROJ-1", "--parallel", "--", "git", "log", "-1",
        ])
        .unwrap();
        match cli.command {
            Command::Run(args) => {
                assert!(args.parallel);
                assert!(!args.continue_on_error);
                assert_eq!(args.command, ["git", "log", "-1"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_new_requires_a_repo() {
        assert!(Cli::try_parse_from(["canopy", "new", "PROJ-1"]).is_err());
    }

    #[test]
    fn test_close_flags() {
        let cli =
            Cli::try_parse_from(["canopy", "close", "PROJ-1", "--archive", "--force"]).unwrap();
        match cli.command {
            Command::Close { id, archive, force } => {
                assert_eq!(id, "PROJ-1");
                assert!(archive);
                assert!(force);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
