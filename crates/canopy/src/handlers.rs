//! Subcommand handlers: translate arguments into service calls and print
//! one line per item.

use std::sync::Arc;

use anyhow::{Context, Result};
use canopy_core::{
    domain::validate_repo_name,
    git::GitCli,
    hooks::ShellHookExecutor,
    load_config,
    ports::HookReport,
    storage::FsWorkspaceStore,
    CancellationToken, CloseOptions, CreateRequest, Repo, RunOptions, WorkspaceService,
};

use crate::cli::{Cli, Command, RunArgs};

pub fn format_error(err: &anyhow::Error) -> String {
    let msg = err.to_string();
    if let Some(source) = err.source() {
        let source_msg = source.to_string();
        if !msg.contains(&source_msg) && !source_msg.is_empty() {
            return format!("{msg}\nCause: {source_msg}");
        }
    }
    msg
}

/// Build the service from configuration and the shipped adapters.
pub fn build_service(cli: &Cli) -> Result<WorkspaceService> {
    let config = load_config(cli.config.as_deref())?;
    let git = GitCli::discover(config.repos_root.clone())?;
    let store = FsWorkspaceStore::new(&config.state_dir);
    let hooks = ShellHookExecutor::from_config(&config.hooks);
    Ok(WorkspaceService::new(
        config,
        Arc::new(git),
        Arc::new(store),
        Arc::new(hooks),
    ))
}

pub async fn run_cli(cli: Cli, cancel: CancellationToken) -> Result<()> {
    let service = build_service(&cli)?;
    match cli.command {
        Command::New { id, branch, repos } => {
            let repos = repos
                .iter()
                .map(String::as_str)
                .map(parse_repo)
                .collect::<Result<Vec<_>>>()?;
            let branch = branch.unwrap_or_else(|| id.clone());
            handle_new(&service, CreateRequest::new(id, branch, repos), &cancel).await
        }
        Command::Close { id, archive, force } => {
            let options = if archive {
                CloseOptions::archive()
            } else {
                CloseOptions::default()
            }
            .with_force(force);
            let outcome = service.close(&id, options, &cancel).await?;
            print_hooks(outcome.hooks.as_ref());
            println!("Closed {} ({:?})", outcome.workspace.id, outcome.mode);
            Ok(())
        }
        Command::Restore { id, force } => {
            let outcome = service.restore(&id, force, &cancel).await?;
            print_hooks(outcome.hooks.as_ref());
            if let Some(error) = &outcome.hook_error {
                eprintln!("Warning: post-create hook failed: {error}");
            }
            println!("{}", outcome.path.display());
            Ok(())
        }
        Command::Rename { id, new_id } => {
            let workspace = service.rename(&id, &new_id, &cancel).await?;
            println!("Renamed {id} to {}", workspace.id);
            Ok(())
        }
        Command::AddRepo { id, repo } => {
            let repo = parse_repo(&repo)?;
            let name = repo.name.clone();
            service.add_repo(&id, repo, &cancel).await?;
            println!("Added {name} to {id}");
            Ok(())
        }
        Command::RemoveRepo { id, name, force } => {
            service.remove_repo(&id, &name, force, &cancel).await?;
            println!("Removed {name} from {id}");
            Ok(())
        }
        Command::Switch { id, branch } => {
            let workspace = service.switch_branch(&id, &branch, &cancel).await?;
            println!("{} is on {}", workspace.id, workspace.branch);
            Ok(())
        }
        Command::Run(args) => handle_run(&service, args, &cancel).await,
        Command::List { all } => handle_list(&service, all).await,
        Command::Status { id } => handle_status(&service, &id, &cancel).await,
        Command::Path { id } => {
            println!("{}", service.workspace_path(&id).await?.display());
            Ok(())
        }
    }
}

async fn handle_new(
    service: &WorkspaceService,
    request: CreateRequest,
    cancel: &CancellationToken,
) -> Result<()> {
    let outcome = service.create(request, cancel).await?;
    print_hooks(outcome.hooks.as_ref());
    if let Some(error) = &outcome.hook_error {
        eprintln!("Warning: post-create hook failed: {error}");
    }
    println!("{}", outcome.path.display());
    Ok(())
}

async fn handle_run(
    service: &WorkspaceService,
    args: RunArgs,
    cancel: &CancellationToken,
) -> Result<()> {
    let options = if args.parallel {
        RunOptions::parallel()
    } else {
        RunOptions::sequential()
    }
    .with_continue_on_error(args.continue_on_error);

    let report = service.run(&args.id, args.command, options, cancel).await?;
    for result in &report.results {
        println!("==> {}", result.repo);
        print!("{}", result.stdout());
        eprint!("{}", result.stderr());
        if let Some(error) = &result.error {
            eprintln!("{}: {error}", result.repo);
        }
    }
    report.into_result()?;
    Ok(())
}

async fn handle_list(service: &WorkspaceService, all: bool) -> Result<()> {
    for summary in service.list(all).await? {
        let ws = &summary.workspace;
        let size = summary
            .usage
            .map(|usage| human_bytes(usage.bytes))
            .unwrap_or_else(|| "-".to_string());
        let locked = if ws.locked { " locked" } else { "" };
        println!(
            "{}\t{}{locked}\t{}\t{}\t{size}",
            ws.id,
            summary.state,
            ws.branch,
            ws.repos
                .iter()
                .map(|repo| repo.name.as_str())
                .collect::<Vec<_>>()
                .join(","),
        );
    }
    Ok(())
}

async fn handle_status(
    service: &WorkspaceService,
    id: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let status = service.status(id, cancel).await?;
    println!("{} ({})", status.workspace.id, status.path.display());
    for result in &status.repos {
        match (&result.output, &result.error) {
            (Some(repo), _) => {
                let branch = repo.branch.as_deref().unwrap_or("(detached)");
                let state = repo.unclean_reason().unwrap_or_else(|| "clean".to_string());
                println!(
                    "  {}\t{branch}\t{state}\tbehind {}",
                    result.repo, repo.behind
                );
            }
            (None, Some(error)) => println!("  {}\terror: {error}", result.repo),
            (None, None) => println!("  {}\tunknown", result.repo),
        }
    }
    Ok(())
}

fn print_hooks(report: Option<&HookReport>) {
    let Some(report) = report else { return };
    for failed in report.failures() {
        let reason = failed
            .error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        eprintln!("Warning: hook '{}' failed: {reason}", failed.command);
    }
}

/// `NAME=URL` or a bare URL whose last path segment names the repository.
fn parse_repo(spec: &str) -> Result<Repo> {
    if let Some((name, url)) = spec.split_once('=') {
        if !name.is_empty() && !name.contains(['/', ':']) {
            validate_repo_name(name)?;
            return Ok(Repo::new(name, url));
        }
    }
    Repo::from_url(spec).with_context(|| format!("Invalid repository '{spec}'"))
}

#[allow(clippy::cast_precision_loss)]
fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_repo_named() {
        let repo = parse_repo("api=git@example.com:org/backend.git").unwrap();
        assert_eq!(repo.name, "api");
        assert_eq!(repo.url, "git@example.com:org/backend.git");
    }

    #[test]
    fn test_parse_repo_from_url() {
        let repo = parse_repo("https://example.com/org/web.git").unwrap();
        assert_eq!(repo.name, "web");
    }

    #[test]
    fn test_parse_repo_empty_name_falls_back_to_url() {
        assert!(parse_repo("=https://example.com/org/web.git").is_ok());
        assert!(parse_repo("").is_err());
    }

    #[test]
    fn test_human_bytes() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(2048), "2.0 KiB");
        assert_eq!(human_bytes(5 * 1024 * 1024), "5.0 MiB");
    }
}
