//! crepo command-line front end.
//!
//! Loads the TOML configuration, builds the project catalog and storage
//! backend, and drives the branch manager: project initialization, branch
//! lifecycle, and path-addressed resource operations on a branch.

mod render;

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crepo_core::conflict::ResolvePolicy;
use crepo_core::{BranchKey, BranchManager, RepoConfig, RepoError, ResetMode};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// crepo command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "crepo",
    version,
    about = "Manage per-user branches of a collaborative content repository"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true, default_value = "./crepo.toml")]
    config: PathBuf,

    /// Project id.
    #[arg(short, long, global = true)]
    project: Option<u64>,

    /// Acting user id.
    #[arg(short, long, global = true)]
    user: Option<u64>,

    /// Log level filter (overrides `logging.level`).
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./crepo.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,

    /// Project-level operations.
    Project {
        #[command(subcommand)]
        action: ProjectAction,
    },

    /// Branch lifecycle operations.
    Branch {
        #[command(subcommand)]
        action: BranchAction,
    },

    /// Resource operations on one branch.
    Resource {
        /// Branch name.
        #[arg(short, long)]
        branch: String,

        #[command(subcommand)]
        action: ResourceAction,
    },
}

#[derive(Subcommand, Debug)]
enum ProjectAction {
    /// Create the canonical history, optionally seeded from a directory.
    Init {
        #[arg(long)]
        seed: Option<PathBuf>,
    },
    /// Show project details.
    Info,
    /// Print a file from the head of the canonical history.
    Cat { path: String },
}

#[derive(Subcommand, Debug)]
enum BranchAction {
    /// Clone the canonical head into a new branch.
    Create { name: String },
    /// Delete a branch and its working directory.
    Delete { name: String },
    /// List the acting user's branches.
    List,
    /// Show branch state and changed resources.
    Status { name: String },
    /// Merge the canonical head into the branch.
    Update { name: String },
    /// Commit all working-tree changes.
    Commit {
        name: String,
        #[arg(short, long)]
        message: String,
    },
    /// Finalize a pending merge.
    CommitMerge {
        name: String,
        #[arg(short, long)]
        message: String,
    },
    /// Fast-forward the canonical history to the branch head.
    Publish { name: String },
    /// Move the branch head to a commit of its log.
    Reset {
        name: String,
        commit: String,
        /// soft, mixed or hard.
        #[arg(long, default_value = "mixed")]
        mode: String,
    },
    /// Show the most recent commits.
    Log {
        name: String,
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Subcommand, Debug)]
enum ResourceAction {
    /// Create a directory and its missing ancestors.
    Mkdir { path: String },
    /// Write a file from `--data`, `--file` or standard input.
    Put {
        path: String,
        #[arg(long, conflicts_with = "file")]
        data: Option<String>,
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Print file content, from the working tree or a revision.
    Get {
        path: String,
        #[arg(short, long, default_value = "")]
        revision: String,
    },
    /// Describe a file or directory.
    Info { path: String },
    /// Delete a file or directory subtree.
    Rm { path: String },
    /// Move a file or directory subtree.
    Mv { from: String, to: String },
    /// Discard uncommitted changes below a path.
    Revert { path: String },
    /// Resolve a conflicted path with `yours` or `theirs`.
    Resolve {
        path: String,
        #[arg(long)]
        policy: String,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(repo_err) = e.downcast_ref::<RepoError>() {
                eprintln!("Error [{}]: {:#}", repo_err.kind(), e);
            } else {
                eprintln!("Error: {:#}", e);
            }
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init { ref output } => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"));
            cmd_init(output)
        }
        Commands::Validate => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"));
            cmd_validate(&cli.config)
        }
        _ => {
            let config = RepoConfig::load_and_validate(&cli.config)
                .context("failed to load configuration file")?;
            init_logging(cli.log_level.as_deref().unwrap_or(&config.logging.level));
            debug!(
                config = %cli.config.display(),
                backend = ?config.storage.backend,
                projects = config.projects.len(),
                "configuration loaded"
            );
            let session = Session::new(&cli, config)?;

            match cli.command {
                Commands::Project { action } => session.project(action),
                Commands::Branch { action } => session.branch(action),
                Commands::Resource { branch, action } => session.resource(&branch, action),
                Commands::Init { .. } | Commands::Validate => Ok(()),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

fn cmd_init(output: &Path) -> Result<()> {
    let default_config = r#"# crepo configuration

[storage]
branch_root = "/var/lib/crepo/branches"
backend = "git"
canonical_branch = "master"

[logging]
level = "info"

[[users]]
id = 1
name = "Owner"
email = "owner@example.com"

[[projects]]
id = 1
name = "proj1"
repository = "/var/lib/crepo/canonical/proj1.git"
owner = 1
members = []
"#;

    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }
    std::fs::write(output, default_config).context("failed to write config file")?;

    println!("Default configuration written to {}", output.display());
    println!();
    println!("Next steps:");
    println!("  1. Edit the users and projects in the config file");
    println!("  2. Validate with: crepo validate --config {}", output.display());
    println!(
        "  3. Create the canonical history: crepo -p 1 -u 1 project init --config {}",
        output.display()
    );
    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let config =
        RepoConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    if let Err(e) = config.validate() {
        println!("  [FAIL] Validation error: {}", e);
        anyhow::bail!("configuration validation failed");
    }
    println!("  [OK] All required fields are valid");

    println!();
    println!("Configuration summary:");
    println!("  Branch root : {}", config.storage.branch_root.display());
    println!("  Backend     : {:?}", config.storage.backend);
    println!("  Branch name : {}", config.storage.canonical_branch);
    println!("  Users       : {}", config.users.len());
    println!("  Projects    : {}", config.projects.len());
    println!();
    println!("Configuration is valid.");
    Ok(())
}

/// Everything a project, branch or resource command needs.
struct Session {
    project: u64,
    user: u64,
    json: bool,
    manager: BranchManager,
}

impl Session {
    fn new(cli: &Cli, config: RepoConfig) -> Result<Self> {
        let project = cli.project.context("--project is required")?;
        let user = cli.user.context("--user is required")?;
        let manager = BranchManager::new(
            &config.storage.branch_root,
            Arc::new(config.build_catalog()),
            config.build_backend(),
        )
        .context("failed to open branch root")?;
        debug!(
            project,
            user,
            branch_root = %config.storage.branch_root.display(),
            "branch manager ready"
        );
        Ok(Self {
            project,
            user,
            json: cli.json,
            manager,
        })
    }

    fn key(&self, name: &str) -> BranchKey {
        BranchKey::new(self.project, self.user, name)
    }

    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce(&T) -> String) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            println!("{}", text(value));
        }
        Ok(())
    }

    fn project(&self, action: ProjectAction) -> Result<()> {
        match action {
            ProjectAction::Init { seed } => {
                let commit = self
                    .manager
                    .init_project(self.project, self.user, seed.as_deref())?;
                self.emit(&commit, render::commit)
            }
            ProjectAction::Info => {
                let info = self.manager.project_info(self.project, self.user)?;
                self.emit(&info, |i| {
                    format!(
                        "Project {} ({})\n  Owner   : {}\n  Members : {}",
                        i.name, i.id, i.owner, i.members_count
                    )
                })
            }
            ProjectAction::Cat { path } => {
                let data = self.manager.canonical_data(self.project, self.user, &path)?;
                std::io::stdout().write_all(&data)?;
                Ok(())
            }
        }
    }

    fn branch(&self, action: BranchAction) -> Result<()> {
        match action {
            BranchAction::Create { name } => {
                let status = self.manager.create_branch(&self.key(&name))?;
                self.emit(&status, render::status)
            }
            BranchAction::Delete { name } => {
                self.manager.delete_branch(&self.key(&name))?;
                println!("Branch {} deleted", name);
                Ok(())
            }
            BranchAction::List => {
                let names = self.manager.list_branches(self.project, self.user)?;
                self.emit(&names, |n| {
                    if n.is_empty() {
                        "No branches.".to_string()
                    } else {
                        n.join("\n")
                    }
                })
            }
            BranchAction::Status { name } => {
                let status = self.manager.branch_status(&self.key(&name))?;
                self.emit(&status, render::status)
            }
            BranchAction::Update { name } => {
                let status = self.manager.update_branch(&self.key(&name))?;
                self.emit(&status, render::status)
            }
            BranchAction::Commit { name, message } => {
                let commit = self.manager.commit(&self.key(&name), &message)?;
                self.emit(&commit, render::commit)
            }
            BranchAction::CommitMerge { name, message } => {
                let commit = self.manager.commit_merge(&self.key(&name), &message)?;
                self.emit(&commit, render::commit)
            }
            BranchAction::Publish { name } => {
                self.manager.publish(&self.key(&name))?;
                println!("Branch {} published", name);
                Ok(())
            }
            BranchAction::Reset { name, commit, mode } => {
                let mode: ResetMode = mode.parse()?;
                let status = self.manager.reset(&self.key(&name), mode, &commit)?;
                self.emit(&status, render::status)
            }
            BranchAction::Log { name, limit } => {
                let log = self.manager.log(&self.key(&name), limit)?;
                self.emit(&log, |l| render::log(&l.commits))
            }
        }
    }

    fn resource(&self, branch: &str, action: ResourceAction) -> Result<()> {
        let key = self.key(branch);
        let status = match action {
            ResourceAction::Mkdir { path } => self.manager.mkdir(&key, &path)?,
            ResourceAction::Put { path, data, file } => {
                let bytes = match (data, file) {
                    (Some(data), _) => data.into_bytes(),
                    (None, Some(file)) => std::fs::read(&file)
                        .with_context(|| format!("failed to read {}", file.display()))?,
                    (None, None) => {
                        let mut buf = Vec::new();
                        std::io::stdin()
                            .read_to_end(&mut buf)
                            .context("failed to read standard input")?;
                        buf
                    }
                };
                self.manager.put_data(&key, &path, &bytes)?
            }
            ResourceAction::Get { path, revision } => {
                let data = self.manager.get_data(&key, &path, &revision)?;
                std::io::stdout().write_all(&data)?;
                return Ok(());
            }
            ResourceAction::Info { path } => {
                let info = self.manager.get_info(&key, &path)?;
                return self.emit(&info, render::info);
            }
            ResourceAction::Rm { path } => self.manager.delete_resource(&key, &path)?,
            ResourceAction::Mv { from, to } => self.manager.rename_resource(&key, &from, &to)?,
            ResourceAction::Revert { path } => self.manager.revert_resource(&key, &path)?,
            ResourceAction::Resolve { path, policy } => {
                let policy: ResolvePolicy = policy.parse()?;
                self.manager.resolve(&key, &path, policy)?
            }
        };
        self.emit(&status, render::status)
    }
}
