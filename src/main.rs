//! # grantmatch CLI
//!
//! The `grantmatch` binary drives the whole system: portal sync, grant
//! browsing, projects and matching, the application tracker, and the HTTP
//! server.
//!
//! ## Usage
//!
//! ```bash
//! grantmatch --config ./config/grantmatch.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `grantmatch init` | Create the SQLite database and run schema migrations |
//! | `grantmatch sync` | Pull grants from the portal (API, then HTML listing) |
//! | `grantmatch sync --sample` | Load the built-in sample grants instead |
//! | `grantmatch grants` | Browse and search stored grants |
//! | `grantmatch grant <id>` | Show one grant by id or portal reference |
//! | `grantmatch agencies` | List agencies and their open grant counts |
//! | `grantmatch deadlines` | Open grants closing soon |
//! | `grantmatch project ...` | Create, list, show, update, delete projects |
//! | `grantmatch match <project>` | Score every grant against a project |
//! | `grantmatch matches <project>` | Show stored matches |
//! | `grantmatch save <project> <grant>` | Toggle a saved match |
//! | `grantmatch saved <owner>` | Saved matches across a user's projects |
//! | `grantmatch apply <project> <grant>` | Open an application |
//! | `grantmatch application ...` | Advance, show, list, history |
//! | `grantmatch profile ...` | Show or edit a user profile |
//! | `grantmatch stats` | Database overview |
//! | `grantmatch serve` | Start the HTTP API |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use grantmatch::config::{self, Config};
use grantmatch::grants::{self, GrantFilter, DEFAULT_DEADLINE_WINDOW_DAYS};
use grantmatch::models::{ApplicationStatus, GrantStatus, NewProject, ProjectUpdate};
use grantmatch::projects::{self, ProfileUpdate};
use grantmatch::{ingest, matcher, migrate, server, stats, tracker};

/// grantmatch: find government grants that fit your projects and track
/// your applications.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/grantmatch.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "grantmatch",
    about = "Grant discovery, project matching, and application tracking",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/grantmatch.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Pull grants from the portal and upsert them by portal reference.
    ///
    /// Tries the JSON API first and falls back to the HTML listing. If both
    /// fail nothing is written and the command exits non-zero.
    Sync {
        /// Load the built-in sample grants instead of contacting the portal.
        #[arg(long)]
        sample: bool,

        /// Report what would change without writing.
        #[arg(long)]
        dry_run: bool,
    },

    /// Browse stored grants.
    Grants {
        /// Substring of title, description, or agency name.
        #[arg(long)]
        search: Option<String>,

        /// Agency acronym (e.g. `MOE`).
        #[arg(long)]
        agency: Option<String>,

        /// `open`, `upcoming`, or `closed`.
        #[arg(long)]
        status: Option<GrantStatus>,

        #[arg(long)]
        limit: Option<i64>,
    },

    /// Show one grant by id or portal reference.
    Grant { id: String },

    /// List agencies with their open grant counts.
    Agencies,

    /// Open grants whose deadline falls within the window.
    Deadlines {
        #[arg(long, default_value_t = DEFAULT_DEADLINE_WINDOW_DAYS)]
        days: i64,
    },

    /// Manage projects.
    Project {
        #[command(subcommand)]
        action: ProjectAction,
    },

    /// Score every grant against a project and store the results.
    Match { project: String },

    /// Show stored matches for a project.
    Matches {
        project: String,

        /// Include matches that no longer qualify.
        #[arg(long)]
        include_stale: bool,
    },

    /// Toggle the saved flag on a match.
    Save { project: String, grant: String },

    /// Saved matches across all of a user's projects.
    Saved { owner: String },

    /// Open an application for a project and grant.
    Apply {
        project: String,
        grant: String,

        #[arg(long, default_value = "")]
        notes: String,
    },

    /// Work with applications.
    Application {
        #[command(subcommand)]
        action: ApplicationAction,
    },

    /// Show or edit a user profile.
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },

    /// Show database statistics.
    Stats,

    /// Start the HTTP API on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum ProjectAction {
    Create {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Repeatable.
        #[arg(long = "category")]
        categories: Vec<String>,
        /// Funding need in whole dollars.
        #[arg(long)]
        need: Option<i64>,
        /// Preferred agency name or acronym. Repeatable.
        #[arg(long = "agency")]
        agencies: Vec<String>,
    },
    List {
        #[arg(long)]
        owner: String,
    },
    Show {
        id: String,
    },
    /// Change fields of a project. Only the owner may update it.
    Update {
        id: String,
        #[arg(long)]
        owner: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// Replaces the category list. Repeatable.
        #[arg(long = "category")]
        categories: Vec<String>,
        #[arg(long, conflicts_with = "clear_need")]
        need: Option<i64>,
        /// Remove the funding need.
        #[arg(long)]
        clear_need: bool,
        /// Replaces the preferred agency list. Repeatable.
        #[arg(long = "agency")]
        agencies: Vec<String>,
    },
    /// Delete a project with its matches and applications.
    Delete {
        id: String,
        #[arg(long)]
        owner: String,
    },
}

#[derive(Subcommand)]
enum ApplicationAction {
    /// Move to the next status: `submitted`, `under_review`, `accepted`, `rejected`.
    Advance { id: String, status: ApplicationStatus },
    Show { id: String },
    List {
        #[arg(long)]
        owner: String,
    },
    History { id: String },
}

#[derive(Subcommand)]
enum ProfileAction {
    Show {
        user: String,
    },
    Set {
        user: String,
        #[arg(long)]
        organization: Option<String>,
        #[arg(long = "type")]
        organization_type: Option<String>,
        #[arg(long)]
        bio: Option<String>,
    },
}

fn init_logging(cfg: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.log.filter.as_str()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn non_empty<T>(v: Vec<T>) -> Option<Vec<T>> {
    if v.is_empty() {
        None
    } else {
        Some(v)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    init_logging(&cfg);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sync { sample, dry_run } => {
            ingest::run_sync(&cfg, sample, dry_run).await?;
        }
        Commands::Grants {
            search,
            agency,
            status,
            limit,
        } => {
            let filter = GrantFilter {
                search,
                agency,
                status,
                limit,
            };
            grants::run_grants(&cfg, filter).await?;
        }
        Commands::Grant { id } => {
            grants::run_grant(&cfg, &id).await?;
        }
        Commands::Agencies => {
            grants::run_agencies(&cfg).await?;
        }
        Commands::Deadlines { days } => {
            grants::run_deadlines(&cfg, days).await?;
        }
        Commands::Project { action } => match action {
            ProjectAction::Create {
                owner,
                name,
                description,
                categories,
                need,
                agencies,
            } => {
                let new = NewProject {
                    owner,
                    name,
                    description,
                    categories,
                    funding_need: need,
                    preferred_agencies: agencies,
                };
                projects::run_project_create(&cfg, new).await?;
            }
            ProjectAction::List { owner } => {
                projects::run_project_list(&cfg, &owner).await?;
            }
            ProjectAction::Show { id } => {
                projects::run_project_show(&cfg, &id).await?;
            }
            ProjectAction::Update {
                id,
                owner,
                name,
                description,
                categories,
                need,
                clear_need,
                agencies,
            } => {
                let update = ProjectUpdate {
                    name,
                    description,
                    categories: non_empty(categories),
                    funding_need: if clear_need { Some(None) } else { need.map(Some) },
                    preferred_agencies: non_empty(agencies),
                };
                projects::run_project_update(&cfg, &id, &owner, update).await?;
            }
            ProjectAction::Delete { id, owner } => {
                projects::run_project_delete(&cfg, &id, &owner).await?;
            }
        },
        Commands::Match { project } => {
            matcher::run_match(&cfg, &project).await?;
        }
        Commands::Matches {
            project,
            include_stale,
        } => {
            matcher::run_matches(&cfg, &project, include_stale).await?;
        }
        Commands::Save { project, grant } => {
            matcher::run_save(&cfg, &project, &grant).await?;
        }
        Commands::Saved { owner } => {
            matcher::run_saved(&cfg, &owner).await?;
        }
        Commands::Apply {
            project,
            grant,
            notes,
        } => {
            tracker::run_apply(&cfg, &project, &grant, &notes).await?;
        }
        Commands::Application { action } => match action {
            ApplicationAction::Advance { id, status } => {
                tracker::run_advance(&cfg, &id, status).await?;
            }
            ApplicationAction::Show { id } => {
                tracker::run_application_show(&cfg, &id).await?;
            }
            ApplicationAction::List { owner } => {
                tracker::run_application_list(&cfg, &owner).await?;
            }
            ApplicationAction::History { id } => {
                tracker::run_application_history(&cfg, &id).await?;
            }
        },
        Commands::Profile { action } => match action {
            ProfileAction::Show { user } => {
                projects::run_profile_show(&cfg, &user).await?;
            }
            ProfileAction::Set {
                user,
                organization,
                organization_type,
                bio,
            } => {
                let update = ProfileUpdate {
                    organization_name: organization,
                    organization_type,
                    bio,
                };
                projects::run_profile_set(&cfg, &user, update).await?;
            }
        },
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
