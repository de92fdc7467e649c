//! Dockhand - console client for a Docker Copilot backend
//!
//! Main entry point for the dockhand command.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dockhand::api::{ApiClient, ApiError, DEFAULT_API_URL};
use dockhand::app::{Dashboard, Notice, OperationStatus, Phase};
use dockhand::config::Settings;
use dockhand::credentials::{AuthEvent, CredentialStore};
use dockhand::docker::{Container, ContainerAction, DockerClient, UpdateRequest};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Base URL of the backend
    #[arg(long, global = true, env = "DOCKHAND_API_URL", default_value = DEFAULT_API_URL)]
    api_url: String,
    /// Where the login credential is kept
    #[arg(long, global = true, env = "DOCKHAND_TOKEN_FILE")]
    token_file: Option<PathBuf>,
    /// Keep the credential in memory only
    #[arg(long, global = true)]
    no_token_file: bool,
    #[arg(long, global = true, env = "DOCKHAND_TIMEOUT_SECS")]
    timeout_secs: Option<u64>,
    #[arg(long, global = true, env = "DOCKHAND_POLL_ATTEMPTS")]
    poll_attempts: Option<u32>,
    #[arg(long, global = true, env = "DOCKHAND_POLL_INTERVAL_MS")]
    poll_interval_ms: Option<u64>,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in with the backend secret key
    Login { secret: String },
    Logout,
    /// List containers
    Ps,
    Start {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    Stop {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    Restart {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    Rename { id: String, new_name: String },
    /// Recreate a container from a (new) image and follow the progress
    Update {
        id: String,
        /// Defaults to the current container name
        #[arg(long)]
        name: Option<String>,
        /// Defaults to the image the container runs now
        #[arg(long)]
        image: Option<String>,
        #[arg(long, help = "Keep the old container instead of deleting it")]
        keep_old: bool,
    },
    /// Update every listed container to its current image tag
    UpdateAll {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    Images,
    Rmi {
        id: String,
        #[arg(long)]
        force: bool,
    },
    Version,
    /// Ask the backend to update itself
    Upgrade,
    Backup,
    Backups,
    Restore { file: String },
    #[command(name = "rm-backup")]
    RmBackup { file: String },
    /// Print a compose file for the current containers
    Compose,
    /// Keep the container list on screen, refreshing periodically
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let settings = build_settings(&cli)?;
    let credentials = open_credentials(&settings)?;
    let api = ApiClient::new(
        settings.api_url.clone(),
        Arc::clone(&credentials),
        settings.timeouts,
    )
    .context("Failed to build HTTP client")?;
    info!("Using backend at {}", api.base_url());

    let client = DockerClient::new(api.clone());
    let mut dashboard = Dashboard::from_settings(client, &settings);

    match cli.command {
        Commands::Login { secret } => {
            api.login(&secret).await.context("Login failed")?;
            match credentials.path() {
                Some(path) => println!("Logged in, credential saved to {}", path.display()),
                None => println!("Logged in for this session"),
            }
        }
        Commands::Logout => {
            if api.logout() {
                println!("Logged out");
            } else {
                println!("Not logged in");
            }
        }
        Commands::Ps => {
            dashboard.refresh().await.map_err(auth_hint)?;
            print_containers(&dashboard.containers().await);
        }
        Commands::Start { ids } => run_batch(&mut dashboard, &ids, ContainerAction::Start).await?,
        Commands::Stop { ids } => run_batch(&mut dashboard, &ids, ContainerAction::Stop).await?,
        Commands::Restart { ids } => {
            run_batch(&mut dashboard, &ids, ContainerAction::Restart).await?
        }
        Commands::UpdateAll { ids } => {
            run_batch(&mut dashboard, &ids, ContainerAction::Update).await?
        }
        Commands::Rename { id, new_name } => {
            if let Err(failure) = dashboard.rename(&id, &new_name).await {
                print_notice(&Notice::Error(failure));
                bail!("Rename of {} failed", id);
            }
            println!("Renamed {} to {}", id, new_name);
        }
        Commands::Update {
            id,
            name,
            image,
            keep_old,
        } => {
            let request = update_request(&mut dashboard, &id, name, image, keep_old).await?;
            update_with_progress(&mut dashboard, &id, request).await?;
        }
        Commands::Images => {
            let images = api.list_images().await.map_err(auth_hint)?;
            println!("{:<14} {:<40} {:<16} {:>10}  {}", "ID", "NAME", "TAG", "SIZE", "IN USE");
            for image in images {
                println!(
                    "{:<14} {:<40} {:<16} {:>10}  {}",
                    short_id(&image.id),
                    image.name,
                    image.tag,
                    image.size,
                    if image.in_used { "yes" } else { "" }
                );
            }
        }
        Commands::Rmi { id, force } => {
            api.delete_image(&id, force).await.map_err(auth_hint)?;
            println!("Deleted image {}", id);
        }
        Commands::Version => {
            let info = dashboard
                .client()
                .version_info()
                .await
                .map_err(auth_hint)?;
            println!("Backend version: {}", info.version);
            if !info.build_date.is_empty() {
                println!("Build date:      {}", info.build_date);
            }
            println!("Latest release:  {}", info.remote_version);
            if info.has_update {
                println!("An update is available, run `dockhand upgrade`");
            }
        }
        Commands::Upgrade => {
            let msg = api.update_program().await.map_err(auth_hint)?;
            println!("{}", if msg.is_empty() { "Upgrade requested" } else { msg.as_str() });
        }
        Commands::Backup => {
            let msg = api.backup_containers().await.map_err(auth_hint)?;
            println!("{}", if msg.is_empty() { "Backup created" } else { msg.as_str() });
        }
        Commands::Backups => {
            let backups = api.list_backups().await.map_err(auth_hint)?;
            if backups.is_empty() {
                println!("No backups");
            }
            for file in backups {
                println!("{}", file);
            }
        }
        Commands::Restore { file } => {
            api.restore_backup(&file).await.map_err(auth_hint)?;
            println!("Restore of {} started", file);
        }
        Commands::RmBackup { file } => {
            api.delete_backup(&file).await.map_err(auth_hint)?;
            println!("Deleted backup {}", file);
        }
        Commands::Compose => {
            let compose = api.backup_to_compose().await.map_err(auth_hint)?;
            println!("{}", compose);
        }
        Commands::Watch => watch(&mut dashboard).await?,
    }

    log_history(&dashboard);
    Ok(())
}

fn build_settings(cli: &Cli) -> Result<Settings> {
    let mut settings = Settings::default().with_api_url(&cli.api_url)?;
    if let Some(secs) = cli.timeout_secs {
        settings.timeouts.management = Duration::from_secs(secs);
    }
    if let Some(attempts) = cli.poll_attempts {
        settings.poll.max_attempts = attempts;
    }
    if let Some(ms) = cli.poll_interval_ms {
        settings.poll.interval = Duration::from_millis(ms);
    }
    if cli.no_token_file {
        settings.token_path = None;
    } else if let Some(path) = &cli.token_file {
        settings.token_path = Some(path.clone());
    }
    settings.validate()?;
    debug!("Settings: {:?}", settings);
    Ok(settings)
}

fn open_credentials(settings: &Settings) -> Result<Arc<CredentialStore>> {
    let store = match &settings.token_path {
        Some(path) => CredentialStore::with_file(path.clone())
            .with_context(|| format!("Failed to read credential file {}", path.display()))?,
        None => CredentialStore::in_memory(),
    };
    Ok(Arc::new(store))
}

fn auth_hint(err: ApiError) -> anyhow::Error {
    match err {
        ApiError::AuthExpired | ApiError::Unauthorized => {
            anyhow::anyhow!("{}. Run `dockhand login <secret>` first", err)
        }
        other => other.into(),
    }
}

async fn run_batch(dashboard: &mut Dashboard, ids: &[String], action: ContainerAction) -> Result<()> {
    if let Err(e) = dashboard.refresh().await {
        if matches!(e, ApiError::AuthExpired | ApiError::Unauthorized) {
            return Err(auth_hint(e));
        }
        // Commands still go out, just without an optimistic status
        warn!("Could not load container list: {}", e);
    }

    let report = dashboard.run_batch(ids, action).await;
    debug!(
        "{} dispatched, {} skipped",
        report.dispatched.len(),
        report.skipped.len()
    );
    dashboard.settle().await;

    let failures = print_notices(dashboard);
    if failures > 0 {
        bail!("{} of {} containers failed to {}", failures, ids.len(), action);
    }
    Ok(())
}

async fn update_request(
    dashboard: &mut Dashboard,
    id: &str,
    name: Option<String>,
    image: Option<String>,
    keep_old: bool,
) -> Result<UpdateRequest> {
    if let (Some(name), Some(image)) = (&name, &image) {
        return Ok(UpdateRequest {
            container_name: name.clone(),
            image_name_and_tag: image.clone(),
            delete_old_container: !keep_old,
        });
    }

    dashboard.refresh().await.map_err(auth_hint)?;
    let Some(container) = dashboard.client().cache().get(id).await else {
        bail!("Container {} not found, pass --name and --image explicitly", id);
    };
    let current = UpdateRequest::same_image(&container);
    Ok(UpdateRequest {
        container_name: name.unwrap_or(current.container_name),
        image_name_and_tag: image.unwrap_or(current.image_name_and_tag),
        delete_old_container: !keep_old,
    })
}

async fn update_with_progress(
    dashboard: &mut Dashboard,
    id: &str,
    request: UpdateRequest,
) -> Result<()> {
    println!(
        "Updating {} as '{}' from {}",
        id, request.container_name, request.image_name_and_tag
    );
    dashboard.update(id, request)?;

    let mut last = None;
    while !dashboard.is_idle() {
        dashboard.process_next().await;
        if let Some(state) = dashboard.action_state(id) {
            let line = match state.phase {
                Phase::Requested => "submitting".to_string(),
                _ if state.message.is_empty() => format!("{:>3}%", state.percentage),
                _ => format!("{:>3}% {}", state.percentage, state.message),
            };
            if last.as_ref() != Some(&line) {
                println!("  {}", line);
                last = Some(line);
            }
        }
    }

    if let Some(outcome) = dashboard.last_outcome(id) {
        if outcome.phase == Phase::Done {
            println!("  {:>3}% done", outcome.percentage);
        }
    }
    if print_notices(dashboard) > 0 {
        bail!("Update of {} did not succeed", id);
    }
    Ok(())
}

async fn watch(dashboard: &mut Dashboard) -> Result<()> {
    let mut auth = dashboard.auth_events();
    println!("Watching containers, press Ctrl-C to stop");

    loop {
        if let Some(result) = dashboard.maybe_auto_refresh().await {
            match result {
                Ok(_) => print_containers(&dashboard.containers().await),
                Err(e @ (ApiError::AuthExpired | ApiError::Unauthorized)) => {
                    return Err(auth_hint(e))
                }
                Err(e) => eprintln!("Refresh failed: {}", e),
            }
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                return Ok(());
            }
            Ok(AuthEvent::Changed { authenticated: false }) = auth.recv() => {
                bail!("Logged out, run `dockhand login <secret>` to continue watching");
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
    }
}

fn print_containers(containers: &[Container]) {
    println!("{:<14} {:<28} {:<11} {:<40} {}", "ID", "NAME", "STATUS", "IMAGE", "UPDATE");
    for c in containers {
        println!(
            "{:<14} {:<28} {:<11} {:<40} {}",
            short_id(&c.id),
            c.name,
            c.status.to_string(),
            c.image,
            if c.has_update { "available" } else { "" }
        );
    }
}

fn short_id(id: &str) -> &str {
    let id = id.strip_prefix("sha256:").unwrap_or(id);
    id.get(..12).unwrap_or(id)
}

/// Prints and drains notices; returns how many were failures.
fn print_notices(dashboard: &mut Dashboard) -> usize {
    let notices = dashboard.take_notices();
    notices
        .iter()
        .inspect(|n| print_notice(n))
        .filter(|n| matches!(n, Notice::Error(_)))
        .count()
}

fn print_notice(notice: &Notice) {
    match notice {
        Notice::Info(msg) => println!("{}", msg),
        Notice::Success { message, .. } => println!("✓ {}", message),
        Notice::Warning { message, .. } => eprintln!("! {}", message),
        Notice::Error(failure) => {
            match &failure.entity_id {
                Some(id) => eprintln!("✗ {}: {}", id, failure.message),
                None => eprintln!("✗ {}", failure.message),
            }
            for suggestion in &failure.suggestions {
                eprintln!("    • {}", suggestion);
            }
        }
    }
}

fn log_history(dashboard: &Dashboard) {
    for op in dashboard.history() {
        let status = match &op.status {
            OperationStatus::Failed(reason) => format!("failed ({})", reason),
            other => format!("{:?}", other).to_lowercase(),
        };
        debug!(
            "{} - {} [{}] in {:?}",
            op.id,
            op.description,
            status,
            op.duration().unwrap_or_default()
        );
    }
}
