use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use launchpad::config::Settings;
use launchpad::service::server;
use launchpad::service::template::{TemplateRenderer, unresolved_placeholders};
use launchpad_common::ProjectConfig;

#[derive(Parser)]
#[command(name = "launchpad")]
#[command(version, about = "Provision GitHub repositories from project templates")]
pub struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the API server
    Serve {
        /// Port to serve on (overrides PORT and the config file)
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind (overrides HOST and the config file)
        #[arg(long)]
        host: Option<String>,

        /// Path to a launchpad.toml
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Render a template directory locally without touching GitHub
    Render(RenderArgs),
}

#[derive(Args)]
pub struct RenderArgs {
    /// Template root to render
    #[arg(long)]
    pub template_dir: PathBuf,

    /// Directory the rendered files are written to
    #[arg(long)]
    pub out: PathBuf,

    /// Project name substituted for {{PROJECT_NAME}}
    #[arg(long)]
    pub name: String,

    #[arg(long)]
    pub description: Option<String>,

    #[arg(long)]
    pub github_username: Option<String>,

    #[arg(long)]
    pub repo_url: Option<String>,

    #[arg(long)]
    pub supabase_url: Option<String>,

    #[arg(long)]
    pub supabase_anon_key: Option<String>,

    #[arg(long)]
    pub supabase_service_key: Option<String>,

    #[arg(long)]
    pub supabase_project_id: Option<String>,
}

impl RenderArgs {
    fn project_config(&self) -> ProjectConfig {
        ProjectConfig {
            name: Some(self.name.clone()),
            description: self.description.clone(),
            github_username: self.github_username.clone(),
            repo_url: self.repo_url.clone(),
            supabase_url: self.supabase_url.clone(),
            supabase_anon_key: self.supabase_anon_key.clone(),
            supabase_service_key: self.supabase_service_key.clone(),
            supabase_project_id: self.supabase_project_id.clone(),
        }
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let default_filter = if verbose {
        "launchpad=debug,tower_http=debug"
    } else {
        "launchpad=info,tower_http=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    match &cli.command {
        Commands::Serve { port, host, config } => {
            let mut settings = Settings::resolve(config.as_deref())?;
            if let Some(port) = port {
                settings.port = *port;
            }
            if let Some(host) = host {
                settings.host = host.clone();
            }
            server::start_server(settings).await?;
        }
        Commands::Render(args) => cmd_render(args)?,
    }

    Ok(())
}

fn cmd_render(args: &RenderArgs) -> Result<()> {
    if !args.template_dir.is_dir() {
        anyhow::bail!(
            "Template directory not found: {}",
            args.template_dir.display()
        );
    }

    let renderer = TemplateRenderer::new(args.template_dir.clone());
    let files = renderer.render(&args.project_config());

    for file in &files {
        let dest = safe_join(&args.out, &file.path)?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(&dest, file.as_bytes())
            .with_context(|| format!("Failed to write {}", dest.display()))?;

        if let Some(text) = file.as_text() {
            let leftover = unresolved_placeholders(text);
            if !leftover.is_empty() {
                tracing::warn!(path = %file.path, placeholders = ?leftover, "unresolved placeholders");
            }
        }
    }

    println!(
        "Rendered {} files into {}",
        files.len(),
        args.out.display()
    );
    Ok(())
}

/// Join a rendered relative path onto `root`, refusing anything that escapes it.
fn safe_join(root: &Path, rel: &str) -> Result<PathBuf> {
    let rel = Path::new(rel);
    let escapes = rel.components().any(|c| {
        !matches!(c, std::path::Component::Normal(_) | std::path::Component::CurDir)
    });
    if escapes {
        anyhow::bail!("Refusing to write outside output directory: {}", rel.display());
    }
    Ok(root.join(rel))
}
