//! telenotes CLI
//!
//! Usage:
//!   telenotes serve                                     Run the Telegram bot
//!   telenotes browse --repo owner/name [--path P]       Show the picker grid
//!   telenotes append --repo owner/name --file F TEXT    Append a note directly

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use secrecy::SecretString;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn, Level};

use telenotes::browser::{RemoteTreeBrowser, TargetKind};
use telenotes::providers::{GitHubFactory, ProviderFactory, RepoRef};
use telenotes::transport::TelegramTransport;
use telenotes::{BotConfig, CodecRegistry, Dispatcher, NoteAppender, SqliteUserStore, UserAccount};

#[derive(Parser)]
#[command(
    name = "telenotes",
    about = "telenotes: keep notes in a GitHub repository from a Telegram chat",
    version
)]
struct Cli {
    /// Config file (JSON). Defaults to <config dir>/telenotes/config.json
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot with Telegram long polling
    Serve,
    /// Render the file or folder picker for a repository path
    Browse {
        /// Environment variable holding the GitHub token
        #[arg(long, default_value = "GITHUB_TOKEN")]
        token_env: String,
        /// Repository as owner/name
        #[arg(long)]
        repo: String,
        #[arg(long, default_value = "main")]
        branch: String,
        #[arg(long, default_value = "/")]
        path: String,
        /// Folder picker instead of file picker
        #[arg(long)]
        folders: bool,
    },
    /// Append a note to a repository file
    Append {
        /// Environment variable holding the GitHub token
        #[arg(long, default_value = "GITHUB_TOKEN")]
        token_env: String,
        /// Repository as owner/name
        #[arg(long)]
        repo: String,
        #[arg(long, default_value = "main")]
        branch: String,
        /// Note file path inside the repository
        #[arg(long)]
        file: String,
        text: String,
    },
}

fn init_logging(level: &str) {
    let parsed = Level::from_str(level).ok();
    tracing_subscriber::fmt()
        .with_max_level(parsed.unwrap_or(Level::INFO))
        .with_target(false)
        .init();
    if parsed.is_none() {
        warn!("Unknown log level '{}', using info", level);
    }
}

fn token_from_env(var: &str) -> Result<SecretString> {
    let token = std::env::var(var).with_context(|| format!("{} is not set", var))?;
    Ok(SecretString::from(token))
}

async fn serve(config: &BotConfig) -> Result<()> {
    let token = config.require_token()?.clone();
    let store = Arc::new(
        SqliteUserStore::open(&config.database_path)
            .with_context(|| format!("opening {}", config.database_path.display()))?,
    );
    let transport = Arc::new(TelegramTransport::new(
        token,
        &config.telegram_api_base,
        config.poll_timeout_secs,
    )?);
    let factory = Arc::new(GitHubFactory::new(config.github_api_base.clone()));
    let registry = CodecRegistry::new();
    let dispatcher = Arc::new(Dispatcher::new(transport.clone(), store, factory, &registry)?);

    info!("telenotes {} serving", env!("CARGO_PKG_VERSION"));
    dispatcher.run(transport.as_ref()).await?;
    Ok(())
}

async fn browse(
    config: &BotConfig,
    token_env: &str,
    repo: &str,
    branch: &str,
    path: &str,
    folders: bool,
) -> Result<()> {
    let credential = token_from_env(token_env)?;
    let provider = GitHubFactory::new(config.github_api_base.clone()).connect(&credential)?;
    let registry = CodecRegistry::new();
    let codec = registry.register("cli")?;
    let target = if folders { TargetKind::Directory } else { TargetKind::File };
    let browser = RemoteTreeBrowser::new(provider, RepoRef::parse(repo)?, branch, target, codec.clone());

    let view = browser.render(path).await?;
    println!("{}", view.text);
    for row in &view.rows {
        let cells: Vec<String> = row
            .iter()
            .map(|button| match codec.decode(&button.token) {
                Ok(token) => format!("[{}] -> {:?} {}", button.label, token.action, token.path),
                Err(_) => format!("[{}]", button.label),
            })
            .collect();
        println!("  {}", cells.join("   "));
    }
    Ok(())
}

async fn append(
    config: &BotConfig,
    token_env: &str,
    repo: &str,
    branch: &str,
    file: &str,
    text: &str,
) -> Result<()> {
    let credential = token_from_env(token_env)?;
    let repo = RepoRef::parse(repo)?;
    let mut account = UserAccount::pending(0, credential, repo.full_name(), branch, file);
    account.registered = true;

    let appender = NoteAppender::new(Arc::new(GitHubFactory::new(config.github_api_base.clone())));
    let outcome = appender.append_note(&account, text).await?;
    println!(
        "Appended to {} on {}@{}: commit {}",
        outcome.path, repo, branch, outcome.commit_sha
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = BotConfig::load(cli.config.as_deref()).context("loading configuration")?;
    init_logging(&config.log_level);

    match &cli.command {
        Commands::Serve => serve(&config).await,
        Commands::Browse {
            token_env,
            repo,
            branch,
            path,
            folders,
        } => browse(&config, token_env, repo, branch, path, *folders).await,
        Commands::Append {
            token_env,
            repo,
            branch,
            file,
            text,
        } => append(&config, token_env, repo, branch, file, text).await,
    }
}
