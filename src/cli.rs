use clap::Parser;
use color_eyre::eyre::{eyre, Result};
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;

pub const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "+", env!("BUILD_NUMBER"));

const GIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "citop", version = VERSION, about = "Monitor CI builds from the terminal")]
pub struct Cli {
    /// Repository URL (auto-detected from the `origin` remote)
    #[arg(short, long)]
    pub repo: Option<String>,

    /// CI account backed by an external program, as ACCOUNT=PROGRAM [ARGS...]
    #[arg(
        short,
        long = "provider",
        value_name = "ACCOUNT=PROGRAM",
        value_parser = parse_provider,
        required = true
    )]
    pub providers: Vec<ProviderSpec>,

    /// Poll interval in seconds
    #[arg(short, long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    pub interval: u64,

    /// Maximum number of builds fetched per provider
    #[arg(short, long, default_value_t = 20)]
    pub limit: usize,

    /// Directory receiving exported logs (defaults to the system temp directory)
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Write debug logs to $XDG_STATE_HOME/citop/debug.log
    #[arg(long)]
    pub verbose: bool,
}

impl Cli {
    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// A provider registered on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSpec {
    pub account_id: String,
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Parses `ACCOUNT=PROGRAM [ARGS...]`. Arguments are separated by whitespace.
pub fn parse_provider(s: &str) -> Result<ProviderSpec, String> {
    let (account, command) = s
        .split_once('=')
        .ok_or_else(|| format!("expected ACCOUNT=PROGRAM, got '{s}'"))?;
    let account = account.trim();
    if account.is_empty() {
        return Err("account name must not be empty".to_string());
    }
    if account.contains('/') {
        return Err(format!("account name '{account}' must not contain '/'"));
    }
    let mut words = command.split_whitespace();
    let program = words
        .next()
        .ok_or_else(|| format!("missing program for account '{account}'"))?;
    Ok(ProviderSpec {
        account_id: account.to_string(),
        program: PathBuf::from(program),
        args: words.map(str::to_string).collect(),
    })
}

/// Rejects repository URLs the providers could never match.
pub fn validate_repository_url(url: &str) -> Result<()> {
    if url.trim().is_empty() {
        return Err(eyre!("Repository URL must not be empty"));
    }
    if url.chars().any(char::is_whitespace) {
        return Err(eyre!("Invalid repository URL '{url}': contains whitespace"));
    }
    Ok(())
}

/// URL of the `origin` remote of the repository in the current directory.
pub async fn detect_repository_url() -> Result<String> {
    let output = tokio::time::timeout(
        GIT_TIMEOUT,
        Command::new("git")
            .args(["remote", "get-url", "origin"])
            .output(),
    )
    .await
    .map_err(|_| eyre!("git command timed out after {}s", GIT_TIMEOUT.as_secs()))?
    .map_err(|e| eyre!("Failed to detect repository: {e}"))?;

    if !output.status.success() {
        return Err(eyre!(
            "Could not detect repository ({}). Use --repo flag.",
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if url.is_empty() {
        return Err(eyre!("Could not detect repository. Use --repo flag."));
    }
    Ok(url)
}
