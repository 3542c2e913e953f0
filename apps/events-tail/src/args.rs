use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::Parser;

use bitloops_auth::ClientConfig;
use bitloops_auth::config::default_config_path;

/// Subscribe to Bitloops topics and print every event
#[derive(Parser, Debug)]
#[command(name = "bitloops-events-tail")]
#[command(version)]
#[command(about = "Prints events from Bitloops topics to stdout", long_about = None)]
pub struct Cli {
    /// Topics to subscribe to
    #[arg(required = true, num_args = 1..)]
    pub topics: Vec<String>,

    /// Configuration file (defaults to the per-user client.toml)
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Server host and port, overriding the configuration file
    #[arg(short = 's', long = "server")]
    pub server: Option<String>,

    /// Workspace id, overriding the configuration file
    #[arg(short = 'w', long = "workspace")]
    pub workspace: Option<String>,

    /// Use plain http instead of https
    #[arg(long = "insecure")]
    pub insecure: bool,

    /// Access token of a signed-in user (used with `User` auth)
    #[arg(long = "access-token", env = "BITLOOPS_ACCESS_TOKEN")]
    pub access_token: Option<String>,

    /// Uid of the signed-in user
    #[arg(long = "uid", default_value = "cli")]
    pub uid: String,

    /// Pretty-print JSON payloads
    #[arg(long = "pretty")]
    pub pretty: bool,
}

impl Cli {
    /// Builds the client configuration from the file (if any) and flags.
    pub fn client_config(&self) -> anyhow::Result<ClientConfig> {
        let path = self.config.clone().or_else(default_config_path);

        let mut config = match path {
            Some(path) if path.exists() => ClientConfig::load(&path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            Some(path) if self.config.is_some() => {
                bail!("configuration file {} does not exist", path.display())
            }
            _ => {
                let (Some(server), Some(workspace)) = (&self.server, &self.workspace) else {
                    bail!("no configuration file found; pass --server and --workspace");
                };
                ClientConfig::new(server.as_str(), workspace.as_str())
            }
        };

        if let Some(server) = &self.server {
            config.server = server.clone();
        }
        if let Some(workspace) = &self.workspace {
            config.workspace_id = workspace.clone();
        }
        if self.insecure {
            config.ssl = false;
        }

        config.validate()?;
        Ok(config)
    }
}
