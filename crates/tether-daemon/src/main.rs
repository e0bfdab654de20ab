//! Tether daemon: serves the control-plane protocol on a WebSocket port.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tether_core::protocol::{kinds, Message};
use tether_core::shell::ShellMode;
use tether_core::{Credential, Orchestrator, RepoConfig, RepoManager, ToolConfig, Workspace};
use tether_http::{ServerConfig, ServerState};

#[derive(Parser, Debug)]
#[command(name = "tether-daemon")]
#[command(about = "Remote control plane for AI coding agents", long_about = None)]
struct Args {
    /// Host to bind to
    #[arg(long, env = "TETHER_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(long, env = "TETHER_PORT", default_value_t = 8787)]
    port: u16,

    /// Shared secret clients must present
    #[arg(long, env = "TETHER_SECRET", hide_env_values = true)]
    secret: String,

    /// Directory holding one working copy per target
    #[arg(long, env = "TETHER_WORKSPACE_ROOT")]
    workspace_root: Option<PathBuf>,

    /// Token used for authenticated clone and push
    #[arg(long, env = "TETHER_GIT_TOKEN", hide_env_values = true)]
    git_token: Option<String>,

    /// Base URL (or local directory) remotes live under
    #[arg(long, env = "TETHER_REMOTE_BASE", default_value = "https://github.com")]
    remote_base: String,

    /// AI tool binary
    #[arg(long, env = "TETHER_TOOL", default_value = "claude")]
    tool_path: String,

    /// Argument passed to the tool before the prompt (repeatable)
    #[arg(long = "tool-arg", allow_hyphen_values = true)]
    tool_args: Vec<String>,

    /// Run the tool directly instead of through a login shell
    #[arg(long)]
    no_login_shell: bool,

    /// Directory for per-target transcript files
    #[arg(long, env = "TETHER_LOG_DIR")]
    log_dir: Option<PathBuf>,
}

impl Args {
    fn addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }

    fn tool_config(&self) -> ToolConfig {
        let mut tool = ToolConfig::default()
            .binary_path(self.tool_path.as_str())
            .log_dir(self.log_dir.clone());
        if !self.tool_args.is_empty() {
            tool = tool.args(self.tool_args.clone());
        }
        if self.no_login_shell {
            tool = tool.shell(ShellMode::Direct);
        }
        tool
    }

    fn workspace_root(&self) -> Result<PathBuf, String> {
        match &self.workspace_root {
            Some(root) => Ok(root.clone()),
            None => tether_core::paths::default_workspace_root()
                .ok_or_else(|| "Home directory not set; pass --workspace-root".to_string()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        log::error!("{}", e);
        return Err(e);
    }
    Ok(())
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let addr = args.addr()?;
    let root = args.workspace_root()?;
    std::fs::create_dir_all(&root)
        .map_err(|e| format!("Cannot create workspace root {}: {}", root.display(), e))?;
    log::info!("Workspace root: {}", root.display());

    let workspace = Workspace::new(&root);
    let repos = RepoManager::new(
        workspace.clone(),
        RepoConfig::default().remote_base(args.remote_base.as_str()),
    );
    let orchestrator = Orchestrator::new(args.tool_config(), workspace);
    if !orchestrator.is_available().await {
        log::warn!("Tool '{}' is not available; execute_command will fail", args.tool_path);
    }

    let state = ServerState::new(
        ServerConfig::new(args.secret.as_str()),
        Arc::new(repos),
        Arc::new(orchestrator),
    )
    .with_credential(args.git_token.as_deref().filter(|t| !t.is_empty()).map(Credential::new));

    let mut handle = tether_http::start(Arc::new(state), addr).await?;
    log::info!("Tether daemon listening on ws://{}/ws", handle.local_addr());

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down");
    let notified = handle
        .state()
        .broadcast(&Message::new(kinds::SERVER_SHUTDOWN, serde_json::Value::Null));
    log::debug!("Notified {} client(s)", notified);
    handle.stop().await;
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_only_secret_given() {
        let args = Args::try_parse_from(["tether-daemon", "--secret", "s3cret"]).unwrap();
        assert_eq!(args.addr().unwrap(), "127.0.0.1:8787".parse().unwrap());
        assert_eq!(args.remote_base, "https://github.com");

        let tool = args.tool_config();
        assert_eq!(tool.binary_path, "claude");
        assert_eq!(tool.args, vec!["--permission-mode", "acceptEdits"]);
        assert_eq!(tool.shell, ShellMode::default());
    }

    #[test]
    fn secret_is_required() {
        std::env::remove_var("TETHER_SECRET");
        assert!(Args::try_parse_from(["tether-daemon"]).is_err());
    }

    #[test]
    fn tool_flags_override_defaults() {
        let args = Args::try_parse_from([
            "tether-daemon",
            "--secret",
            "s3cret",
            "--tool-path",
            "/opt/bin/agent",
            "--tool-arg",
            "--yes",
            "--tool-arg",
            "--quiet",
            "--no-login-shell",
            "--log-dir",
            "/tmp/transcripts",
        ])
        .unwrap();

        let tool = args.tool_config();
        assert_eq!(tool.binary_path, "/opt/bin/agent");
        assert_eq!(tool.args, vec!["--yes", "--quiet"]);
        assert_eq!(tool.shell, ShellMode::Direct);
        assert_eq!(tool.log_dir, Some(PathBuf::from("/tmp/transcripts")));
    }

    #[test]
    fn bad_host_is_reported() {
        let args =
            Args::try_parse_from(["tether-daemon", "--secret", "x", "--host", "not a host"]).unwrap();
        assert!(args.addr().is_err());
    }
}
