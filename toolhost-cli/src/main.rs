mod host;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use toolhost_adapters::{OpenAiAdapter, OpenAiConfig};
use toolhost_config::{DEFAULT_CONFIG_FILE, HostConfig};
use toolhost_kernel::{
    AgentEvent, AgentOptions, AgentOutcome, AgentRunner, CallContext, RunCancellation,
    RunningTool,
};
use toolhost_permissions::{GrantKind, GrantOptions, TabId};
use toolhost_primitives::{Origin, Scope, ServerId, ServerManifest, ToolKey};
use toolhost_telemetry::{TracingOptions, init_tracing};
use tracing::info;

use crate::host::Host;

#[derive(Parser)]
#[command(name = "toolhost", about = "Permission-gated tool host", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Host configuration file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Log level used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Secret made available to servers, as NAME=VALUE. Repeatable.
    #[arg(long = "secret", global = true, value_parser = parse_secret)]
    secrets: Vec<(String, String)>,
}

#[derive(Subcommand)]
enum Command {
    /// Register a server from a JSON manifest, probe its tools, and enable autostart.
    Install { manifest: PathBuf },
    /// List registered servers.
    List,
    /// Start a registered server, refresh its tools, and enable autostart.
    Start { id: ServerId },
    /// Disable autostart for a server.
    Stop { id: ServerId },
    /// Remove a server.
    Remove { id: ServerId },
    /// List tools of autostart servers, optionally as seen by an origin.
    Tools {
        #[arg(long)]
        origin: Option<Origin>,
    },
    /// Invoke a tool addressed as serverId/toolName.
    Call {
        tool: ToolKey,
        /// Arguments as a JSON object.
        #[arg(long, default_value = "{}")]
        args: String,
        /// Check this origin's grants before calling.
        #[arg(long)]
        origin: Option<Origin>,
        #[arg(long)]
        tab: Option<TabId>,
    },
    /// Grant scopes to an origin.
    Grant {
        origin: Origin,
        #[arg(long = "scope", required = true)]
        scopes: Vec<Scope>,
        /// Grant for the configured TTL instead of permanently.
        #[arg(long)]
        once: bool,
        /// Restrict calls to these serverId/toolName keys. Repeatable.
        #[arg(long = "allow")]
        allowed_tools: Vec<ToolKey>,
        #[arg(long)]
        tab: Option<TabId>,
    },
    /// Permanently deny scopes to an origin.
    Deny {
        origin: Origin,
        #[arg(long = "scope", required = true)]
        scopes: Vec<Scope>,
    },
    /// Drop every decision recorded for an origin.
    Revoke { origin: Origin },
    /// Show recorded permissions.
    Permissions,
    /// Run the tool-calling agent on a task, printing events as JSON lines.
    Run {
        task: String,
        /// Expose only these serverId/toolName keys. Repeatable.
        #[arg(long = "tool")]
        tools: Vec<ToolKey>,
        #[arg(long)]
        max_tool_calls: Option<usize>,
        /// Require `model:tools` for this origin and forward it to servers.
        #[arg(long)]
        origin: Option<Origin>,
    },
}

fn parse_secret(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .filter(|(name, _)| !name.is_empty())
        .map(|(name, value)| (name.to_owned(), value.to_owned()))
        .ok_or_else(|| format!("expected NAME=VALUE, got `{raw}`"))
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn tool_json(tool: &RunningTool) -> Value {
    json!({
        "tool": tool.key.to_string(),
        "description": tool.definition.description,
        "inputSchema": tool.definition.input_schema,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&TracingOptions::default().with_default_filter(&cli.log_level))?;

    let config = HostConfig::load(&cli.config)?;
    let host = Host::open(config, &cli.secrets).await?;
    let result = execute(&host, cli.command).await;
    host.close().await;
    result
}

async fn execute(host: &Host, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Install { manifest } => install(host, &manifest).await,
        Command::List => print_json(&host.registry.list_servers()),
        Command::Start { id } => {
            let tools = host
                .registry
                .validate_and_start_server(&id)
                .await
                .with_context(|| format!("starting `{id}`"))?;
            print_json(&tools)
        }
        Command::Stop { id } => {
            if !host.registry.set_autostart(&id, false).await? {
                bail!("server `{id}` is not registered");
            }
            Ok(())
        }
        Command::Remove { id } => {
            if !host.registry.unregister_server(&id).await? {
                bail!("server `{id}` is not registered");
            }
            Ok(())
        }
        Command::Tools { origin } => {
            host.registry.start_autostart_servers().await;
            let tools = match origin {
                Some(origin) => host.router().list_tools(&origin).await?,
                None => host.registry.running_tools(None),
            };
            print_json(&tools.iter().map(tool_json).collect::<Vec<_>>())
        }
        Command::Call {
            tool,
            args,
            origin,
            tab,
        } => call(host, &tool, &args, origin, tab).await,
        Command::Grant {
            origin,
            scopes,
            once,
            allowed_tools,
            tab,
        } => {
            let mut options = GrantOptions::default();
            if !allowed_tools.is_empty() {
                options = options.with_allowed_tools(allowed_tools.iter().map(ToString::to_string));
            }
            if let Some(tab) = tab {
                options = options.with_tab(tab);
            }
            let kind = if once { GrantKind::Once } else { GrantKind::Always };
            host.permissions
                .grant_permissions(&origin, &scopes, kind, options)
                .await?;
            print_json(&host.permissions.get_permissions(&origin).await?)
        }
        Command::Deny { origin, scopes } => {
            host.permissions.deny_permissions(&origin, &scopes).await?;
            print_json(&host.permissions.get_permissions(&origin).await?)
        }
        Command::Revoke { origin } => {
            host.permissions.revoke_permissions(&origin).await?;
            Ok(())
        }
        Command::Permissions => print_json(&host.permissions.get_all_permissions().await?),
        Command::Run {
            task,
            tools,
            max_tool_calls,
            origin,
        } => run(host, task, tools, max_tool_calls, origin).await,
    }
}

async fn install(host: &Host, path: &Path) -> anyhow::Result<()> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let manifest = ServerManifest::from_json(serde_json::from_str(&raw)?)?;
    let handle = host.registry.register_server(manifest).await?;
    let tools = host
        .registry
        .validate_and_start_server(handle.id())
        .await
        .with_context(|| format!("validating `{}`", handle.id()))?;
    info!(server_id = %handle.id(), tools = tools.len(), "server installed");
    print_json(&tools)
}

async fn call(
    host: &Host,
    tool: &ToolKey,
    args: &str,
    origin: Option<Origin>,
    tab: Option<TabId>,
) -> anyhow::Result<()> {
    let arguments: Value = serde_json::from_str(args).context("--args must be JSON")?;
    if !host.registry.start_server(tool.server_id()).await {
        bail!("server `{}` could not be started", tool.server_id());
    }
    let result = match origin {
        Some(origin) => host.router().call_tool(&origin, tool, arguments, tab).await?,
        None => {
            host.gateway()
                .call_tool(tool.server_id().as_str(), tool.tool(), arguments, None)
                .await
        }
    };
    print_json(&result)?;
    if !result.ok {
        bail!("tool call failed");
    }
    Ok(())
}

async fn run(
    host: &Host,
    task: String,
    tools: Vec<ToolKey>,
    max_tool_calls: Option<usize>,
    origin: Option<Origin>,
) -> anyhow::Result<()> {
    if let Some(origin) = &origin {
        host.permissions
            .check_permissions(origin, &[Scope::ModelTools])
            .await?;
    }
    host.registry.start_autostart_servers().await;

    let agent = &host.config.agent;
    let mut model_config = OpenAiConfig::from_env(agent.model.clone())
        .with_timeout(host.config.tool_call_timeout());
    if let Some(base_url) = &agent.base_url {
        model_config = model_config.with_base_url(base_url)?;
    }
    let runner = AgentRunner::new(Arc::new(OpenAiAdapter::new(model_config)?), host.gateway());

    let options = AgentOptions {
        max_tool_calls: max_tool_calls.unwrap_or(agent.max_tool_calls),
        tools: (!tools.is_empty()).then_some(tools),
        context: origin.map(CallContext::new),
    };
    let cancel = RunCancellation::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let outcome = runner
        .run(&task, &options, &cancel, |event: AgentEvent| {
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{line}");
            }
        })
        .await;
    ctrl_c.abort();

    match outcome {
        AgentOutcome::Completed(_) => Ok(()),
        AgentOutcome::Failed(message) => bail!(message),
        AgentOutcome::Cancelled => bail!("run cancelled"),
    }
}
