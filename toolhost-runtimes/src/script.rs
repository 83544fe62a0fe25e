//! Script runtime: native sandboxed interpreter, builtin worker, or stub.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use toolhost_primitives::ServerManifest;
use toolhost_transport::{CHANNEL_CAPACITY, ChannelTransport, spawn_local};
use tracing::{debug, info, trace, warn};

use crate::builtin::{BuiltinWorker, builtin_registry};
use crate::context::RuntimeContext;
use crate::stub::StubPeer;
use crate::{Launched, RuntimeError, RuntimeFlavour, RuntimeResult};

pub(crate) async fn launch(
    manifest: &ServerManifest,
    ctx: &RuntimeContext,
) -> RuntimeResult<Launched> {
    let env = ctx.script_environment(manifest).await?;
    let has_script = manifest.script_path().is_some() || manifest.script_source().is_some();

    if let (Some(command), true) = (&ctx.script.command, has_script) {
        match spawn_native(command, manifest, ctx, env).await {
            Ok(transport) => {
                return Ok(Launched::new(transport, RuntimeFlavour::NativeScript));
            }
            Err(err) => {
                warn!(server_id = %manifest.id(), command, error = %err, "native script runtime unavailable, falling back");
            }
        }
    }

    if let Some(registry) = builtin_registry(manifest.id().as_str()) {
        debug!(server_id = %manifest.id(), "starting builtin worker");
        let transport = spawn_local(manifest.id().to_string(), Arc::new(BuiltinWorker::new(registry)));
        return Ok(Launched::new(transport, RuntimeFlavour::Builtin));
    }

    info!(server_id = %manifest.id(), "no runnable script implementation, starting stub");
    let stub = StubPeer::new(manifest.name(), manifest.tools().to_vec());
    Ok(Launched::new(
        spawn_local(manifest.id().to_string(), Arc::new(stub)),
        RuntimeFlavour::Stub,
    ))
}

/// Builds the permission flags granted to the interpreter from the manifest's
/// capability declarations.
pub(crate) fn permission_flags(manifest: &ServerManifest, env: &HashMap<String, String>) -> Vec<String> {
    fn joined(paths: &[PathBuf]) -> String {
        paths
            .iter()
            .map(|path| path.display().to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    let capabilities = manifest.capabilities();
    let mut flags = vec!["--no-prompt".to_owned()];
    if !capabilities.network.hosts.is_empty() {
        flags.push(format!("--allow-net={}", capabilities.network.hosts.join(",")));
    }
    if !capabilities.filesystem.read.is_empty() {
        flags.push(format!("--allow-read={}", joined(&capabilities.filesystem.read)));
    }
    if !capabilities.filesystem.write.is_empty() {
        flags.push(format!("--allow-write={}", joined(&capabilities.filesystem.write)));
    }
    if !env.is_empty() {
        let mut names: Vec<&str> = env.keys().map(String::as_str).collect();
        names.sort_unstable();
        flags.push(format!("--allow-env={}", names.join(",")));
    }
    flags
}

async fn spawn_native(
    command: &str,
    manifest: &ServerManifest,
    ctx: &RuntimeContext,
    env: HashMap<String, String>,
) -> RuntimeResult<Arc<ChannelTransport>> {
    let server_id = manifest.id().to_string();

    let (entry, scratch) = match (manifest.script_path(), manifest.script_source()) {
        (Some(path), _) => (path.clone(), None),
        (None, Some(source)) => {
            let file = tempfile::Builder::new()
                .prefix("toolhost-")
                .suffix(".js")
                .tempfile()?;
            tokio::fs::write(file.path(), source).await?;
            (file.path().to_path_buf(), Some(file))
        }
        (None, None) => {
            return Err(RuntimeError::InvalidManifest {
                reason: "script runtime needs scriptPath or scriptSource".into(),
            });
        }
    };

    let flags = permission_flags(manifest, &env);
    let mut child = Command::new(command)
        .args(&ctx.script.args)
        .args(&flags)
        .arg(&entry)
        .envs(&env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| RuntimeError::Spawn {
            command: command.to_owned(),
            reason: err.to_string(),
        })?;

    let missing = |stream: &str| RuntimeError::Spawn {
        command: command.to_owned(),
        reason: format!("failed to capture {stream}"),
    };
    let mut stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

    let (out_tx, mut out_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
    let transport = ChannelTransport::spawn(server_id.clone(), out_tx, in_rx, ctx.host.clone());

    let label = server_id.clone();
    transport.attach_task(tokio::spawn(async move {
        while let Some(mut line) = out_rx.recv().await {
            line.push('\n');
            if let Err(err) = stdin.write_all(line.as_bytes()).await {
                warn!(server_id = %label, error = %err, "failed writing to script stdin");
                break;
            }
            if stdin.flush().await.is_err() {
                break;
            }
        }
    }));

    let label = server_id.clone();
    transport.attach_task(tokio::spawn(async move {
        // Owning the child and the scratch file here ties their lifetime to
        // the transport: aborting this task kills the process.
        let _scratch = scratch;
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if in_tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!(server_id = %label, "script stdout closed");
                    break;
                }
                Err(err) => {
                    warn!(server_id = %label, error = %err, "error reading script stdout");
                    break;
                }
            }
        }
        match child.wait().await {
            Ok(status) => debug!(server_id = %label, %status, "script exited"),
            Err(err) => warn!(server_id = %label, error = %err, "failed to reap script"),
        }
    }));

    let label = server_id;
    transport.attach_task(tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            trace!(server_id = %label, line, "script stderr");
        }
    }));

    Ok(transport)
}
