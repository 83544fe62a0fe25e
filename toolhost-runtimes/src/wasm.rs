//! WebAssembly runtime: one isolated, fuel-metered WASI instance per request.
//!
//! The module is a WASI command. Each request line becomes the instance's
//! stdin; every JSON line the instance prints to stdout is fed back to the
//! transport as an inbound message.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::sync::mpsc;
use toolhost_primitives::ServerManifest;
use toolhost_transport::{
    CHANNEL_CAPACITY, ChannelTransport, INTERNAL_ERROR, JsonRpcError, JsonRpcRequest,
    JsonRpcResponse,
};
use tracing::{debug, warn};
use wasmtime::{Config, Engine, Linker, Module, Store};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::p2::pipe::{MemoryInputPipe, MemoryOutputPipe};
use wasmtime_wasi::{DirPerms, FilePerms, I32Exit, WasiCtxBuilder};

use crate::context::RuntimeContext;
use crate::{Launched, RuntimeError, RuntimeFlavour, RuntimeResult};

/// Upper bound on what one request may print.
const MAX_STDOUT_BYTES: usize = 4 * 1024 * 1024;

/// Compiled module plus the settings every instance is created with.
#[derive(Clone)]
struct WasmProgram {
    engine: Engine,
    module: Module,
    linker: Arc<Linker<WasiP1Ctx>>,
    fuel_per_call: u64,
    manifest: Arc<ServerManifest>,
}

impl WasmProgram {
    fn compile(bytes: &[u8], manifest: ServerManifest, fuel_per_call: u64) -> RuntimeResult<Self> {
        let mut config = Config::new();
        config.consume_fuel(true);
        let engine = Engine::new(&config).map_err(RuntimeError::wasm)?;
        let module = Module::new(&engine, bytes).map_err(RuntimeError::wasm)?;

        let mut linker = Linker::new(&engine);
        preview1::add_to_linker_sync(&mut linker, |ctx: &mut WasiP1Ctx| ctx).map_err(RuntimeError::wasm)?;

        Ok(Self {
            engine,
            module,
            linker: Arc::new(linker),
            fuel_per_call,
            manifest: Arc::new(manifest),
        })
    }

    /// Runs one request to completion and returns the printed lines.
    fn run(&self, line: &str) -> RuntimeResult<Vec<String>> {
        let stdout = MemoryOutputPipe::new(MAX_STDOUT_BYTES);
        let mut builder = WasiCtxBuilder::new();
        builder
            .stdin(MemoryInputPipe::new(format!("{line}\n")))
            .stdout(stdout.clone())
            .arg(self.manifest.id().as_str());

        let filesystem = &self.manifest.capabilities().filesystem;
        for path in &filesystem.read {
            let guest = path.display().to_string();
            let writable = filesystem.write.contains(path);
            let (dir, file) = if writable {
                (DirPerms::all(), FilePerms::all())
            } else {
                (DirPerms::READ, FilePerms::READ)
            };
            builder.preopened_dir(path, guest, dir, file).map_err(RuntimeError::wasm)?;
        }
        for path in filesystem.write.iter().filter(|p| !filesystem.read.contains(p)) {
            let guest = path.display().to_string();
            builder
                .preopened_dir(path, guest, DirPerms::all(), FilePerms::all())
                .map_err(RuntimeError::wasm)?;
        }

        let mut store = Store::new(&self.engine, builder.build_p1());
        store.set_fuel(self.fuel_per_call).map_err(RuntimeError::wasm)?;

        let instance = self
            .linker
            .instantiate(&mut store, &self.module)
            .map_err(RuntimeError::wasm)?;
        let start = instance
            .get_typed_func::<(), ()>(&mut store, "_start")
            .map_err(RuntimeError::wasm)?;

        if let Err(err) = start.call(&mut store, ()) {
            match err.downcast_ref::<I32Exit>() {
                Some(I32Exit(0)) => {}
                Some(I32Exit(code)) => {
                    return Err(RuntimeError::Wasm(format!("module exited with status {code}")));
                }
                None => return Err(RuntimeError::wasm(err)),
            }
        }

        let output = stdout.contents();
        Ok(String::from_utf8_lossy(&output)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect())
    }
}

async fn module_bytes(manifest: &ServerManifest) -> RuntimeResult<Vec<u8>> {
    if let Some(encoded) = manifest.module_base64() {
        return BASE64
            .decode(encoded.trim())
            .map_err(|err| RuntimeError::InvalidManifest {
                reason: format!("moduleBase64 is not valid base64: {err}"),
            });
    }
    if let Some(path) = manifest.module_path() {
        return Ok(tokio::fs::read(path).await?);
    }
    Err(RuntimeError::InvalidManifest {
        reason: "wasm runtime needs modulePath or moduleBase64".into(),
    })
}

pub(crate) async fn launch(
    manifest: &ServerManifest,
    ctx: &RuntimeContext,
) -> RuntimeResult<Launched> {
    let bytes = module_bytes(manifest).await?;
    let owned = manifest.clone();
    let fuel = ctx.fuel_per_call;
    let program = tokio::task::spawn_blocking(move || WasmProgram::compile(&bytes, owned, fuel))
        .await
        .map_err(|err| RuntimeError::Wasm(format!("compile task failed: {err}")))??;

    let server_id = manifest.id().to_string();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
    let transport = ChannelTransport::spawn(server_id.clone(), out_tx, in_rx, ctx.host.clone());

    transport.attach_task(tokio::spawn(async move {
        while let Some(line) = out_rx.recv().await {
            let program = program.clone();
            let in_tx = in_tx.clone();
            let label = server_id.clone();
            tokio::spawn(async move {
                let id = serde_json::from_str::<JsonRpcRequest>(&line).map(|request| request.id).ok();
                let outcome = tokio::task::spawn_blocking(move || program.run(&line)).await;
                let lines = match outcome {
                    Ok(Ok(lines)) if !lines.is_empty() => lines,
                    Ok(Ok(_)) => failure_line(id, "module produced no response"),
                    Ok(Err(err)) => {
                        warn!(server_id = %label, error = %err, "wasm request failed");
                        failure_line(id, &err.to_string())
                    }
                    Err(err) => failure_line(id, &format!("wasm task failed: {err}")),
                };
                for line in lines {
                    if in_tx.send(line).await.is_err() {
                        debug!(server_id = %label, "transport gone before wasm reply");
                        break;
                    }
                }
            });
        }
    }));

    Ok(Launched::new(transport, RuntimeFlavour::Wasm))
}

fn failure_line(id: Option<u64>, message: &str) -> Vec<String> {
    let Some(id) = id else {
        return Vec::new();
    };
    let response = JsonRpcResponse::failure(id.into(), JsonRpcError::new(INTERNAL_ERROR, message));
    serde_json::to_string(&response).map(|line| vec![line]).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use serde_json::json;
    use toolhost_primitives::ServerId;
    use toolhost_transport::{METHOD_TOOLS_LIST, Transport};

    const LISTING: &str = ",\"result\":{\"tools\":[{\"name\":\"add\"}]}}\n";

    /// WASI command answering every request with a fixed tool listing. It
    /// copies the request up to the end of its `"id"` member, then appends
    /// the result. Methods starting with `s` spin until fuel runs out.
    fn listing_module() -> String {
        let data = LISTING.replace('"', "\\\"").replace('\n', "\\n");
        format!(
            r#"(module
  (import "wasi_snapshot_preview1" "fd_read" (func $fd_read (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 512) "{data}")
  (func (export "_start")
    (local $len i32)
    (local $i i32)
    (local $commas i32)
    (i32.store (i32.const 0) (i32.const 1024))
    (i32.store (i32.const 4) (i32.const 4096))
    (drop (call $fd_read (i32.const 0) (i32.const 0) (i32.const 1) (i32.const 8)))
    (local.set $len (i32.load (i32.const 8)))
    (block $found
      (loop $scan
        (br_if $found (i32.ge_u (local.get $i) (local.get $len)))
        (if (i32.eq (i32.load8_u offset=1024 (local.get $i)) (i32.const 44))
          (then
            (local.set $commas (i32.add (local.get $commas) (i32.const 1)))
            (br_if $found (i32.eq (local.get $commas) (i32.const 2)))))
        (local.set $i (i32.add (local.get $i) (i32.const 1)))
        (br $scan)))
    (if (i32.eq (i32.load8_u offset=1035 (local.get $i)) (i32.const 115))
      (then (loop $spin (br $spin))))
    (i32.store (i32.const 16) (i32.const 1024))
    (i32.store (i32.const 20) (local.get $i))
    (i32.store (i32.const 24) (i32.const 512))
    (i32.store (i32.const 28) (i32.const {len}))
    (drop (call $fd_write (i32.const 1) (i32.const 16) (i32.const 2) (i32.const 32)))))"#,
            len = LISTING.len(),
        )
    }

    fn manifest() -> ServerManifest {
        ServerManifest::builder(ServerId::new("calc").unwrap())
            .name("Calc")
            .version("1")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn missing_module_is_a_manifest_error() {
        let err = launch(&manifest(), &RuntimeContext::default())
            .await
            .err()
            .expect("no module");
        assert!(matches!(err, RuntimeError::InvalidManifest { .. }));
    }

    #[tokio::test]
    async fn invalid_module_bytes_fail_to_compile() {
        let manifest = ServerManifest::builder(ServerId::new("calc").unwrap())
            .name("Calc")
            .version("1")
            .module_base64(BASE64.encode(b"definitely not wasm"))
            .build()
            .unwrap();
        let err = launch(&manifest, &RuntimeContext::default())
            .await
            .err()
            .expect("bad module");
        assert!(matches!(err, RuntimeError::Wasm(_)));
    }

    #[test]
    fn failure_line_echoes_request_id() {
        let lines = failure_line(Some(9), "boom");
        let response: JsonRpcResponse = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(response.numeric_id(), Some(9));
        assert!(failure_line(None, "boom").is_empty());
    }

    #[tokio::test]
    async fn requests_round_trip_through_a_wasi_module() {
        let manifest = ServerManifest::builder(ServerId::new("calc").unwrap())
            .name("Calc")
            .version("1")
            .module_base64(BASE64.encode(listing_module()))
            .build()
            .unwrap();
        let ctx = RuntimeContext {
            fuel_per_call: 200_000,
            ..RuntimeContext::default()
        };
        let launched = crate::launch(&manifest, &ctx).await.unwrap();
        assert_eq!(launched.flavour, RuntimeFlavour::Wasm);
        let transport = launched.transport;

        let listed = transport
            .send(JsonRpcRequest::new(METHOD_TOOLS_LIST, None), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(listed.result, Some(json!({ "tools": [{ "name": "add" }] })));

        let starved = transport
            .send(JsonRpcRequest::new("spin", None), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(starved.error.map(|error| error.code), Some(INTERNAL_ERROR));
        assert!(!transport.is_closed());

        let again = transport
            .send(JsonRpcRequest::new(METHOD_TOOLS_LIST, None), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(again.numeric_id(), Some(3));
        assert!(again.result.is_some());
        transport.close().await;
    }
}
