use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;

use super::{
    FactGatheringError, FactRequest, GatheredFact, Gatherer, GatherersRegistry,
    BUILTIN_GATHERER_VERSION, GATHERER_EXECUTION_ERROR, RPC_PLUGIN_LOADING_ERROR,
};

pub const PLUGIN_PROTOCOL_VERSION: u32 = 1;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const CALL_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_FRAME_LENGTH: usize = 4 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("could not read plugins folder {0}: {1}")]
    FolderError(PathBuf, std::io::Error),
    #[error("could not start plugin {0}: {1}")]
    SpawnError(String, std::io::Error),
    #[error("plugin {0} handshake failed: {1}")]
    HandshakeError(String, String),
    #[error("plugin {0} is not running")]
    DeadError(String),
    #[error("plugin {0} did not answer within {1:?}")]
    TimeoutError(String, Duration),
    #[error("plugin {0} transport error: {1}")]
    TransportError(String, String),
    #[error("plugin {0} protocol error: {1}")]
    ProtocolError(String, String),
    #[error("plugin {0} failed to gather: {1}")]
    RemoteError(String, String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PluginState {
    Spawned,
    Ready,
    Dead,
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    id: u64,
    method: &'static str,
    params: GatherParams<'a>,
}

#[derive(Serialize)]
struct GatherParams<'a> {
    fact_requests: &'a [FactRequest],
}

#[derive(Deserialize)]
struct RpcResponse {
    id: u64,
    #[serde(default)]
    result: Option<Vec<GatheredFact>>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct Handshake {
    protocol_version: u32,
}

struct PluginTransport {
    stdin: FramedWrite<ChildStdin, LinesCodec>,
    stdout: FramedRead<ChildStdout, LinesCodec>,
    next_id: u64,
}

impl PluginTransport {
    async fn round_trip(
        &mut self,
        name: &str,
        fact_requests: &[FactRequest],
    ) -> Result<Vec<GatheredFact>, PluginError> {
        self.next_id += 1;
        let id = self.next_id;

        let frame = serde_json::to_string(&RpcRequest {
            id,
            method: "gather",
            params: GatherParams { fact_requests },
        })
        .map_err(|err| PluginError::ProtocolError(name.to_owned(), err.to_string()))?;

        self.stdin
            .send(frame)
            .await
            .map_err(|err| PluginError::TransportError(name.to_owned(), err.to_string()))?;

        let line = self
            .stdout
            .next()
            .await
            .ok_or_else(|| {
                PluginError::TransportError(name.to_owned(), "plugin closed its output".to_owned())
            })?
            .map_err(|err| PluginError::TransportError(name.to_owned(), err.to_string()))?;

        let response: RpcResponse = serde_json::from_str(&line)
            .map_err(|err| PluginError::ProtocolError(name.to_owned(), err.to_string()))?;

        if response.id != id {
            return Err(PluginError::ProtocolError(
                name.to_owned(),
                format!("expected response {}, got {}", id, response.id),
            ));
        }

        match (response.result, response.error) {
            (_, Some(error)) => Err(PluginError::RemoteError(name.to_owned(), error)),
            (Some(facts), None) => {
                check_reply(fact_requests, &facts)
                    .map_err(|reason| PluginError::ProtocolError(name.to_owned(), reason))?;
                Ok(facts)
            }
            (None, None) => Err(PluginError::ProtocolError(
                name.to_owned(),
                "response carries neither result nor error".to_owned(),
            )),
        }
    }
}

/// One fact per request, in request order, each carrying a value or an
/// error.
fn check_reply(fact_requests: &[FactRequest], facts: &[GatheredFact]) -> Result<(), String> {
    if facts.len() != fact_requests.len() {
        return Err(format!(
            "{} facts returned for {} requests",
            facts.len(),
            fact_requests.len()
        ));
    }

    for (index, (request, fact)) in fact_requests.iter().zip(facts).enumerate() {
        if fact.name != request.name || fact.check_id != request.check_id {
            return Err(format!(
                "fact {} is {} ({}), expected {} ({})",
                index, fact.name, fact.check_id, request.name, request.check_id
            ));
        }

        if fact.value.is_some() == fact.error.is_some() {
            return Err(format!(
                "fact {} ({}) must carry either a value or an error",
                fact.name, fact.check_id
            ));
        }
    }

    Ok(())
}

/// A gatherer living in a child process. Any transport or protocol failure
/// kills the process and moves the handle to [`PluginState::Dead`], after
/// which the registry ejects it.
pub struct PluginGatherer {
    name: String,
    executable_path: PathBuf,
    state: Arc<Mutex<PluginState>>,
    transport: tokio::sync::Mutex<PluginTransport>,
    kill: CancellationToken,
    call_timeout: Duration,
}

impl PluginGatherer {
    pub async fn spawn(
        executable_path: &Path,
        kill: CancellationToken,
    ) -> Result<Arc<PluginGatherer>, PluginError> {
        let name = plugin_name(executable_path);

        let mut child = Command::new(executable_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| PluginError::SpawnError(name.clone(), err))?;

        let state = Arc::new(Mutex::new(PluginState::Spawned));
        debug!("plugin {} spawned from {}", name, executable_path.display());

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                let _ = child.start_kill();
                return Err(PluginError::HandshakeError(
                    name,
                    "plugin standard streams are not available".to_owned(),
                ));
            }
        };

        tokio::spawn(forward_stderr(name.clone(), stderr));

        let mut stdout =
            FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH));

        if let Err(err) = handshake(&name, &mut stdout).await {
            let _ = child.start_kill();
            return Err(err);
        }

        *state.lock() = PluginState::Ready;

        tokio::spawn(watch_process(name.clone(), child, state.clone(), kill.clone()));

        Ok(Arc::new(PluginGatherer {
            name,
            executable_path: executable_path.to_owned(),
            state,
            transport: tokio::sync::Mutex::new(PluginTransport {
                stdin: FramedWrite::new(stdin, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH)),
                stdout,
                next_id: 0,
            }),
            kill,
            call_timeout: CALL_TIMEOUT,
        }))
    }

    pub fn state(&self) -> PluginState {
        *self.state.lock()
    }

    fn mark_dead(&self) {
        *self.state.lock() = PluginState::Dead;
        self.kill.cancel();
    }

    async fn call(&self, fact_requests: &[FactRequest]) -> Result<Vec<GatheredFact>, PluginError> {
        if self.state() != PluginState::Ready {
            return Err(PluginError::DeadError(self.name.clone()));
        }

        let mut transport = self.transport.lock().await;

        let result = tokio::select! {
            result = tokio::time::timeout(self.call_timeout, transport.round_trip(&self.name, fact_requests)) => {
                result.unwrap_or_else(|_| Err(PluginError::TimeoutError(self.name.clone(), self.call_timeout)))
            }
            _ = self.kill.cancelled() => Err(PluginError::DeadError(self.name.clone())),
        };

        match &result {
            Ok(_) | Err(PluginError::RemoteError(_, _)) => {}
            Err(err) => {
                error!(
                    "plugin {} ({}) failed, stopping it: {}",
                    self.name,
                    self.executable_path.display(),
                    err
                );
                self.mark_dead();
            }
        }

        result
    }
}

#[async_trait::async_trait]
impl Gatherer for PluginGatherer {
    async fn gather(
        &self,
        fact_requests: Vec<FactRequest>,
    ) -> Result<Vec<GatheredFact>, FactGatheringError> {
        self.call(&fact_requests).await.map_err(|err| match err {
            PluginError::RemoteError(_, _) => FactGatheringError::new(GATHERER_EXECUTION_ERROR, err),
            _ => FactGatheringError::new(RPC_PLUGIN_LOADING_ERROR, err),
        })
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn is_alive(&self) -> bool {
        self.state() == PluginState::Ready
    }
}

async fn handshake(
    name: &str,
    stdout: &mut FramedRead<ChildStdout, LinesCodec>,
) -> Result<(), PluginError> {
    let line = tokio::time::timeout(HANDSHAKE_TIMEOUT, stdout.next())
        .await
        .map_err(|_| PluginError::HandshakeError(name.to_owned(), "timed out".to_owned()))?
        .ok_or_else(|| {
            PluginError::HandshakeError(name.to_owned(), "plugin exited before handshake".to_owned())
        })?
        .map_err(|err| PluginError::HandshakeError(name.to_owned(), err.to_string()))?;

    let handshake: Handshake = serde_json::from_str(&line)
        .map_err(|err| PluginError::HandshakeError(name.to_owned(), err.to_string()))?;

    if handshake.protocol_version != PLUGIN_PROTOCOL_VERSION {
        return Err(PluginError::HandshakeError(
            name.to_owned(),
            format!(
                "unsupported protocol version {}, expected {}",
                handshake.protocol_version, PLUGIN_PROTOCOL_VERSION
            ),
        ));
    }

    Ok(())
}

async fn watch_process(
    name: String,
    mut child: Child,
    state: Arc<Mutex<PluginState>>,
    kill: CancellationToken,
) {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => warn!("plugin {} exited: {}", name, status),
            Err(err) => error!("could not wait for plugin {}: {}", name, err),
        },
        _ = kill.cancelled() => {
            if let Err(err) = child.kill().await {
                warn!("could not terminate plugin {}: {}", name, err);
            }
            debug!("plugin {} terminated", name);
        }
    }

    *state.lock() = PluginState::Dead;
    kill.cancel();
}

async fn forward_stderr(name: String, stderr: tokio::process::ChildStderr) {
    let mut lines = FramedRead::new(stderr, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH));
    while let Some(Ok(line)) = lines.next().await {
        debug!("plugin {}: {}", name, line);
    }
}

fn plugin_name(executable_path: &Path) -> String {
    executable_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| executable_path.display().to_string())
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Owns the plugin processes started from the plugins folder.
pub struct PluginLoader {
    plugins: Vec<Arc<PluginGatherer>>,
    kill: CancellationToken,
}

impl PluginLoader {
    /// Starts every executable in `folder` and registers it under its file
    /// name, replacing built-ins with the same name. Plugins failing to start
    /// are logged and skipped. A missing folder means no plugins.
    pub async fn load_plugins(
        folder: &Path,
        registry: &GatherersRegistry,
        cancel: &CancellationToken,
    ) -> Result<PluginLoader, PluginError> {
        let kill = cancel.child_token();
        let mut loader = PluginLoader {
            plugins: Vec::new(),
            kill,
        };

        if !folder.exists() {
            info!("plugins folder {} does not exist, no plugins loaded", folder.display());
            return Ok(loader);
        }

        let entries = std::fs::read_dir(folder)
            .map_err(|err| PluginError::FolderError(folder.to_owned(), err))?;

        let executables: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| is_executable(path))
            .collect();

        let spawned = futures::future::join_all(
            executables
                .iter()
                .map(|path| PluginGatherer::spawn(path, loader.kill.child_token())),
        )
        .await;

        for (path, result) in executables.iter().zip(spawned) {
            match result {
                Ok(plugin) => {
                    info!("plugin {} loaded from {}", plugin.name(), path.display());
                    registry.register(&plugin.name(), BUILTIN_GATHERER_VERSION, plugin.clone());
                    loader.plugins.push(plugin);
                }
                Err(err) => error!("could not load plugin {}: {}", path.display(), err),
            }
        }

        Ok(loader)
    }

    pub fn plugins(&self) -> &[Arc<PluginGatherer>] {
        &self.plugins
    }

    /// Terminates every plugin process.
    pub fn shutdown(&self) {
        debug!("stopping {} plugins", self.plugins.len());
        self.kill.cancel();
    }
}

impl Drop for PluginLoader {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatherers::{FactValue, GatherersRegistryBuilder, MockGatherer};
    use serial_test::serial;

    const ECHO_PLUGIN: &str = r#"#!/bin/sh
echo '{"protocol_version":1}'
while IFS= read -r line; do
  id=$(echo "$line" | sed -n 's/^{"id":\([0-9]*\),.*/\1/p')
  echo "{\"id\":$id,\"result\":[{\"name\":\"n1\",\"check_id\":\"c1\",\"value\":\"from-plugin\"}]}"
done
"#;

    const CRASHING_PLUGIN: &str = r#"#!/bin/sh
echo '{"protocol_version":1}'
read -r line
exit 1
"#;

    const FAILING_PLUGIN: &str = r#"#!/bin/sh
echo '{"protocol_version":1}'
while IFS= read -r line; do
  id=$(echo "$line" | sed -n 's/^{"id":\([0-9]*\),.*/\1/p')
  echo "{\"id\":$id,\"error\":\"backend unavailable\"}"
done
"#;

    const SHUFFLING_PLUGIN: &str = r#"#!/bin/sh
echo '{"protocol_version":1}'
while IFS= read -r line; do
  id=$(echo "$line" | sed -n 's/^{"id":\([0-9]*\),.*/\1/p')
  echo "{\"id\":$id,\"result\":[{\"name\":\"n2\",\"check_id\":\"c2\",\"value\":2},{\"name\":\"n1\",\"check_id\":\"c1\",\"value\":1}]}"
done
"#;

    const AMBIGUOUS_PLUGIN: &str = r#"#!/bin/sh
echo '{"protocol_version":1}'
while IFS= read -r line; do
  id=$(echo "$line" | sed -n 's/^{"id":\([0-9]*\),.*/\1/p')
  echo "{\"id\":$id,\"result\":[{\"name\":\"n1\",\"check_id\":\"c1\",\"value\":1,\"error\":{\"kind\":\"parse-error\",\"message\":\"bad\"}},{\"name\":\"n2\",\"check_id\":\"c2\"}]}"
done
"#;

    const SILENT_PLUGIN: &str = "#!/bin/sh\necho 'hello'\nsleep 10\n";

    fn write_plugin(folder: &Path, name: &str, script: &str, mode: u32) -> PathBuf {
        let path = folder.join(name);
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    fn request(name: &str, gatherer: &str) -> FactRequest {
        FactRequest {
            argument: String::new(),
            check_id: "c1".to_owned(),
            gatherer: gatherer.to_owned(),
            name: name.to_owned(),
        }
    }

    fn empty_registry() -> GatherersRegistry {
        GatherersRegistryBuilder::new().build_registry()
    }

    #[tokio::test]
    #[serial]
    async fn test_load_plugins_registers_executables_only() {
        let folder = tempfile::tempdir().unwrap();
        write_plugin(folder.path(), "echo", ECHO_PLUGIN, 0o755);
        write_plugin(folder.path(), "not_executable", ECHO_PLUGIN, 0o644);
        write_plugin(folder.path(), "silent", SILENT_PLUGIN, 0o755);

        let registry = empty_registry();
        let cancel = CancellationToken::new();
        let loader = PluginLoader::load_plugins(folder.path(), &registry, &cancel)
            .await
            .unwrap();

        assert_eq!(registry.names(), vec!["echo"]);
        assert_eq!(loader.plugins().len(), 1);
        assert_eq!(loader.plugins()[0].state(), PluginState::Ready);

        let facts = registry
            .resolve("echo")
            .unwrap()
            .gather(vec![request("n1", "echo")])
            .await
            .unwrap();

        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].value, Some(FactValue::from("from-plugin")));

        loader.shutdown();
    }

    #[tokio::test]
    #[serial]
    async fn test_plugin_overrides_builtin() {
        let folder = tempfile::tempdir().unwrap();
        write_plugin(folder.path(), "systemd", ECHO_PLUGIN, 0o755);

        let mut builtin = MockGatherer::new();
        builtin.expect_name().returning(|| "builtin".to_owned());
        let mut builder = GatherersRegistryBuilder::new();
        builder.add_gatherer("systemd", BUILTIN_GATHERER_VERSION, builtin);
        let registry = builder.build_registry();

        let cancel = CancellationToken::new();
        let _loader = PluginLoader::load_plugins(folder.path(), &registry, &cancel)
            .await
            .unwrap();

        let gatherer = registry.resolve("systemd").unwrap();
        assert_eq!(gatherer.name(), "systemd");
        let facts = gatherer.gather(vec![request("n1", "systemd")]).await.unwrap();
        assert_eq!(facts[0].value, Some(FactValue::from("from-plugin")));
    }

    #[tokio::test]
    #[serial]
    async fn test_crashing_plugin_is_ejected() {
        let folder = tempfile::tempdir().unwrap();
        write_plugin(folder.path(), "crashing", CRASHING_PLUGIN, 0o755);

        let registry = empty_registry();
        let cancel = CancellationToken::new();
        let loader = PluginLoader::load_plugins(folder.path(), &registry, &cancel)
            .await
            .unwrap();

        let gatherer = registry.resolve("crashing").unwrap();
        let error = gatherer
            .gather(vec![request("n1", "crashing"), request("n2", "crashing")])
            .await
            .unwrap_err();

        assert_eq!(error.kind, RPC_PLUGIN_LOADING_ERROR);
        assert_eq!(loader.plugins()[0].state(), PluginState::Dead);
        assert!(registry.resolve("crashing").is_none());
    }

    #[tokio::test]
    #[serial]
    async fn test_malformed_replies_kill_the_plugin() {
        let folder = tempfile::tempdir().unwrap();
        write_plugin(folder.path(), "shuffling", SHUFFLING_PLUGIN, 0o755);
        write_plugin(folder.path(), "ambiguous", AMBIGUOUS_PLUGIN, 0o755);

        let registry = empty_registry();
        let cancel = CancellationToken::new();
        let loader = PluginLoader::load_plugins(folder.path(), &registry, &cancel)
            .await
            .unwrap();
        assert_eq!(registry.names(), vec!["ambiguous", "shuffling"]);

        for name in ["shuffling", "ambiguous"] {
            let requests = vec![
                FactRequest {
                    check_id: "c1".to_owned(),
                    ..request("n1", name)
                },
                FactRequest {
                    check_id: "c2".to_owned(),
                    ..request("n2", name)
                },
            ];

            let error = registry
                .resolve(name)
                .unwrap()
                .gather(requests)
                .await
                .unwrap_err();

            assert_eq!(error.kind, RPC_PLUGIN_LOADING_ERROR);
            assert!(error.message.contains("protocol error"));
            assert!(registry.resolve(name).is_none());
        }

        assert!(loader
            .plugins()
            .iter()
            .all(|plugin| plugin.state() == PluginState::Dead));
    }

    #[test]
    fn test_check_reply() {
        let requests = vec![request("n1", "p"), request("n2", "p")];
        let valid = vec![
            GatheredFact::with_value(&requests[0], FactValue::Int(1)),
            GatheredFact::with_error(&requests[1], FactGatheringError::parse("bad")),
        ];
        assert_eq!(check_reply(&requests, &valid), Ok(()));

        assert!(check_reply(&requests, &valid[..1]).is_err());

        let swapped = vec![valid[1].clone(), valid[0].clone()];
        assert!(check_reply(&requests, &swapped).is_err());

        let mut both = valid.clone();
        both[0].error = Some(FactGatheringError::parse("bad"));
        assert!(check_reply(&requests, &both).is_err());

        let mut neither = valid;
        neither[1].error = None;
        assert!(check_reply(&requests, &neither).is_err());
    }

    #[tokio::test]
    #[serial]
    async fn test_plugin_reported_error_keeps_it_alive() {
        let folder = tempfile::tempdir().unwrap();
        write_plugin(folder.path(), "failing", FAILING_PLUGIN, 0o755);

        let registry = empty_registry();
        let cancel = CancellationToken::new();
        let _loader = PluginLoader::load_plugins(folder.path(), &registry, &cancel)
            .await
            .unwrap();

        let gatherer = registry.resolve("failing").unwrap();
        let error = gatherer.gather(vec![request("n1", "failing")]).await.unwrap_err();

        assert_eq!(error.kind, GATHERER_EXECUTION_ERROR);
        assert!(error.message.contains("backend unavailable"));
        assert!(registry.resolve("failing").is_some());
    }

    #[tokio::test]
    #[serial]
    async fn test_cancellation_stops_plugins() {
        let folder = tempfile::tempdir().unwrap();
        write_plugin(folder.path(), "echo", ECHO_PLUGIN, 0o755);

        let registry = empty_registry();
        let cancel = CancellationToken::new();
        let loader = PluginLoader::load_plugins(folder.path(), &registry, &cancel)
            .await
            .unwrap();

        cancel.cancel();

        let plugin = loader.plugins()[0].clone();
        tokio::time::timeout(Duration::from_secs(5), async {
            while plugin.state() != PluginState::Dead {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(registry.resolve("echo").is_none());
    }

    #[tokio::test]
    async fn test_missing_plugins_folder() {
        let registry = empty_registry();
        let cancel = CancellationToken::new();

        let loader = PluginLoader::load_plugins(Path::new("/nonexistent/plugins"), &registry, &cancel)
            .await
            .unwrap();

        assert!(loader.plugins().is_empty());
    }
}
