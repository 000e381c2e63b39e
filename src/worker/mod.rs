//! Restoration backed by a long-lived model process.
//!
//! The process deserializes the checkpoint once, announces itself with a
//! handshake line and then answers one JSON request per line. Only one
//! request is in flight at a time.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::checkpoint::Checkpoint;
use crate::error::{Error, Result};
use crate::restore::{RestoreParams, Restorer};

const WORKER_SCRIPT: &str = include_str!("../../assets/restore_worker.py");

#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: String,
    args: Vec<OsString>,
    envs: Vec<(String, OsString)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// `python -u <script>` with the model-code checkout importable.
    pub fn python(python: &str, script: &Path, repo_dir: &Path) -> Self {
        let repo_dir = std::path::absolute(repo_dir).unwrap_or_else(|_| repo_dir.to_path_buf());
        let mut paths = vec![repo_dir];
        if let Some(existing) = std::env::var_os("PYTHONPATH") {
            paths.extend(std::env::split_paths(&existing));
        }
        let python_path = std::env::join_paths(paths).unwrap_or_default();

        Self::new(python)
            .arg("-u")
            .arg(script.as_os_str())
            .env("PYTHONPATH", python_path)
    }
}

#[derive(Serialize)]
struct WorkerRequest<'a> {
    id: String,
    text: &'a str,
    #[serde(flatten)]
    params: &'a RestoreParams,
}

#[derive(Debug, Deserialize)]
struct Handshake {
    ready: bool,
    #[serde(default)]
    model_config: Value,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WorkerResponse {
    /// Absent when the worker could not read the request it is answering.
    id: Option<String>,
    result: Option<Value>,
    error: Option<String>,
}

struct WorkerIo {
    // kept so the process is killed with the worker
    _child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl WorkerIo {
    /// Next stdout line that parses as a JSON object; anything else is noise
    /// from the model libraries.
    async fn next_message(&mut self) -> Result<Value> {
        loop {
            let line = self.stdout.next_line().await?.ok_or(Error::WorkerExited)?;
            match serde_json::from_str::<Value>(&line) {
                Ok(value @ Value::Object(_)) => return Ok(value),
                _ => debug!(target: "worker", "{}", line),
            }
        }
    }
}

/// Removes the materialized worker script when the worker goes away.
struct ScriptFile(PathBuf);

impl ScriptFile {
    fn write() -> Result<Self> {
        let path = std::env::temp_dir().join(format!("aeneas-worker-{}.py", uuid::Uuid::new_v4()));
        std::fs::write(&path, WORKER_SCRIPT)?;
        Ok(Self(path))
    }
}

impl Drop for ScriptFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

pub struct Worker {
    io: Mutex<WorkerIo>,
    checkpoint: Checkpoint,
    _script: Option<ScriptFile>,
}

impl Worker {
    /// Starts the bundled Python worker against `checkpoint_path`.
    pub async fn start_python(python: &str, repo_dir: &Path, checkpoint_path: PathBuf) -> Result<Self> {
        let script = ScriptFile::write()?;
        let command = WorkerCommand::python(python, &script.0, repo_dir);
        let mut worker = Self::spawn(command, checkpoint_path).await?;
        worker._script = Some(script);
        Ok(worker)
    }

    /// Spawns `command` and waits for its handshake. Returns once the
    /// checkpoint is loaded and the model is ready.
    pub async fn spawn(command: WorkerCommand, checkpoint_path: PathBuf) -> Result<Self> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.envs.iter().map(|(k, v)| (k, v)))
            .env("AENEAS_CHECKPOINT", &checkpoint_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Worker(format!("failed to start {}: {}", command.program, e)))?;

        let stdin = child.stdin.take().ok_or_else(|| Error::Worker("stdin not captured".into()))?;
        let stdout = child.stdout.take().ok_or_else(|| Error::Worker("stdout not captured".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "worker", "{}", line);
                }
            });
        }

        let mut io = WorkerIo {
            _child: child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        };

        let handshake: Handshake = serde_json::from_value(io.next_message().await?)?;
        if !handshake.ready {
            return Err(Error::Checkpoint {
                path: checkpoint_path,
                message: handshake.error.unwrap_or_else(|| "worker not ready".to_string()),
            });
        }
        let checkpoint = Checkpoint::new(checkpoint_path, handshake.model_config)?;

        Ok(Self {
            io: Mutex::new(io),
            checkpoint,
            _script: None,
        })
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }
}

#[async_trait]
impl Restorer for Worker {
    async fn restore(&self, text: &str, params: &RestoreParams) -> Result<Value> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut line = serde_json::to_string(&WorkerRequest { id: id.clone(), text, params })?;
        line.push('\n');

        let mut io = self.io.lock().await;
        io.stdin.write_all(line.as_bytes()).await?;
        io.stdin.flush().await?;

        loop {
            let response: WorkerResponse = match serde_json::from_value(io.next_message().await?) {
                Ok(r) => r,
                Err(e) => {
                    warn!("Ignoring malformed worker message: {}", e);
                    continue;
                }
            };
            match response.id.as_deref() {
                Some(reply_id) if reply_id != id => {
                    // reply to a request whose caller went away
                    debug!("Discarding stale worker reply {}", reply_id);
                    continue;
                }
                None if response.error.is_none() => {
                    warn!("Ignoring worker reply without an id");
                    continue;
                }
                _ => {}
            }
            return match (response.result, response.error) {
                (_, Some(error)) => Err(Error::Worker(error)),
                (Some(result), None) => Ok(result),
                (None, None) => Err(Error::Worker("empty reply".to_string())),
            };
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::restore::top_prediction;

    fn sh(script: &str) -> WorkerCommand {
        WorkerCommand::new("sh").arg("-c").arg(script)
    }

    const ECHO_WORKER: &str = r#"
echo 'loading weights...'
echo '{"ready": true, "model_config": {"vocab_char_size": 34}}'
while read -r line; do
  id=$(printf '%s' "$line" | sed 's/.*"id":"\([^"]*\)".*/\1/')
  case "$line" in
    *boom*) printf '{"id":"%s","error":"beam search failed"}\n' "$id" ;;
    *garbled*) printf '{"id":null,"error":"JSONDecodeError: Expecting value"}\n' ;;
    *) printf '{"id":"%s","result":"{\\"predictions\\": [\\"dis manibus\\"]}"}\n' "$id" ;;
  esac
done
"#;

    #[tokio::test]
    async fn test_handshake_and_restore() {
        let worker = Worker::spawn(sh(ECHO_WORKER), PathBuf::from("/in/aeneas.pkl"))
            .await
            .unwrap();
        assert_eq!(worker.checkpoint().vocab_char_size, 34);

        let result = worker.restore("d[..] m[..]", &RestoreParams::default()).await.unwrap();
        assert_eq!(top_prediction(result).unwrap(), "dis manibus");

        let err = worker.restore("boom", &RestoreParams::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "worker: beam search failed");
    }

    #[tokio::test]
    async fn test_unreadable_request_fails_only_that_call() {
        let worker = Worker::spawn(sh(ECHO_WORKER), PathBuf::from("/in/aeneas.pkl"))
            .await
            .unwrap();

        let err = worker.restore("garbled", &RestoreParams::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "worker: JSONDecodeError: Expecting value");

        let result = worker.restore("d[..] m[..]", &RestoreParams::default()).await.unwrap();
        assert_eq!(top_prediction(result).unwrap(), "dis manibus");
    }

    fn python_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Lays out stand-ins for jax and the model packages plus a pickled
    /// checkpoint, so the bundled script runs without the real model.
    fn stub_model_tree(root: &Path) -> PathBuf {
        let files = [
            ("jax/__init__.py", "def device_put(x):\n    return x\n"),
            ("predictingthepast/__init__.py", ""),
            ("predictingthepast/models/__init__.py", ""),
            (
                "predictingthepast/models/model.py",
                "class Model:\n    def __init__(self, **config):\n        pass\n\n    def apply(self, *args, **kwargs):\n        pass\n",
            ),
            ("predictingthepast/util/__init__.py", ""),
            ("predictingthepast/util/alphabet.py", "class LatinAlphabet:\n    pass\n"),
            ("predictingthepast/eval/__init__.py", ""),
            (
                "predictingthepast/eval/inference.py",
                "import json\n\n\nclass _Restoration:\n    def __init__(self, text):\n        self.text = text\n\n    def json(self):\n        return json.dumps({\"predictions\": [self.text.upper()]})\n\n\ndef restore(text, **kwargs):\n    return _Restoration(text)\n",
            ),
        ];
        for (rel, body) in files {
            let path = root.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, body).unwrap();
        }

        let checkpoint = root.join("aeneas_stub.pkl");
        let status = std::process::Command::new("python3")
            .arg("-c")
            .arg("import pickle, sys; pickle.dump({'model_config': {'vocab_char_size': 34}, 'params': {}}, open(sys.argv[1], 'wb'))")
            .arg(&checkpoint)
            .status()
            .unwrap();
        assert!(status.success());
        checkpoint
    }

    #[tokio::test]
    async fn test_bundled_script_survives_malformed_lines() {
        if !python_available() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let checkpoint = stub_model_tree(tmp.path());

        let worker = Worker::start_python("python3", tmp.path(), checkpoint).await.unwrap();
        assert_eq!(worker.checkpoint().vocab_char_size, 34);

        {
            let mut io = worker.io.lock().await;
            io.stdin.write_all(b"{not json\n").await.unwrap();
            io.stdin.flush().await.unwrap();
            let reply = io.next_message().await.unwrap();
            assert_eq!(reply["id"], Value::Null);
            assert!(reply["error"].as_str().unwrap().starts_with("JSONDecodeError"));

            io.stdin.write_all(b"{\"id\": \"x1\"}\n").await.unwrap();
            io.stdin.flush().await.unwrap();
            let reply = io.next_message().await.unwrap();
            assert_eq!(reply["id"], "x1");
            assert!(reply["error"].as_str().unwrap().starts_with("KeyError"));
        }

        let result = worker.restore("dis manibus", &RestoreParams::default()).await.unwrap();
        assert_eq!(top_prediction(result).unwrap(), "DIS MANIBUS");
    }

    #[tokio::test]
    async fn test_failed_handshake() {
        let script = r#"echo '{"ready": false, "error": "KeyError: model_config"}'"#;
        let err = Worker::spawn(sh(script), PathBuf::from("/in/aeneas.pkl"))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("KeyError: model_config"));
    }

    #[tokio::test]
    async fn test_worker_that_dies() {
        let err = Worker::spawn(sh("exit 3"), PathBuf::from("/in/aeneas.pkl"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::WorkerExited));
    }

    #[test]
    fn test_request_wire_shape() {
        let params = RestoreParams::default();
        let line = serde_json::to_value(WorkerRequest { id: "1".into(), text: "abc", params: &params })
            .unwrap();
        assert_eq!(
            line,
            serde_json::json!({
                "id": "1",
                "text": "abc",
                "beam_width": 5,
                "temperature": 1.0,
                "unk_restoration_max_len": 15
            })
        );
    }
}
