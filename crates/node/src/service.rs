//! Out-of-process service supervision.
//!
//! A service is a helper executable under `services.d/` in the home
//! directory, spoken to over stdin/stdout with length-prefixed dictionary
//! messages. The supervisor task respawns the child if it dies; messages
//! sent while no child is running are errors the caller logs and drops.

use anyhow::{bail, Context, Result};
use log::{info, warn};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::task::JoinHandle;

/// Upper bound on one framed message.
const MAX_MESSAGE_SIZE: u32 = 131_072;

/// Pause before respawning a dead child.
const RESPAWN_DELAY_MS: u64 = 1_000;

/// Ordered string-to-string map with a line-oriented wire form:
/// `key=value\n` per entry, with backslash escapes for `\`, CR, LF and `=`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dictionary {
    entries: BTreeMap<String, String>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: &str) -> &mut Self {
        self.entries.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (k, v) in &self.entries {
            out.extend_from_slice(escape(k).as_bytes());
            out.push(b'=');
            out.extend_from_slice(escape(v).as_bytes());
            out.push(b'\n');
        }
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data).context("dictionary is not UTF-8")?;
        let mut entries = BTreeMap::new();
        for line in text.split('\n') {
            if line.is_empty() {
                continue;
            }
            let eq = find_unescaped_eq(line)
                .with_context(|| format!("dictionary line without separator: {:?}", line))?;
            let key = unescape(&line[..eq])?;
            let value = unescape(&line[eq + 1..])?;
            entries.insert(key, value);
        }
        Ok(Self { entries })
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '=' => out.push_str("\\e"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(s: &str) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('e') => out.push('='),
            other => bail!("bad escape sequence: \\{:?}", other),
        }
    }
    Ok(out)
}

fn find_unescaped_eq(line: &str) -> Option<usize> {
    let bytes = line.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'=' => return Some(i),
            _ => i += 1,
        }
    }
    None
}

/// Callback invoked for each message the child emits.
pub type ServiceHandler =
    Box<dyn Fn(Dictionary) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Supervised helper subprocess.
pub struct Service {
    name: String,
    stdin: Arc<tokio::sync::Mutex<Option<ChildStdin>>>,
    supervisor: JoinHandle<()>,
}

impl Service {
    /// Spawn the helper and its supervisor task. The executable receives
    /// the home path as its single argument and is respawned on exit.
    pub fn spawn(name: &str, executable: PathBuf, home: PathBuf, handler: ServiceHandler) -> Self {
        let stdin: Arc<tokio::sync::Mutex<Option<ChildStdin>>> =
            Arc::new(tokio::sync::Mutex::new(None));

        let task_name = name.to_string();
        let task_stdin = stdin.clone();
        let supervisor = tokio::spawn(async move {
            loop {
                let mut child = match Command::new(&executable)
                    .arg(&home)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::null())
                    .kill_on_drop(true)
                    .spawn()
                {
                    Ok(child) => child,
                    Err(e) => {
                        warn!("service {}: failed to start {:?}: {}", task_name, executable, e);
                        tokio::time::sleep(std::time::Duration::from_millis(RESPAWN_DELAY_MS))
                            .await;
                        continue;
                    }
                };

                info!("service {}: started {:?}", task_name, executable);
                *task_stdin.lock().await = child.stdin.take();

                if let Some(stdout) = child.stdout.take() {
                    let mut reader = BufReader::new(stdout);
                    loop {
                        let mut len_buf = [0u8; 4];
                        if reader.read_exact(&mut len_buf).await.is_err() {
                            break;
                        }
                        let len = u32::from_be_bytes(len_buf);
                        if len == 0 || len > MAX_MESSAGE_SIZE {
                            warn!("service {}: bad frame length {}", task_name, len);
                            break;
                        }
                        let mut payload = vec![0u8; len as usize];
                        if reader.read_exact(&mut payload).await.is_err() {
                            break;
                        }
                        match Dictionary::from_bytes(&payload) {
                            Ok(msg) => handler(msg).await,
                            Err(e) => warn!("service {}: unparseable message: {:#}", task_name, e),
                        }
                    }
                }

                *task_stdin.lock().await = None;
                warn!("service {}: exited, respawning", task_name);
                tokio::time::sleep(std::time::Duration::from_millis(RESPAWN_DELAY_MS)).await;
            }
        });

        Self {
            name: name.to_string(),
            stdin,
            supervisor,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Frame and send one message to the child.
    pub async fn send(&self, msg: &Dictionary) -> Result<()> {
        let payload = msg.to_bytes();
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .with_context(|| format!("service {} is not running", self.name))?;
        stdin.write_all(&(payload.len() as u32).to_be_bytes()).await?;
        stdin.write_all(&payload).await?;
        stdin.flush().await?;
        Ok(())
    }

    pub fn shutdown(&self) {
        self.supervisor.abort();
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dictionary_round_trip_with_escapes() {
        let mut d = Dictionary::new();
        d.set("type", "netconf-response");
        d.set("netconf", "line one\nline=two\\end\r");
        d.set("empty", "");

        let bytes = d.to_bytes();
        let parsed = Dictionary::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, d);
        assert_eq!(parsed.get("netconf"), Some("line one\nline=two\\end\r"));
    }

    #[test]
    fn dictionary_rejects_garbage() {
        assert!(Dictionary::from_bytes(b"no separator here\n").is_err());
        assert!(Dictionary::from_bytes(&[0xff, 0xfe]).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn echo_service_round_trip() {
        use std::sync::Mutex as StdMutex;

        let received: Arc<StdMutex<Vec<Dictionary>>> = Arc::new(StdMutex::new(Vec::new()));
        let received_in_handler = received.clone();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let handler: ServiceHandler = Box::new(move |msg| {
            let received = received_in_handler.clone();
            let tx = tx.clone();
            Box::pin(async move {
                received.lock().unwrap().push(msg);
                let _ = tx.send(());
            })
        });

        // A shell wrapper around `cat` (which ignores the home-path
        // argument) reflects our frames straight back.
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("echo.service");
        std::fs::write(&script, "#!/bin/sh\nexec cat\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let svc = Service::spawn("echo", script, dir.path().to_path_buf(), handler);

        let mut msg = Dictionary::new();
        msg.set("type", "netconf-response");
        msg.set("requestId", "1a");

        // The child may still be starting; retry until stdin is wired up.
        for _ in 0..50 {
            if svc.send(&msg).await.is_ok() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("echoed message should arrive")
            .unwrap();

        let got = received.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0], msg);
    }
}
