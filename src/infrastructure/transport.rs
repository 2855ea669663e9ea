//! Transport to the BLE server
//!
//! Either spawns the server executable and talks over its stdio, or
//! connects to a server that is already running on a local socket.

use crate::domain::settings::ServerSettings;
use anyhow::{Context, Result};
use interprocess::local_socket::{
    tokio::{prelude::*, Stream as LocalStream},
    GenericFilePath, ToFsName,
};
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{info, warn};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A spawned BLE server. Killed when dropped.
pub struct ServerProcess {
    child: Child,
}

impl ServerProcess {
    /// Spawn the server with piped stdio. Its stderr is forwarded to the log.
    pub fn spawn(settings: &ServerSettings) -> Result<(Self, BoxedReader, BoxedWriter)> {
        info!("Spawning BLE server: {} {:?}", settings.path, settings.args);

        let mut child = Command::new(&settings.path)
            .args(&settings.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to launch BLE server {}", settings.path))?;

        let stdout = child.stdout.take().context("BLE server stdout not captured")?;
        let stdin = child.stdin.take().context("BLE server stdin not captured")?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr));
        }

        Ok((Self { child }, Box::new(stdout), Box::new(stdin)))
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for the server to exit
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        let status = self.child.wait().await?;
        info!("BLE server exited: {}", status);
        Ok(status)
    }

    /// Kill the server if it's still running and reap it
    pub async fn shutdown(mut self) -> Result<ExitStatus> {
        if self.child.try_wait()?.is_none() {
            info!("Stopping BLE server");
            self.child.start_kill()?;
        }
        self.wait().await
    }
}

async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => warn!(target: "ble_server", "{}", line),
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read BLE server stderr: {}", e);
                break;
            }
        }
    }
}

/// Connect to a BLE server listening on a local socket (named pipe on Windows)
pub async fn connect_local_socket(name: &str) -> Result<(BoxedReader, BoxedWriter)> {
    info!("Connecting to BLE server at {}", name);
    let socket_name = name.to_fs_name::<GenericFilePath>()?;
    let stream = LocalStream::connect(socket_name)
        .await
        .with_context(|| format!("Failed to connect to BLE server at {}", name))?;
    let (reader, writer) = tokio::io::split(stream);
    Ok((Box::new(reader), Box::new(writer)))
}

/// The open link, as chosen by the settings
pub enum Transport {
    Process(ServerProcess),
    LocalSocket(String),
}

impl Transport {
    /// Open the configured transport. A local socket, when set, wins over spawning.
    pub async fn open(settings: &ServerSettings) -> Result<(Self, BoxedReader, BoxedWriter)> {
        match &settings.local_socket {
            Some(name) => {
                let (reader, writer) = connect_local_socket(name).await?;
                Ok((Self::LocalSocket(name.clone()), reader, writer))
            }
            None => {
                let (process, reader, writer) = ServerProcess::spawn(settings)?;
                Ok((Self::Process(process), reader, writer))
            }
        }
    }

    pub async fn shutdown(self) -> Result<()> {
        match self {
            Self::Process(process) => {
                process.shutdown().await?;
            }
            Self::LocalSocket(name) => info!("Leaving BLE server at {} running", name),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::codec::{encode_frame, FrameReader, DEFAULT_MAX_FRAME_BYTES};
    use serde_json::json;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawned_server_stdio_is_wired() {
        // `cat` echoes every frame back unchanged
        let settings = ServerSettings {
            path: "cat".to_string(),
            ..Default::default()
        };
        let (process, reader, mut writer) = ServerProcess::spawn(&settings).unwrap();
        assert!(process.id().is_some());

        let message = json!({ "_type": "Start" });
        tokio::io::AsyncWriteExt::write_all(&mut writer, &encode_frame(&message).unwrap())
            .await
            .unwrap();

        let mut frames = FrameReader::new(reader, DEFAULT_MAX_FRAME_BYTES);
        assert_eq!(frames.read_frame().await.unwrap(), Some(message));

        drop(writer);
        assert!(frames.read_frame().await.unwrap().is_none());
        process.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_executable_fails() {
        let settings = ServerSettings {
            path: "/nonexistent/ble-server".to_string(),
            ..Default::default()
        };
        assert!(ServerProcess::spawn(&settings).is_err());
    }
}
