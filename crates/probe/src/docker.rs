//! Minimal Docker Engine API client over the unix socket.
//!
//! The monitor container mounts `/var/run/docker.sock` read-only; the two
//! endpoints it needs (`/containers/json`, `/containers/{id}/json`) are
//! plain GETs, so a per-call HTTP/1 handshake over `UnixStream` is enough.
//! The client is stateless per call.

use std::path::PathBuf;
use std::time::Duration;

use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;

use crate::error::ProbeError;

/// Response from one Engine API call.
#[derive(Debug, Clone)]
pub struct DockerResponse {
    pub status: u16,
    pub data: serde_json::Value,
}

impl DockerResponse {
    #[must_use]
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone)]
pub struct DockerClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl DockerClient {
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: timeout.max(Duration::from_millis(500)),
        }
    }

    /// GET a JSON document from the Engine API.
    pub async fn get_json(&self, path: &str) -> Result<DockerResponse, ProbeError> {
        let path = if path.starts_with('/') {
            path.to_owned()
        } else {
            format!("/{path}")
        };

        let stream = tokio::time::timeout(self.timeout, UnixStream::connect(&self.socket_path))
            .await
            .map_err(|_| ProbeError::Docker("socket connect timeout".to_owned()))?
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ProbeError::Docker("socket_not_found".to_owned()),
                _ => ProbeError::Docker(format!("socket connect failed: {e}")),
            })?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| ProbeError::Docker(format!("handshake failed: {e}")))?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let request = hyper::Request::builder()
            .method("GET")
            .uri(&path)
            .header(hyper::header::HOST, "docker")
            .body(Empty::<bytes::Bytes>::new())
            .map_err(|e| ProbeError::Docker(format!("bad request: {e}")))?;

        let response = tokio::time::timeout(self.timeout, sender.send_request(request))
            .await
            .map_err(|_| ProbeError::Docker("request timeout".to_owned()))?
            .map_err(|e| ProbeError::Docker(format!("request failed: {e}")))?;

        let status = response.status().as_u16();
        let body = tokio::time::timeout(self.timeout, response.into_body().collect())
            .await
            .map_err(|_| ProbeError::Docker("body read timeout".to_owned()))?
            .map_err(|e| ProbeError::Docker(format!("body read failed: {e}")))?
            .to_bytes();

        let data = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).unwrap_or_else(|_| {
                serde_json::Value::String(String::from_utf8_lossy(&body).into_owned())
            })
        };

        Ok(DockerResponse { status, data })
    }

    /// List all containers (running or not).
    pub async fn list_containers(&self) -> Result<DockerResponse, ProbeError> {
        self.get_json("/containers/json?all=1").await
    }

    /// Inspect one container by id.
    pub async fn inspect_container(&self, id: &str) -> Result<DockerResponse, ProbeError> {
        self.get_json(&format!("/containers/{id}/json")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_socket_is_a_docker_error() {
        let client = DockerClient::new("/nonexistent/docker.sock", Duration::from_secs(1));
        let err = client.list_containers().await.unwrap_err();
        assert!(matches!(err, ProbeError::Docker(msg) if msg.contains("socket")));
    }

    #[tokio::test]
    async fn speaks_http_over_the_socket() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("docker.sock");
        let listener = tokio::net::UnixListener::bind(&sock).unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0_u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();
            let body = r#"[{"Id":"abc","Names":["/web"]}]"#;
            let resp = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(resp.as_bytes()).await.unwrap();
        });

        let client = DockerClient::new(&sock, Duration::from_secs(2));
        let resp = client.list_containers().await.unwrap();
        assert!(resp.ok());
        assert_eq!(resp.data[0]["Id"], "abc");
    }
}
