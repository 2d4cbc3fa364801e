//! HTTP client for a device's lock control endpoint
//!
//! Each device runs a small agent that answers:
//! - `POST /lock` and `POST /unlock` with no body; any 2xx is success
//! - `GET /status` with `{"locked": bool}`

use async_trait::async_trait;
use kidslock_device_api::{DeviceError, DeviceResult, RemoteControl};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct StatusBody {
    locked: bool,
}

/// Talks to the control endpoint on `port` of each device
#[derive(Debug, Clone)]
pub struct HttpRemoteControl {
    client: Client,
    port: u16,
}

impl HttpRemoteControl {
    pub fn new(port: u16, request_timeout: Duration) -> DeviceResult<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| DeviceError::Io(std::io::Error::other(e)))?;
        Ok(Self { client, port })
    }

    /// Endpoint URL for `path` on the device at `address`
    pub fn url(&self, address: &str, path: &str) -> String {
        if address.contains(':') && !address.starts_with('[') {
            format!("http://[{}]:{}/{}", address, self.port, path)
        } else {
            format!("http://{}:{}/{}", address, self.port, path)
        }
    }

    async fn post(&self, address: &str, path: &str) -> DeviceResult<()> {
        let url = self.url(address, path);
        debug!(url = %url, "Sending control request");

        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| map_request_error(e, address))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(DeviceError::HttpStatus(status.as_u16()))
        }
    }
}

#[async_trait]
impl RemoteControl for HttpRemoteControl {
    async fn lock(&self, address: &str) -> DeviceResult<()> {
        self.post(address, "lock").await
    }

    async fn unlock(&self, address: &str) -> DeviceResult<()> {
        self.post(address, "unlock").await
    }

    async fn status(&self, address: &str) -> DeviceResult<bool> {
        let url = self.url(address, "status");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| map_request_error(e, address))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeviceError::HttpStatus(status.as_u16()));
        }

        let body: StatusBody = response
            .json()
            .await
            .map_err(|e| DeviceError::InvalidResponse(e.to_string()))?;
        Ok(body.locked)
    }
}

fn map_request_error(e: reqwest::Error, address: &str) -> DeviceError {
    if e.is_timeout() {
        DeviceError::Unreachable(format!("{}: request timed out", address))
    } else {
        DeviceError::Unreachable(format!("{}: {}", address, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Serve `responses` in order, reporting each request line
    async fn serve(responses: Vec<&'static str>) -> (u16, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            for response in responses {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 4096];
                let n = stream.read(&mut buf).await.unwrap();
                let request = String::from_utf8_lossy(&buf[..n]);
                let line = request.lines().next().unwrap_or_default().to_string();
                let _ = tx.send(line);
                stream.write_all(response.as_bytes()).await.unwrap();
                stream.shutdown().await.ok();
            }
        });

        (port, rx)
    }

    const OK: &str = "HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
    const ERROR: &str = "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
    const LOCKED: &str = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 15\r\nConnection: close\r\n\r\n{\"locked\":true}";
    const GARBAGE: &str = "HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello";

    #[tokio::test]
    async fn lock_and_unlock_post_to_endpoint() {
        let (port, mut requests) = serve(vec![OK, OK]).await;
        let remote = HttpRemoteControl::new(port, Duration::from_secs(2)).unwrap();

        remote.lock("127.0.0.1").await.unwrap();
        remote.set_locked("127.0.0.1", false).await.unwrap();

        assert_eq!(requests.recv().await.unwrap(), "POST /lock HTTP/1.1");
        assert_eq!(requests.recv().await.unwrap(), "POST /unlock HTTP/1.1");
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let (port, _requests) = serve(vec![ERROR]).await;
        let remote = HttpRemoteControl::new(port, Duration::from_secs(2)).unwrap();

        assert!(matches!(
            remote.lock("127.0.0.1").await,
            Err(DeviceError::HttpStatus(500))
        ));
    }

    #[tokio::test]
    async fn status_reads_lock_state() {
        let (port, mut requests) = serve(vec![LOCKED, GARBAGE]).await;
        let remote = HttpRemoteControl::new(port, Duration::from_secs(2)).unwrap();

        assert!(remote.status("127.0.0.1").await.unwrap());
        assert_eq!(requests.recv().await.unwrap(), "GET /status HTTP/1.1");
        assert!(matches!(
            remote.status("127.0.0.1").await,
            Err(DeviceError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let remote = HttpRemoteControl::new(port, Duration::from_millis(500)).unwrap();
        assert!(matches!(
            remote.unlock("127.0.0.1").await,
            Err(DeviceError::Unreachable(_))
        ));
    }

    #[test]
    fn ipv6_hosts_are_bracketed() {
        let remote = HttpRemoteControl::new(8080, Duration::from_secs(1)).unwrap();
        assert_eq!(remote.url("10.0.0.5", "lock"), "http://10.0.0.5:8080/lock");
        assert_eq!(remote.url("fe80::1", "status"), "http://[fe80::1]:8080/status");
        assert_eq!(remote.url("tv.lan", "unlock"), "http://tv.lan:8080/unlock");
    }
}
