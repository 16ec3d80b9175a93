//! Tor control-port client.
//!
//! Minimal line protocol over TCP: authenticate, query bootstrap progress,
//! rotate the circuit identity (`SIGNAL NEWNYM`), request a graceful stop.
//! Replies are `250 ...` lines on success.

use crate::error::PoolError;
use crate::instance::Endpoint;
use log::debug;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Client for one instance's control endpoint. Cheap to construct; opens a
/// fresh connection per command, matching tor's one-shot control sessions.
#[derive(Debug, Clone)]
pub struct ControlClient {
    endpoint: Endpoint,
    password: String,
    timeout: Duration,
}

impl ControlClient {
    pub fn new(endpoint: Endpoint, password: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint,
            password: password.into(),
            timeout,
        }
    }

    /// Query bootstrap progress as a percentage, 0..=100.
    ///
    /// `Err` means the control port is unreachable or refused us; the
    /// health monitor counts that as a probe miss.
    pub async fn bootstrap_progress(&self) -> Result<u8, PoolError> {
        let reply = self
            .session("GETINFO status/bootstrap-phase")
            .await?;
        parse_bootstrap_pct(&reply).ok_or_else(|| {
            PoolError::Control(format!("no PROGRESS in reply: {}", reply.trim()))
        })
    }

    /// Issue `SIGNAL NEWNYM`, requesting a new circuit identity.
    pub async fn rotate_identity(&self) -> Result<(), PoolError> {
        let reply = self.session("SIGNAL NEWNYM").await?;
        if reply.starts_with("250") {
            Ok(())
        } else {
            Err(PoolError::Control(format!(
                "NEWNYM rejected: {}",
                reply.trim()
            )))
        }
    }

    /// Ask the instance to shut down cleanly.
    pub async fn graceful_stop(&self) -> Result<(), PoolError> {
        let reply = self.session("SIGNAL SHUTDOWN").await?;
        if reply.starts_with("250") {
            Ok(())
        } else {
            Err(PoolError::Control(format!(
                "SHUTDOWN rejected: {}",
                reply.trim()
            )))
        }
    }

    /// Open a connection, authenticate, send one command, read one reply.
    async fn session(&self, command: &str) -> Result<String, PoolError> {
        let fut = async {
            let mut stream = TcpStream::connect(self.endpoint.addr()).await?;

            let auth = if self.password.is_empty() {
                "AUTHENTICATE\r\n".to_string()
            } else {
                format!("AUTHENTICATE \"{}\"\r\n", self.password)
            };
            stream.write_all(auth.as_bytes()).await?;
            let auth_reply = read_reply(&mut stream).await?;
            if !auth_reply.starts_with("250") {
                return Err(PoolError::Control(format!(
                    "authentication refused: {}",
                    auth_reply.trim()
                )));
            }

            stream
                .write_all(format!("{command}\r\n").as_bytes())
                .await?;
            read_reply(&mut stream).await
        };

        match timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                debug!("control command timed out on {}", self.endpoint.addr());
                Err(PoolError::Control(format!(
                    "timeout talking to {}",
                    self.endpoint.addr()
                )))
            }
        }
    }
}

async fn read_reply(stream: &mut TcpStream) -> Result<String, PoolError> {
    let mut buf = [0u8; 512];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Err(PoolError::Control("connection closed".to_string()));
    }
    Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
}

/// Extract the percentage from a `status/bootstrap-phase` reply, e.g.
/// `250-status/bootstrap-phase=NOTICE BOOTSTRAP PROGRESS=85 TAG=...`.
fn parse_bootstrap_pct(reply: &str) -> Option<u8> {
    let rest = reply.split("PROGRESS=").nth(1)?;
    let token = rest.split_whitespace().next()?;
    token.parse::<u8>().ok().map(|p| p.min(100))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_progress_from_bootstrap_reply() {
        let reply =
            "250-status/bootstrap-phase=NOTICE BOOTSTRAP PROGRESS=85 TAG=ap_handshake\r\n250 OK\r\n";
        assert_eq!(parse_bootstrap_pct(reply), Some(85));
    }

    #[test]
    fn parses_complete_bootstrap() {
        let reply = "250-status/bootstrap-phase=NOTICE BOOTSTRAP PROGRESS=100 TAG=done SUMMARY=\"Done\"\r\n";
        assert_eq!(parse_bootstrap_pct(reply), Some(100));
    }

    #[test]
    fn rejects_reply_without_progress() {
        assert_eq!(parse_bootstrap_pct("250 OK\r\n"), None);
        assert_eq!(parse_bootstrap_pct("515 Bad authentication\r\n"), None);
    }

    #[test]
    fn clamps_out_of_range_progress() {
        let reply = "250-status/bootstrap-phase=NOTICE BOOTSTRAP PROGRESS=120\r\n";
        assert_eq!(parse_bootstrap_pct(reply), Some(100));
    }
}
