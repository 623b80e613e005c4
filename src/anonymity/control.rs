//! Minimal client for the anonymity daemon's control port.
//!
//! Only what the dispatcher needs is implemented: authenticate with a cookie
//! or a password, send a signal, quit. Replies are line based; a reply ends
//! at the first line whose fourth byte is a space.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::config::ControlAuth;

/// Signals understood by the control port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Liveness ping; also tells us whether the daemon is reachable.
    Heartbeat,
    /// Switch to clean circuits for new connections.
    NewNym,
}

impl Signal {
    pub fn as_str(self) -> &'static str {
        match self {
            Signal::Heartbeat => "HEARTBEAT",
            Signal::NewNym => "NEWNYM",
        }
    }
}

/// Control-port failures.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("control socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot read credential {}: {source}", .path.display())]
    Credential {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("credential file {} is empty", .0.display())]
    EmptyCredential(PathBuf),

    #[error("control port rejected command: {0}")]
    Rejected(String),

    #[error("control port closed the connection")]
    Closed,
}

/// One control-port session.
pub struct ControlConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ControlConnection {
    pub async fn connect(addr: &str) -> Result<Self, ControlError> {
        let stream = TcpStream::connect(addr).await?;
        let (read, write) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read),
            writer: write,
        })
    }

    pub async fn authenticate(&mut self, auth: &ControlAuth) -> Result<(), ControlError> {
        let argument = credential_argument(auth).await?;
        self.command(&format!("AUTHENTICATE {}", argument)).await?;
        Ok(())
    }

    pub async fn signal(&mut self, signal: Signal) -> Result<(), ControlError> {
        self.command(&format!("SIGNAL {}", signal.as_str())).await?;
        Ok(())
    }

    /// Ends the session; errors on the way out are irrelevant.
    pub async fn quit(mut self) {
        let _ = self.command("QUIT").await;
        let _ = self.writer.shutdown().await;
    }

    /// Sends one command and returns the reply lines of a `250` reply.
    async fn command(&mut self, line: &str) -> Result<Vec<String>, ControlError> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        self.read_reply().await
    }

    async fn read_reply(&mut self) -> Result<Vec<String>, ControlError> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?;
            let separator = line.as_bytes().get(3).copied();
            let separator = match separator {
                Some(sep @ (b' ' | b'-' | b'+')) if line.is_char_boundary(3) => sep,
                _ => return Err(ControlError::Rejected(format!("malformed reply '{}'", line))),
            };
            let (code, rest) = line.split_at(3);

            if separator == b'+' {
                // Data reply: runs until a lone "."
                loop {
                    let data = self.read_line().await?;
                    if data == "." {
                        break;
                    }
                }
            }

            if code != "250" {
                return Err(ControlError::Rejected(line));
            }
            lines.push(rest[1..].to_string());
            if separator == b' ' {
                return Ok(lines);
            }
        }
    }

    async fn read_line(&mut self) -> Result<String, ControlError> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(ControlError::Closed);
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

/// Argument for the `AUTHENTICATE` command.
pub async fn credential_argument(auth: &ControlAuth) -> Result<String, ControlError> {
    match auth {
        ControlAuth::Cookie { path } => {
            let cookie = tokio::fs::read(path).await.map_err(|source| credential_error(path, source))?;
            if cookie.is_empty() {
                return Err(ControlError::EmptyCredential(path.clone()));
            }
            Ok(hex(&cookie))
        }
        ControlAuth::Password { conf_path } => {
            let contents = tokio::fs::read_to_string(conf_path)
                .await
                .map_err(|source| credential_error(conf_path, source))?;
            let secret = contents
                .lines()
                .last()
                .map(|l| l.trim_end_matches('\r'))
                .ok_or_else(|| ControlError::EmptyCredential(conf_path.clone()))?;
            Ok(quote(secret))
        }
    }
}

fn credential_error(path: &Path, source: std::io::Error) -> ControlError {
    ControlError::Credential {
        path: path.to_path_buf(),
        source,
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

fn quote(secret: &str) -> String {
    let escaped = secret.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn temp_file(name: &str, contents: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("a3s-dispatch-{}-{}", std::process::id(), name));
        std::fs::write(&path, contents).unwrap();
        path
    }

    /// Fake control port answering each command from `replies` in order.
    async fn fake_control(replies: Vec<&'static str>) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut reader = BufReader::new(read);
            let mut received = Vec::new();
            for reply in replies {
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap() == 0 {
                    break;
                }
                received.push(line.trim_end().to_string());
                write.write_all(reply.as_bytes()).await.unwrap();
            }
            received
        });
        (addr, handle)
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(Signal::Heartbeat.as_str(), "HEARTBEAT");
        assert_eq!(Signal::NewNym.as_str(), "NEWNYM");
    }

    #[test]
    fn test_hex_and_quote() {
        assert_eq!(hex(&[0x00, 0xab, 0x10]), "00AB10");
        assert_eq!(quote(r#"pa"ss\word"#), r#""pa\"ss\\word""#);
    }

    #[tokio::test]
    async fn test_cookie_credential() {
        let path = temp_file("cookie", &[0xde, 0xad, 0xbe, 0xef]);
        let arg = credential_argument(&ControlAuth::Cookie { path: path.clone() })
            .await
            .unwrap();
        assert_eq!(arg, "DEADBEEF");
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn test_password_credential_is_last_line() {
        let path = temp_file("control.conf", b"# control\nHashedControlPassword x\nhunter2\n");
        let arg = credential_argument(&ControlAuth::Password { conf_path: path.clone() })
            .await
            .unwrap();
        assert_eq!(arg, "\"hunter2\"");
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn test_missing_credential() {
        let result = credential_argument(&ControlAuth::Cookie {
            path: PathBuf::from("/nonexistent/control_auth_cookie"),
        })
        .await;
        assert!(matches!(result, Err(ControlError::Credential { .. })));
    }

    #[tokio::test]
    async fn test_authenticate_and_signal() {
        let path = temp_file("session-cookie", &[0x01, 0x02]);
        let (addr, server) = fake_control(vec!["250 OK\r\n", "250 OK\r\n", "250 closing connection\r\n"]).await;

        let mut conn = ControlConnection::connect(&addr).await.unwrap();
        conn.authenticate(&ControlAuth::Cookie { path: path.clone() })
            .await
            .unwrap();
        conn.signal(Signal::NewNym).await.unwrap();
        conn.quit().await;

        let received = server.await.unwrap();
        assert_eq!(received, vec!["AUTHENTICATE 0102", "SIGNAL NEWNYM", "QUIT"]);
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn test_multiline_reply() {
        let (addr, _server) = fake_control(vec!["250-first\r\n250-second\r\n250 OK\r\n"]).await;
        let mut conn = ControlConnection::connect(&addr).await.unwrap();
        let lines = conn.command("GETINFO version").await.unwrap();
        assert_eq!(lines, vec!["first", "second", "OK"]);
    }

    #[tokio::test]
    async fn test_rejected_authentication() {
        let path = temp_file("bad-cookie", &[0x05]);
        let (addr, _server) = fake_control(vec!["515 Authentication failed\r\n"]).await;
        let mut conn = ControlConnection::connect(&addr).await.unwrap();
        let err = conn
            .authenticate(&ControlAuth::Cookie { path: path.clone() })
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Rejected(ref line) if line.starts_with("515")));
        std::fs::remove_file(path).ok();
    }
}
