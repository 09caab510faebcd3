//! suppaftp-backed sessions. The client is blocking, so every command runs on
//! the blocking pool with the stream moved in and handed back afterwards.

use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use async_trait::async_trait;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Status};
use tracing::{debug, info};

use crate::{FeedConnector, FeedSession, TransportError};

pub const DEFAULT_FTP_HOST: &str = "ftpeu1prod.traveltek.net";

#[derive(Clone)]
pub struct FtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub connect_timeout: Duration,
    /// Socket read/write timeout for commands and data transfers.
    pub io_timeout: Duration,
}

impl Default for FtpConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_FTP_HOST.to_string(),
            port: 21,
            user: String::new(),
            password: String::new(),
            connect_timeout: Duration::from_secs(10),
            io_timeout: Duration::from_secs(20),
        }
    }
}

impl std::fmt::Debug for FtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("connect_timeout", &self.connect_timeout)
            .field("io_timeout", &self.io_timeout)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct FtpConnector {
    config: FtpConfig,
}

impl FtpConnector {
    pub fn new(config: FtpConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FtpConfig {
        &self.config
    }
}

#[async_trait]
impl FeedConnector for FtpConnector {
    async fn connect(&self) -> Result<Box<dyn FeedSession>, TransportError> {
        let config = self.config.clone();
        let io_timeout = config.io_timeout;
        let stream = tokio::task::spawn_blocking(move || open_stream(&config))
            .await
            .map_err(|err| TransportError::Connection(format!("connect task failed: {err}")))??;
        info!(host = %self.config.host, "ftp session opened");
        Ok(Box::new(FtpSession {
            stream: Some(stream),
            io_timeout,
        }))
    }
}

fn resolve(config: &FtpConfig) -> Result<SocketAddr, TransportError> {
    (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|err| TransportError::Connection(format!("resolving {}: {err}", config.host)))?
        .next()
        .ok_or_else(|| TransportError::Connection(format!("{} has no address", config.host)))
}

fn open_stream(config: &FtpConfig) -> Result<FtpStream, TransportError> {
    let addr = resolve(config)?;
    let mut stream = FtpStream::connect_timeout(addr, config.connect_timeout)
        .map_err(|err| classify(err, "", config.connect_timeout))?;
    let socket = stream.get_ref();
    socket
        .set_read_timeout(Some(config.io_timeout))
        .and_then(|_| socket.set_write_timeout(Some(config.io_timeout)))
        .map_err(|err| TransportError::Connection(err.to_string()))?;
    stream
        .login(config.user.as_str(), config.password.as_str())
        .map_err(|err| TransportError::Auth(err.to_string()))?;
    stream
        .transfer_type(FileType::Binary)
        .map_err(|err| classify(err, "", config.io_timeout))?;
    Ok(stream)
}

fn classify(err: FtpError, path: &str, io_timeout: Duration) -> TransportError {
    match err {
        FtpError::UnexpectedResponse(resp) if resp.status == Status::FileUnavailable => {
            TransportError::NotFound(path.to_string())
        }
        FtpError::ConnectionError(io)
            if matches!(io.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) =>
        {
            TransportError::Timeout { after: io_timeout }
        }
        FtpError::ConnectionError(io) => TransportError::Connection(io.to_string()),
        other => TransportError::Protocol(other.to_string()),
    }
}

pub struct FtpSession {
    stream: Option<FtpStream>,
    io_timeout: Duration,
}

impl FtpSession {
    async fn run<T, F>(&mut self, path: &str, op: F) -> Result<T, TransportError>
    where
        T: Send + 'static,
        F: FnOnce(&mut FtpStream) -> Result<T, FtpError> + Send + 'static,
    {
        let mut stream = self.stream.take().ok_or(TransportError::Closed)?;
        let (stream, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut stream);
            (stream, result)
        })
        .await
        .map_err(|err| TransportError::Connection(format!("ftp task failed: {err}")))?;
        self.stream = Some(stream);
        result.map_err(|err| classify(err, path, self.io_timeout))
    }
}

#[async_trait]
impl FeedSession for FtpSession {
    async fn retrieve(&mut self, path: &str) -> Result<Vec<u8>, TransportError> {
        let remote = path.to_string();
        let cursor = self
            .run(path, move |stream| stream.retr_as_buffer(&remote))
            .await?;
        Ok(cursor.into_inner())
    }

    async fn list(&mut self, dir: &str) -> Result<Vec<String>, TransportError> {
        let remote = dir.to_string();
        match self.run(dir, move |stream| stream.nlst(Some(remote.as_str()))).await {
            Ok(entries) => Ok(entries
                .into_iter()
                .filter_map(|entry| {
                    let name = entry.trim_end_matches('/').rsplit('/').next()?.trim().to_string();
                    (!name.is_empty() && name != "." && name != "..").then_some(name)
                })
                .collect()),
            Err(TransportError::NotFound(_)) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    async fn probe(&mut self) -> Result<(), TransportError> {
        self.run("", |stream| stream.noop()).await
    }

    async fn close(&mut self) {
        if self.stream.is_none() {
            return;
        }
        if let Err(err) = self.run("", |stream| stream.quit()).await {
            debug!(error = %err, "ftp quit failed");
        }
        self.stream = None;
    }
}
