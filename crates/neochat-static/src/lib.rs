//! # NeoChat Static Server
//!
//! Serves the web client's files from a directory. Any path that does not
//! name a file gets the index document with status 200, so client-side
//! routes load the app shell.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use axum::Router;
use neochat_common::{LogFormat, NeoChatError};
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Errors that can occur while configuring or running the server.
#[derive(Error, Debug)]
pub enum StaticServerError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Static root {0} is not a directory")]
    MissingRoot(PathBuf),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[from] io::Error),

    #[error(transparent)]
    Common(#[from] NeoChatError),
}

/// Server settings, normally read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// `HOST`
    pub host: String,
    /// `PORT`
    pub port: u16,
    /// `STATIC_ROOT`
    pub static_root: PathBuf,
    /// `INDEX_FILE`, relative to the static root.
    pub index_file: String,
    /// `LOG_FORMAT`
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            static_root: PathBuf::from("public"),
            index_file: "index.html".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

impl ServerConfig {
    /// Read settings from process environment variables.
    pub fn from_env() -> Result<Self, StaticServerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`. Unset or empty keys keep defaults.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, StaticServerError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(host) = get("HOST") {
            config.host = host;
        }
        if let Some(port) = get("PORT") {
            config.port = port
                .trim()
                .parse()
                .map_err(|_| StaticServerError::Config(format!("PORT '{port}' is not a port")))?;
        }
        if let Some(root) = get("STATIC_ROOT") {
            config.static_root = PathBuf::from(root);
        }
        if let Some(index) = get("INDEX_FILE") {
            config.index_file = index;
        }
        if let Some(format) = get("LOG_FORMAT") {
            config.log_format = format.parse()?;
        }

        Ok(config)
    }

    pub fn index_path(&self) -> PathBuf {
        self.static_root.join(&self.index_file)
    }
}

/// Routes for the static root with the index as fallback.
pub fn router(config: &ServerConfig) -> Router {
    let index = ServeFile::new(config.index_path());
    let files = ServeDir::new(&config.static_root).fallback(index);

    Router::new()
        .fallback_service(files)
        .layer(TraceLayer::new_for_http())
}

/// Bind the configured address.
pub async fn bind(config: &ServerConfig) -> Result<TcpListener, StaticServerError> {
    let addr = format!("{}:{}", config.host, config.port);
    TcpListener::bind(addr.as_str())
        .await
        .map_err(|source| StaticServerError::Bind { addr, source })
}

/// Serve until the listener fails.
pub async fn serve(listener: TcpListener, config: &ServerConfig) -> Result<(), StaticServerError> {
    let addr: SocketAddr = listener.local_addr()?;
    info!(%addr, root = %config.static_root.display(), "Serving static files");

    axum::serve(listener, router(config)).await?;
    Ok(())
}

/// Check the root, bind, and serve.
pub async fn run(config: ServerConfig) -> Result<(), StaticServerError> {
    if !config.static_root.is_dir() {
        return Err(StaticServerError::MissingRoot(config.static_root));
    }

    let listener = bind(&config).await?;
    serve(listener, &config).await
}
