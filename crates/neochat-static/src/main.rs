//! `neochat-static`: serve the NeoChat web client.

use neochat_common::{init_logging, LogConfig};
use neochat_static::{run, ServerConfig, StaticServerError};
use tracing::error;

#[tokio::main]
async fn main() -> Result<(), StaticServerError> {
    let config = ServerConfig::from_env()?;
    init_logging(LogConfig::default().with_format(config.log_format))?;

    if let Err(e) = run(config).await {
        error!(error = %e, "Static server stopped");
        return Err(e);
    }
    Ok(())
}
