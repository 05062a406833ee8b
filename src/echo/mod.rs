//! Echo service run on each probed peer

mod server;

pub use server::*;

use crate::cancel::CancelSignal;
use crate::error::Result;

/// Bind and serve until the lifetime elapses or `cancel` fires
pub async fn run_echo_service(config: EchoConfig, cancel: CancelSignal) -> Result<EchoSummary> {
    let server = EchoServer::bind(config).await?;
    Ok(server.serve(cancel).await)
}
