use std::error::Error;

use log::{debug, info};
use tokio::net::TcpListener;

use crate::relay_utils::serve;

/// Run the relay server that forwards frames between chat clients.
///
/// # Architecture
/// - Main task: accepts new TCP connections in a loop
/// - Reader tasks: one per client, decode frames and pass them to the manager
/// - Manager task: owns the connection registry and broadcasts each frame to
///   every other client
///
/// The relay only looks at frame headers. Payloads are end-to-end encrypted
/// between the clients and forwarded byte for byte.
///
/// # Returns
/// `Ok(())` once the last client has left, or an error if binding fails
pub async fn run(host: &str, port: u16) -> Result<(), Box<dyn Error>> {
    let bind_addr = format!("{}:{}", host, port);
    debug!("Attempting to bind to {}", bind_addr);

    let listener = TcpListener::bind(&bind_addr).await?;
    println!("Relay listening on {}", listener.local_addr()?);
    info!("Relay server started on {}", bind_addr);

    serve(listener).await?;

    println!("All clients disconnected, relay shutting down");
    Ok(())
}
