use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};

mod config;
mod control;
mod identity;
mod ipc;
mod protocol;
#[cfg(target_os = "linux")]
mod tun_linux;

use config::NodeConfig;
use control::NodeControl;
use identity::NodeIdentity;
use protocol::{ControlRequest, ControlResponse};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = NodeConfig::load()?;
    overlay_logging::setup_global_subscriber(&config.log_filter)?;

    let config_dir = match &config.config_dir {
        Some(dir) => dir.clone(),
        None => identity::default_config_dir()?,
    };
    let identity = NodeIdentity::load_or_create(&config_dir)?;
    tracing::info!(machine_id = %identity.machine_id, socket = %config.rpc_socket_path.display(), "starting node");

    let control = Arc::new(NodeControl::new(config.clone(), identity, make_tun));

    let server = ipc::IpcServer::bind(&config.rpc_socket_path).await?;
    tracing::info!("local control socket listening");

    tokio::select! {
        result = serve(server, control) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            // Mirrors what `Logout` already does: stop the peers, close
            // the controller stream, close the tun. Every resource here
            // has a single-owner close, so this is safe to run even if
            // the node was never logged in.
            let _ = control.logout().await;
            Ok(())
        }
    }
}

async fn serve(server: ipc::IpcServer, control: Arc<NodeControl>) -> anyhow::Result<()> {
    loop {
        let (mut rx, mut tx) = server.accept_split::<ControlRequest, ControlResponse>().await?;
        let control = Arc::clone(&control);
        tokio::spawn(async move {
            while let Some(Ok(request)) = rx.next().await {
                let response = control.dispatch(request).await;
                if tx.send(&response).await.is_err() {
                    return;
                }
            }
        });
    }
}

#[cfg(target_os = "linux")]
fn make_tun() -> Result<Arc<dyn overlay_ports::Tun>, overlay_model::OverlayError> {
    Ok(Arc::new(tun_linux::LinuxTun::open()?))
}

#[cfg(not(target_os = "linux"))]
fn make_tun() -> Result<Arc<dyn overlay_ports::Tun>, overlay_model::OverlayError> {
    Err(overlay_model::OverlayError::fatal(
        "no tun implementation is bundled for this platform",
    ))
}
