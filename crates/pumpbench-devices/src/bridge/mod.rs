/*!
 * RTU-to-TCP bridge.
 *
 * A bridge endpoint publishes a virtual serial port and answers the serial
 * master by forwarding every request to a TCP-hosted device. A
 * [`BridgeSet`] runs one endpoint per configured entry.
 */
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{error, info, warn};

use pumpbench_core::config::BridgeConfig;

use crate::error::{DeviceError, Result};
use crate::link::Link;

pub mod cache;
pub mod forward;
pub mod pty;
pub mod server;

pub use cache::RegisterCache;
pub use forward::ForwardingHandler;
pub use pty::VirtualSerial;
pub use server::{RequestHandler, RtuServer};

/// One virtual serial port forwarding to one TCP device
#[derive(Debug)]
pub struct BridgeEndpoint {
    config: BridgeConfig,
    link: Arc<Link>,
    stop: Arc<AtomicBool>,
    port: Option<VirtualSerial>,
    server: Option<JoinHandle<()>>,
}

impl BridgeEndpoint {
    /// Endpoint forwarding to the TCP target named in `config`
    pub fn new(config: BridgeConfig) -> Self {
        let link = Arc::new(Link::from_config(
            format!("bridge:{}", config.path),
            &config.target(),
        ));
        Self::with_link(config, link)
    }

    /// Endpoint forwarding to an existing link
    pub fn with_link(config: BridgeConfig, link: Arc<Link>) -> Self {
        Self {
            config,
            link,
            stop: Arc::new(AtomicBool::new(false)),
            port: None,
            server: None,
        }
    }

    /// Published serial path
    pub fn path(&self) -> &str {
        &self.config.path
    }

    /// Whether the server thread is running
    pub fn is_running(&self) -> bool {
        self.server.as_ref().map_or(false, |server| !server.is_finished())
    }

    /// Connect the target, publish the port and start serving
    pub async fn start(&mut self) -> Result<()> {
        if self.server.is_some() {
            return Ok(());
        }
        self.link.connect().await?;

        let mut port = VirtualSerial::open(&self.config.path, &self.config.uart)?;
        let mut master = port
            .take_master()
            .ok_or_else(|| DeviceError::transport("Virtual serial master already taken"))?;

        let handler = ForwardingHandler::new(
            self.link.clone(),
            Handle::current(),
            Duration::from_millis(self.config.forward_timeout_ms),
        );
        let server = RtuServer::new(self.config.unit_id, handler);
        let stop = self.stop.clone();
        stop.store(false, Ordering::SeqCst);
        let path = self.config.path.clone();

        let thread = std::thread::Builder::new()
            .name(format!("bridge-{}", self.config.unit_id))
            .spawn(move || {
                if let Err(e) = server.serve(&mut master, &stop) {
                    error!(path = %path, "Bridge server stopped: {}", e);
                }
            })?;

        info!(
            path = %self.config.path,
            target = %self.link.endpoint(),
            unit_id = self.config.unit_id,
            "Bridge started"
        );
        self.port = Some(port);
        self.server = Some(thread);
        Ok(())
    }

    /// Stop serving, remove the port and disconnect the target
    pub async fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(server) = self.server.take() {
            if tokio::task::spawn_blocking(move || server.join()).await.is_err() {
                warn!(path = %self.config.path, "Bridge server did not stop cleanly");
            }
        }
        if let Some(mut port) = self.port.take() {
            port.close();
        }
        self.link.disconnect().await;
        info!(path = %self.config.path, "Bridge stopped");
    }
}

/// Every configured bridge endpoint
#[derive(Debug, Default)]
pub struct BridgeSet {
    endpoints: Vec<BridgeEndpoint>,
}

impl BridgeSet {
    /// Endpoints for `configs`
    pub fn new(configs: &[BridgeConfig]) -> Self {
        Self {
            endpoints: configs.iter().cloned().map(BridgeEndpoint::new).collect(),
        }
    }

    /// Start every endpoint; returns how many started
    ///
    /// An endpoint that fails to start is logged and skipped.
    pub async fn start(&mut self) -> usize {
        let mut started = 0;
        for endpoint in &mut self.endpoints {
            match endpoint.start().await {
                Ok(()) => started += 1,
                Err(e) => warn!(path = %endpoint.path(), "Bridge failed to start: {}", e),
            }
        }
        info!(started, total = self.endpoints.len(), "Bridges started");
        started
    }

    /// Stop every endpoint
    pub async fn stop(&mut self) {
        for endpoint in &mut self.endpoints {
            endpoint.stop().await;
        }
    }

    /// The endpoints
    pub fn endpoints(&self) -> &[BridgeEndpoint] {
        &self.endpoints
    }
}
