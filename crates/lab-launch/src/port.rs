//! Local TCP port allocation.
//!
//! A port is picked by binding an ephemeral listener on localhost and
//! reading back what the OS assigned. The listener is closed right away so
//! the server can bind it, which leaves a window where another allocation
//! could see the same number. The pool closes that window by remembering
//! every port it handed out until it is released.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use log::{debug, warn};
use tokio::net::TcpListener;

use crate::LaunchError;

/// Bind attempts before giving up.
pub const MAX_ALLOCATION_ATTEMPTS: usize = 16;

/// Ports handed out to sessions that have not been released yet.
#[derive(Debug, Default)]
pub struct PortPool {
    reserved: HashSet<u16>,
}

impl PortPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a free port that is not already reserved.
    pub async fn allocate(&mut self) -> Result<u16, LaunchError> {
        for attempt in 1..=MAX_ALLOCATION_ATTEMPTS {
            match pick_ephemeral_port().await {
                Ok(port) if self.reserved.insert(port) => {
                    debug!("[port-pool] Allocated port {} (attempt {})", port, attempt);
                    return Ok(port);
                }
                Ok(port) => {
                    debug!("[port-pool] Port {} already reserved, retrying", port);
                }
                Err(e) => {
                    warn!("[port-pool] Failed to bind ephemeral port: {}", e);
                }
            }
        }

        Err(LaunchError::ResourceExhausted {
            attempts: MAX_ALLOCATION_ATTEMPTS,
        })
    }

    /// Mark a port as in use without binding, e.g. for a server found running at startup.
    ///
    /// Returns false if it was already reserved.
    pub fn claim(&mut self, port: u16) -> bool {
        self.reserved.insert(port)
    }

    /// Return a port to the pool. Returns false if it was not reserved.
    pub fn release(&mut self, port: u16) -> bool {
        let released = self.reserved.remove(&port);
        if released {
            debug!("[port-pool] Released port {}", port);
        }
        released
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved.contains(&port)
    }

    pub fn reserved_count(&self) -> usize {
        self.reserved.len()
    }
}

async fn pick_ephemeral_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}
