//! # Channel
//!
//! The real-time channel as the session sees it: a queue of text frames
//! going out and a queue of text frames coming in. Delivery is
//! at-most-once; there is no retry and no acknowledgement.
//!
//! ```text
//!   SessionHandle                 relay                  SessionHandle
//!   ─────────────                 ─────                  ─────────────
//!   outbound ──── frame ────►  route by receiver  ────►  inbound
//!   inbound  ◄──────────────   (drop if offline)  ◄────  outbound
//! ```

mod memory;

pub use memory::MemoryRelay;

use tokio::sync::mpsc;

/// One user's connection to the channel
#[derive(Debug)]
pub struct ChannelEndpoint {
    /// Frames we send
    pub outbound: mpsc::Sender<String>,
    /// Frames addressed to us
    pub inbound: mpsc::Receiver<String>,
}

impl ChannelEndpoint {
    /// Build an endpoint from raw queue ends
    pub fn new(outbound: mpsc::Sender<String>, inbound: mpsc::Receiver<String>) -> Self {
        Self { outbound, inbound }
    }
}
