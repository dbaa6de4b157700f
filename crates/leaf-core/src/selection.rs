//! Proxy selection for dial attempts.

use crate::backoff::ProxySelection;
use crate::session::Transport;
use leaf_proxy::ProxyDirective;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Configured proxies plus the selection cursor
#[derive(Debug)]
pub struct ProxyPool {
    directives: Vec<ProxyDirective>,
    strategy: ProxySelection,
    cursor: AtomicUsize,
}

impl ProxyPool {
    /// Create a pool; an empty list means direct connections
    #[must_use]
    pub fn new(directives: Vec<ProxyDirective>, strategy: ProxySelection) -> Self {
        Self {
            directives,
            strategy,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Transport for the next dial to the node at `node_index` in the
    /// current snapshot
    #[must_use]
    pub fn select(&self, node_index: usize) -> Transport {
        if self.directives.is_empty() {
            return Transport::Direct;
        }
        let index = match self.strategy {
            ProxySelection::RoundRobin => self.cursor.fetch_add(1, Ordering::Relaxed),
            ProxySelection::Sticky => node_index,
        } % self.directives.len();
        Transport::Proxied(self.directives[index].clone())
    }
}
