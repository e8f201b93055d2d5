//! Forwarding resolution.
//!
//! A node may declare that one of its ports is really an alias for a port
//! on an internally owned child node. The engine only ever consumes the
//! flattened result: before a connection or value binding is recorded, the
//! origin port is collapsed through the chain to a concrete leaf.

use crate::error::{Error, Result};
use crate::topology::{Node, PortId, Topology};

/// Chains longer than this cannot terminate in practice and are reported as
/// non-terminating at resolution time.
const MAX_DEPTH: usize = 64;

impl Topology {
    /// Declare a forward. Declaration is monotonic within a node's
    /// initialization: an origin port, once forwarding, can never be
    /// re-pointed at a second destination.
    pub fn forward_port(
        &mut self,
        node: Node,
        port: PortId,
        child: Node,
        child_port: PortId,
    ) -> Result<()> {
        if !self.contains(child) {
            return Err(Error::InvalidHandle);
        }
        if child == node {
            return Err(Error::ForwardToSelf);
        }
        let record = self.nodes.get_mut(node.0).ok_or(Error::InvalidHandle)?;
        if record.forwards.contains_key(&port) {
            return Err(Error::AlreadyForwarded);
        }
        record.forwards.insert(port, (child, child_port));
        Ok(())
    }

    /// Collapse a (node, port) pair through forwarding declarations until a
    /// concrete port is reached.
    pub fn resolve_forward(&self, node: Node, port: PortId) -> Result<(Node, PortId)> {
        let (mut node, mut port) = (node, port);
        for _ in 0..MAX_DEPTH {
            let record = self.node(node)?;
            match record.forwards.get(&port) {
                Some(&(next, next_port)) => {
                    node = next;
                    port = next_port;
                }
                None => return Ok((node, port)),
            }
        }
        Err(Error::ForwardingDepthExceeded)
    }
}
