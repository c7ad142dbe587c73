//! Trap subscriptions and notification handling.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tracing::instrument;

use crate::error::{Error, Result};
use crate::topology::{Capability, Network, Node, TrapCallback, VarRef};
use crate::transport::{Transport, TrapHandler};
use crate::wire::{Command, TrapRequest, VarDescription, VarEntry, VarStatus, decode_packet};

use super::{Client, unknown_var};

/// Build the connection's handler for inbound TRAP_NOTIFY packets.
///
/// The sender is looked up among the known nodes and the variable by the
/// MIB and variable indexes in the packet. The new value is stored before
/// the subscription's callback runs. The notification handle is not
/// checked.
pub(super) fn notify_handler(network: Arc<Network>) -> TrapHandler {
    Arc::new(move |packet: Bytes, source: SocketAddr| {
        let network = network.clone();
        Box::pin(async move { handle_notify(&network, packet, source).await })
    })
}

async fn handle_notify(network: &Network, packet: Bytes, source: SocketAddr) {
    let description = match decode_packet(packet, source)
        .and_then(|(_, body)| VarDescription::decode(body, source))
    {
        Ok(description) => description,
        Err(e) => {
            tracing::debug!(target: "async_jip::trap", { jip.source = %source, error = %e }, "dropping malformed trap notification");
            return;
        }
    };

    let Some(mut node) = network.lookup_node(source).await else {
        tracing::debug!(target: "async_jip::trap", { jip.source = %source }, "trap notification from unknown node");
        return;
    };
    let Some(var) = node
        .mib_by_index(description.mib_index)
        .and_then(|mib| {
            node.mibs[mib]
                .lookup_var_index(description.var_index)
                .map(|var| VarRef::new(mib, var))
        })
    else {
        tracing::debug!(
            target: "async_jip::trap",
            { jip.source = %source, jip.mib_index = description.mib_index, jip.var_index = description.var_index },
            "trap notification for unknown variable"
        );
        return;
    };

    let Some(slot) = node.var_mut(var) else {
        return;
    };
    match description.entries.into_iter().next() {
        Some(VarEntry::Value(value)) => {
            slot.enabled = true;
            if let Err(status) = slot.set_value(value) {
                tracing::debug!(target: "async_jip::trap", { jip.source = %source, jip.var = %slot.name, jip.status = %status }, "trap value rejected");
                return;
            }
        }
        Some(VarEntry::Error(status)) => {
            tracing::debug!(target: "async_jip::trap", { jip.source = %source, jip.var = %slot.name, jip.status = %status }, "trap notification carries error");
            return;
        }
        None => return,
    }

    let Some((handle, callback)) = slot.capability.trap() else {
        tracing::trace!(target: "async_jip::trap", { jip.source = %source, jip.var = %slot.name }, "no subscription for trapped variable");
        return;
    };
    tracing::trace!(target: "async_jip::trap", { jip.source = %source, jip.var = %slot.name, jip.handle = handle }, "trap notification");
    callback(&node, var);
}

impl<T: Transport> Client<T> {
    /// Subscribe to change notifications for a variable.
    ///
    /// `handle` is echoed back by the node in every notification. On success
    /// `callback` runs, with the node locked, after each notification has
    /// updated the variable. The callback must not lock the same node.
    #[instrument(skip(self, node, callback), err, fields(jip.node = %node.address, jip.mib = var.mib, jip.var = var.var))]
    pub async fn trap_var(
        &self,
        node: &mut Node,
        var: VarRef,
        handle: u8,
        callback: TrapCallback,
    ) -> Result<()> {
        let target = node.address;
        let request = trap_request(node, var, handle)?;
        let (body, source) = self
            .exchange_with(node, Command::TrapRequest, &request, Command::TrapResponse, false)
            .await?;
        let status = VarStatus::decode(body, source)?.status;
        if !status.is_ok() {
            tracing::debug!(target: "async_jip::trap", { jip.node = %target, jip.status = %status }, "node rejected TRAP_REQUEST");
            return Err(Error::status_from(target, status));
        }

        let slot = node.var_mut(var).ok_or_else(|| unknown_var(target, var))?;
        slot.capability = Capability::TrapSubscriber { handle, callback };
        Ok(())
    }

    /// Cancel a subscription made with [`trap_var`](Self::trap_var).
    ///
    /// The callback is dropped before the node is asked to unsubscribe, so
    /// it never runs again even if the request fails. A variable that is not
    /// subscribed is left alone.
    #[instrument(skip(self, node), err, fields(jip.node = %node.address, jip.mib = var.mib, jip.var = var.var))]
    pub async fn untrap_var(&self, node: &mut Node, var: VarRef) -> Result<()> {
        let target = node.address;
        let slot = node.var_mut(var).ok_or_else(|| unknown_var(target, var))?;
        let Some((handle, _)) = slot.capability.trap() else {
            return Ok(());
        };
        slot.capability = Capability::None;

        let request = trap_request(node, var, handle)?;
        let (body, source) = self
            .exchange_with(node, Command::UntrapRequest, &request, Command::TrapResponse, false)
            .await?;
        let status = VarStatus::decode(body, source)?.status;
        if !status.is_ok() {
            return Err(Error::status_from(target, status));
        }
        Ok(())
    }
}

fn trap_request(node: &Node, var: VarRef, handle: u8) -> Result<Bytes> {
    let target = node.address;
    let mib = node.mib(var).ok_or_else(|| unknown_var(target, var))?;
    let slot = node.var(var).ok_or_else(|| unknown_var(target, var))?;
    Ok(TrapRequest {
        handle,
        mib_index: mib.index,
        var_index: slot.index,
    }
    .encode())
}
