//! Background network monitoring.
//!
//! The monitor rediscovers the network periodically and as soon as the
//! border router reports a change of its routing tree.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::topology::{Node, TrapCallback, VarRef};
use crate::transport::Transport;

use super::Client;

/// Rediscovery period without tree changes.
const MONITOR_INTERVAL: Duration = Duration::from_secs(60);

/// Notification handle of the tree version trap.
const TREE_VERSION_HANDLE: u8 = 0x12;

pub(super) struct MonitorTask {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl<T: Transport> Client<T> {
    /// Start monitoring the network in the background.
    ///
    /// Discovers at once if no node is known yet, subscribes to the border
    /// router's `JenNet`/`TreeVersion` and rediscovers every 60 seconds or
    /// whenever the tree version changes. Join and leave events go to
    /// [`subscribe`](Self::subscribe) receivers.
    ///
    /// Does nothing if the monitor is already running.
    pub fn monitor_network(&self) {
        let mut slot = self.monitor_slot();
        if slot.as_ref().is_some_and(|monitor| !monitor.task.is_finished()) {
            return;
        }
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.clone().run_monitor(cancel.clone()));
        tracing::info!(target: "async_jip::discovery", "network monitor started");
        *slot = Some(MonitorTask { cancel, task });
    }

    /// Stop the monitor and wait for it to unsubscribe.
    pub async fn stop_monitor(&self) {
        let Some(monitor) = self.monitor_slot().take() else {
            return;
        };
        monitor.cancel.cancel();
        if let Err(e) = monitor.task.await {
            tracing::warn!(target: "async_jip::discovery", { error = %e }, "network monitor task failed");
        }
        tracing::info!(target: "async_jip::discovery", "network monitor stopped");
    }

    async fn run_monitor(self, cancel: CancellationToken) {
        let changed = Arc::new(Notify::new());
        let mut trapped = None;

        if self.inner.network.is_empty() {
            self.discover_logged().await;
        }

        loop {
            if trapped.is_none() {
                trapped = self.trap_tree_version(&changed).await;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(MONITOR_INTERVAL) => {}
                _ = changed.notified() => {
                    tracing::debug!(target: "async_jip::discovery", "tree version changed");
                }
            }
            if cancel.is_cancelled() {
                break;
            }
            self.discover_logged().await;
        }

        if let Some(address) = trapped
            && let Some(mut node) = self.inner.network.lookup_node(address).await
            && let Some(var) = tree_version(&node)
            && let Err(e) = self.untrap_var(&mut node, var).await
        {
            tracing::debug!(target: "async_jip::discovery", { error = %e }, "untrapping tree version failed");
        }
    }

    async fn discover_logged(&self) {
        if let Err(e) = self.discover_network().await {
            tracing::warn!(target: "async_jip::discovery", { error = %e }, "network discovery failed");
        }
    }

    /// Subscribe to the border router's tree version.
    ///
    /// Returns the border router's address on success.
    async fn trap_tree_version(&self, changed: &Arc<Notify>) -> Option<std::net::SocketAddr> {
        let result: Result<std::net::SocketAddr> = async {
            let address = self.coordinator_address();
            let mut node = self
                .inner
                .network
                .lookup_node(address)
                .await
                .ok_or_else(|| Error::UnknownNode { address }.boxed())?;
            let var = tree_version(&node).ok_or_else(|| {
                Error::UnknownVar {
                    node: address,
                    mib: "JenNet".into(),
                    var: "TreeVersion".into(),
                }
                .boxed()
            })?;
            let notify = changed.clone();
            let callback: TrapCallback = Arc::new(move |_: &Node, _: VarRef| notify.notify_one());
            self.trap_var(&mut node, var, TREE_VERSION_HANDLE, callback)
                .await?;
            Ok(node.address)
        }
        .await;

        match result {
            Ok(address) => Some(address),
            Err(e) => {
                tracing::debug!(target: "async_jip::discovery", { error = %e }, "tree version trap not set, polling only");
                None
            }
        }
    }
}

fn tree_version(node: &Node) -> Option<VarRef> {
    node.find_var("JenNet", "TreeVersion")
}
