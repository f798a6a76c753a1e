//! Waiting for a peer to become reachable.
//!
//! Waiters subscribe to the topology counter and to the owning session's
//! status before looking at either, so a transition between setup and
//! wait cannot be missed.

use crate::engine::Engine;
use crate::session::{PeerStatus, SessionEvent};
use crate::{EngineError, Result};
use std::net::IpAddr;
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

impl Engine {
    /// Wait until the peer owning `ip` answers over an established path.
    ///
    /// Only confirmations newer than this call count, so a path that went
    /// quiet before the call does not satisfy it. Returns false if `cancel`
    /// fires or the engine closes first.
    pub async fn await_reachable(&self, cancel: &CancellationToken, ip: IpAddr) -> bool {
        let start = Instant::now();
        match self.wait_for(cancel, ip, |status| status.confirmed_since(start)).await {
            Ok(()) => {
                tracing::debug!(parent: self.span(), %ip, waited = ?start.elapsed(), "peer reachable");
                true
            }
            Err(_) => false,
        }
    }

    /// Wait until the peer owning `ip` has any established path.
    pub(crate) async fn wait_for_path(&self, cancel: &CancellationToken, ip: IpAddr) -> Result<()> {
        self.wait_for(cancel, ip, |status| status.state.is_established()).await
    }

    async fn wait_for(
        &self,
        cancel: &CancellationToken,
        ip: IpAddr,
        done: impl Fn(&PeerStatus) -> bool,
    ) -> Result<()> {
        self.ensure_open()?;
        let closed = self.cancel_token();
        let shared = self.shared();
        let mut topology = shared.subscribe_topology();

        loop {
            topology.borrow_and_update();
            if let Some(session) = shared.session_for_ip(&ip) {
                let mut status = session.subscribe();
                if done(&status.borrow_and_update()) {
                    return Ok(());
                }
                session.send(SessionEvent::ProbeNow);

                if watch_session(cancel, closed, &mut status, &mut topology, &done).await? {
                    return Ok(());
                }
                continue;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = closed.cancelled() => return Err(EngineError::Closed),
                res = topology.changed() => if res.is_err() { return Err(EngineError::Closed) },
            }
        }
    }
}

/// Follow one session until `done` holds (true) or the topology changes
/// and the owner must be looked up again (false).
async fn watch_session(
    cancel: &CancellationToken,
    closed: &CancellationToken,
    status: &mut watch::Receiver<PeerStatus>,
    topology: &mut watch::Receiver<u64>,
    done: &impl Fn(&PeerStatus) -> bool,
) -> Result<bool> {
    let mut session_open = true;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            _ = closed.cancelled() => return Err(EngineError::Closed),
            res = status.changed(), if session_open => match res {
                Ok(()) => {
                    if done(&status.borrow_and_update()) {
                        return Ok(true);
                    }
                }
                // The worker is gone; wait for the directory to move on.
                Err(_) => session_open = false,
            },
            res = topology.changed() => {
                if res.is_err() {
                    return Err(EngineError::Closed);
                }
                return Ok(false);
            }
        }
    }
}
