// channeld-core: payment channel daemon core library
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Resolve-then-connect peer bootstrap with per-address fallback.
//!
//! Resolution runs in a [`tokio::task::spawn_blocking`] worker so that
//! synchronous DNS I/O never blocks the caller's task; the worker reports
//! back over a [`tokio::sync::oneshot`] channel, the in-process analogue of
//! a pipe. The caller then tries each address in turn until one connects.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::oneshot;

#[derive(Debug, Display, Error)]
#[display(doc_comments)]
pub enum BootstrapError {
    /// address resolution failed: {0}
    ResolutionFailed(String),

    /// no reachable address for peer
    Exhausted,
}

/// Shared use-count between the resolution worker and in-flight connect
/// attempts. The last side to decrement — whichever that is — is the one
/// permitted to invoke the failure callback, guaranteeing no double-notify
/// and no lost notify when the worker's exit races the final connect
/// failure.
struct UseCount {
    count: AtomicUsize,
}

impl UseCount {
    fn new(initial: usize) -> Arc<Self> {
        Arc::new(UseCount { count: AtomicUsize::new(initial) })
    }

    /// Decrements the count; returns `true` if this call brought it to zero.
    fn release(&self) -> bool {
        self.count.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

/// Resolves `host:port` off the calling task, then attempts to connect to
/// each resulting address in order. Returns the first connected stream, or
/// calls `on_exhausted` exactly once if every address fails (or none were
/// returned).
pub async fn connect_with_fallback<F>(
    host_port: String,
    on_exhausted: F,
) -> Result<TcpStream, BootstrapError>
where
    F: FnOnce() + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    tokio::task::spawn_blocking(move || {
        let result = resolve_blocking(&host_port);
        let _ = tx.send(result);
    });

    let addresses = match rx.await {
        Ok(Ok(addrs)) => addrs,
        Ok(Err(err)) => {
            log::warn!("address resolution failed: {}", err);
            on_exhausted();
            return Err(BootstrapError::ResolutionFailed(err));
        }
        Err(_) => {
            log::warn!("address resolution worker dropped without a result");
            on_exhausted();
            return Err(BootstrapError::ResolutionFailed("resolution worker dropped".into()));
        }
    };

    if addresses.is_empty() {
        log::warn!("address resolution returned no candidates");
        on_exhausted();
        return Err(BootstrapError::Exhausted);
    }

    let use_count = UseCount::new(addresses.len());
    let mut on_exhausted = Some(on_exhausted);
    for addr in addresses {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                log::debug!("connected to {}", addr);
                return Ok(stream);
            }
            Err(err) => {
                log::debug!("connect to {} failed: {}", addr, err);
                if use_count.release() {
                    if let Some(cb) = on_exhausted.take() {
                        cb();
                    }
                }
            }
        }
    }
    Err(BootstrapError::Exhausted)
}

/// Synchronous address resolution, run inside `spawn_blocking`.
fn resolve_blocking(host_port: &str) -> Result<Vec<SocketAddr>, String> {
    use std::net::ToSocketAddrs as StdToSocketAddrs;
    host_port
        .to_socket_addrs()
        .map(|iter| iter.collect())
        .map_err(|err| err.to_string())
}

/// Connects directly to a known address, without the DNS-resolution step —
/// used when a caller already has a `peer_address` row from the persistence
/// layer and only needs the fallback-on-failure behavior.
pub async fn connect_first_reachable(
    addresses: Vec<impl ToSocketAddrs>,
) -> Result<TcpStream, BootstrapError> {
    for addr in addresses {
        if let Ok(stream) = TcpStream::connect(addr).await {
            return Ok(stream);
        }
    }
    Err(BootstrapError::Exhausted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn exhausted_addresses_invoke_callback_once() {
        let called = Arc::new(AtomicBool::new(false));
        let called2 = called.clone();
        let result = connect_with_fallback("127.0.0.1:1".to_string(), move || {
            called2.store(true, Ordering::SeqCst);
        })
        .await;
        assert!(result.is_err());
        assert!(called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn unresolvable_host_reports_resolution_failure() {
        let called = Arc::new(AtomicBool::new(false));
        let called2 = called.clone();
        let result =
            connect_with_fallback("not a valid host or port".to_string(), move || {
                called2.store(true, Ordering::SeqCst);
            })
            .await;
        assert!(matches!(result, Err(BootstrapError::ResolutionFailed(_))));
        assert!(called.load(Ordering::SeqCst));
    }
}
