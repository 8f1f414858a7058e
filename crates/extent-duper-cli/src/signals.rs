use std::future::Future;
use std::io;
use std::thread::{self, JoinHandle};

use extent_duper_core::SessionHandle;
use tokio::signal;
use tracing::{debug, warn};

/// Cancels the session on Ctrl+C or SIGTERM.
pub fn cancel_on_shutdown(handle: SessionHandle) -> io::Result<JoinHandle<()>> {
    cancel_on(handle, shutdown_signal)
}

/// Waits for `signal` on a dedicated thread and requests a cooperative stop when it resolves.
/// The thread is detached; if the session finishes first it is torn down with the process.
pub fn cancel_on<F, Fut>(handle: SessionHandle, signal: F) -> io::Result<JoinHandle<()>>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()>,
{
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    thread::Builder::new()
        .name("signal-watch".to_string())
        .spawn(move || {
            runtime.block_on(signal());
            warn!("Stop requested: finishing in-flight ranges, starting no new ones");
            handle.cancel();
        })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Could not listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Could not listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => debug!("Received Ctrl+C"),
        _ = terminate => debug!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use extent_duper_core::{ByteCompareShare, DedupeConfig, DedupeSession, SessionState};
    use std::sync::Arc;

    fn idle_session() -> DedupeSession {
        DedupeSession::new(Vec::new(), DedupeConfig::default(), Arc::new(ByteCompareShare::new())).unwrap()
    }

    #[test]
    fn test_signal_cancels_session() {
        let session = idle_session();
        let watcher = cancel_on(session.handle(), || async {}).unwrap();
        watcher.join().unwrap();

        let handle = session.handle();
        assert!(handle.is_cancelled());
        let report = session.run(&extent_duper_core::SilentReporter);
        assert!(report.cancelled);
        assert_eq!(handle.state(), SessionState::Done);
    }

    #[test]
    fn test_pending_signal_leaves_session_running() {
        let session = idle_session();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let watcher = cancel_on(session.handle(), move || async move {
            let _ = rx.await;
        })
        .unwrap();

        assert!(!session.handle().is_cancelled());
        tx.send(()).unwrap();
        watcher.join().unwrap();
        assert!(session.handle().is_cancelled());
    }
}
