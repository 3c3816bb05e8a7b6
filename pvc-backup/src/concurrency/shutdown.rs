use std::future::pending;

use tokio::sync::watch;

/// Sending half of the shutdown signal held by the binary.
#[derive(Debug, Clone)]
pub struct ShutdownTx(watch::Sender<()>);

impl ShutdownTx {
    pub fn shutdown(&self) -> Result<(), watch::error::SendError<()>> {
        self.0.send(())
    }

    pub fn subscribe(&self) -> ShutdownRx {
        self.0.subscribe()
    }
}

/// Receiving half of the shutdown signal, one per attempt or batch.
pub type ShutdownRx = watch::Receiver<()>;

/// Output of work that can be interrupted by shutdown.
///
/// `Shutdown` carries whatever partial state the interrupted work produced.
#[derive(Debug)]
pub enum ShutdownResult<T, I> {
    Ok(T),
    Shutdown(I),
}

impl<T, I> ShutdownResult<T, I> {
    pub fn should_shutdown(&self) -> bool {
        matches!(self, ShutdownResult::Shutdown(_))
    }
}

pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(());
    (ShutdownTx(tx), rx)
}

/// Completes once shutdown has been signalled on `rx`.
///
/// If every sender is dropped without signalling, shutdown can no longer be
/// requested and the future stays pending.
pub async fn shutdown_requested(mut rx: ShutdownRx) {
    if rx.changed().await.is_err() {
        pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_requested_completes_after_signal() {
        let (tx, rx) = create_shutdown_channel();
        let waiter = tokio::spawn(shutdown_requested(rx));

        tx.shutdown().unwrap();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_sender_never_requests_shutdown() {
        let (tx, rx) = create_shutdown_channel();
        drop(tx);

        let result = tokio::time::timeout(Duration::from_secs(5), shutdown_requested(rx)).await;
        assert!(result.is_err());
    }
}
