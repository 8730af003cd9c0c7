//! The contract between the lifecycle manager and a network transport.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::context::LogContext;
use crate::middleware::MiddlewareChain;

/// A boundary component that accepts external calls and maps them onto endpoints.
///
/// The lifecycle manager drives every transport through exactly three steps:
/// `register_endpoints` once before anything starts, `start` concurrently
/// with all other transports, and `shutdown` once when the process stops.
/// It never reaches into transport internals.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name used in logs (e.g., `"http"`).
    fn name(&self) -> &'static str;

    /// Binds every endpoint through `chain` and stores the logger binding.
    ///
    /// Called once, before `start`. A failure aborts the run before any transport starts.
    async fn register_endpoints(
        &mut self,
        chain: &MiddlewareChain,
        logging: &LogContext,
    ) -> anyhow::Result<()>;

    /// Serves until `cancel` fires, `shutdown` completes, or a fatal error occurs.
    ///
    /// Returning an error is fatal to the whole process.
    async fn start(&self, cancel: CancellationToken) -> anyhow::Result<()>;

    /// Stops accepting new calls and drains in-flight ones.
    ///
    /// `cancel` fires when the drain deadline has passed; implementations
    /// should abandon remaining work at that point and return.
    async fn shutdown(&self, cancel: CancellationToken) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;

    struct Idle {
        registered: bool,
        stopped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Transport for Idle {
        fn name(&self) -> &'static str {
            "idle"
        }

        async fn register_endpoints(
            &mut self,
            _chain: &MiddlewareChain,
            _logging: &LogContext,
        ) -> anyhow::Result<()> {
            self.registered = true;
            Ok(())
        }

        async fn start(&self, cancel: CancellationToken) -> anyhow::Result<()> {
            cancel.cancelled().await;
            Ok(())
        }

        async fn shutdown(&self, _cancel: CancellationToken) -> anyhow::Result<()> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn drives_boxed_transport() {
        let stopped = Arc::new(AtomicBool::new(false));
        let mut transport: Box<dyn Transport> = Box::new(Idle {
            registered: false,
            stopped: Arc::clone(&stopped),
        });

        transport
            .register_endpoints(&MiddlewareChain::new(), &LogContext::default())
            .await
            .unwrap();
        assert_eq!(transport.name(), "idle");

        let transport: Arc<dyn Transport> = Arc::from(transport);
        let token = CancellationToken::new();
        let running = tokio::spawn({
            let transport = Arc::clone(&transport);
            let token = token.clone();
            async move { transport.start(token).await }
        });

        transport.shutdown(CancellationToken::new()).await.unwrap();
        token.cancel();
        running.await.unwrap().unwrap();
        assert!(stopped.load(Ordering::SeqCst));
    }
}
