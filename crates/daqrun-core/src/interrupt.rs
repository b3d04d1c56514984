// daqrun-core/src/interrupt.rs
// Latched interrupt notification shared with the orchestrator
use tokio::sync::watch;
use tracing::warn;

/// Firing side of an [`Interrupt`].
#[derive(Debug)]
pub struct InterruptTrigger {
    tx: watch::Sender<bool>,
}

impl InterruptTrigger {
    pub fn fire(&self) {
        self.tx.send_replace(true);
    }
}

/// Becomes set once and stays set. The orchestrator checks it between steps
/// and races it against sleeps and process waits; a control command already
/// in flight is never cancelled by it.
#[derive(Debug, Clone)]
pub struct Interrupt {
    rx: watch::Receiver<bool>,
}

impl Interrupt {
    pub fn pair() -> (InterruptTrigger, Interrupt) {
        let (tx, rx) = watch::channel(false);
        (InterruptTrigger { tx }, Interrupt { rx })
    }

    /// An interrupt that never fires.
    pub fn never() -> Self {
        let (_, interrupt) = Self::pair();
        interrupt
    }

    /// Fire on the first Ctrl-C / SIGINT delivered to this process.
    /// Must be called inside a tokio runtime.
    pub fn on_ctrl_c() -> Self {
        let (trigger, interrupt) = Self::pair();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    warn!("interrupt received");
                    trigger.fire();
                }
                Err(e) => warn!("failed to listen for Ctrl-C: {}", e),
            }
        });
        interrupt
    }

    pub fn is_set(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the interrupt has fired; pends forever if it never can.
    pub async fn fired(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|set| *set).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
