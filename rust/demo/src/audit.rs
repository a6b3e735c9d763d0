//! Request audit trail, provided as a scoped capability.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::info;
use weft_effects::{Capability, Effect, Layer};

#[derive(Debug, Default)]
pub struct AuditLog {
    entries: Mutex<Vec<String>>,
    open: AtomicBool,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// Capability key for [`AuditLog`].
pub struct Audit;

impl Capability for Audit {
    const NAME: &'static str = "AuditLog";
    type Service = AuditLog;
}

/// Open `log` for the scope of one request and close it on the way out.
pub fn audit_layer<E>(log: Arc<AuditLog>) -> Layer<E>
where
    E: Send + 'static,
{
    let acquire = Effect::sync(move || {
        log.open();
        info!("audit log opened");
        log.clone()
    });
    Layer::scoped::<Audit, _>(acquire, |log: Arc<AuditLog>| {
        Effect::sync(move || {
            log.close();
            info!(entries = log.entries().len(), "audit log closed");
        })
    })
}
