// =============================================================================
// NotificationBus (C10) — §4.10
// =============================================================================
//
// Fire-and-forget publish with a bounded retry on the send itself; never
// blocks the caller (the channel send is the only operation on the hot
// path, and it is bounded so a stalled consumer applies backpressure
// rather than unbounded memory growth). The bundled consumer logs every
// notification at a severity-matched level, the same way this codebase's
// other components already turn domain events into structured log lines.
// A production deployment can swap in a consumer that also pushes to a
// chat webhook or push-notification service without touching call sites.
// =============================================================================

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::types::{Notification, NotificationSeverity};

const CHANNEL_CAPACITY: usize = 1024;
const SEND_RETRY_ATTEMPTS: u32 = 3;

#[derive(Clone)]
pub struct NotificationBus {
    tx: mpsc::Sender<Notification>,
}

impl NotificationBus {
    /// Spawns the background consumer task and returns the handle callers
    /// publish through. The returned `JoinHandle` is for shutdown; dropping
    /// every clone of the bus's sender ends the consumer loop.
    pub fn spawn() -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);

        let handle = tokio::spawn(async move {
            while let Some(n) = rx.recv().await {
                log_notification(&n);
            }
        });

        (Self { tx }, handle)
    }

    /// Publish a notification. Fire-and-forget: retries the channel send a
    /// few times on transient backpressure, then drops the notification
    /// with a warning rather than ever blocking the orchestrator.
    pub async fn publish(&self, notification: Notification) {
        let mut attempt = 0;
        let mut pending = notification;

        loop {
            match self.tx.try_send(pending) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(n)) => {
                    attempt += 1;
                    if attempt >= SEND_RETRY_ATTEMPTS {
                        warn!("notification bus full, dropping notification after retries");
                        return;
                    }
                    pending = n;
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!("notification bus closed, dropping notification");
                    return;
                }
            }
        }
    }
}

fn log_notification(n: &Notification) {
    match n.severity {
        NotificationSeverity::Critical | NotificationSeverity::Error => {
            error!(scope = ?n.scope, title = %n.title, body = %n.body, tags = ?n.tags, "notification")
        }
        NotificationSeverity::Warn => {
            warn!(scope = ?n.scope, title = %n.title, body = %n.body, tags = ?n.tags, "notification")
        }
        NotificationSeverity::Info | NotificationSeverity::Success => {
            info!(scope = ?n.scope, title = %n.title, body = %n.body, tags = ?n.tags, "notification")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NotificationScope;

    #[tokio::test]
    async fn publish_does_not_block_on_healthy_consumer() {
        let (bus, handle) = NotificationBus::spawn();
        bus.publish(Notification {
            scope: NotificationScope::Global,
            title: "test".into(),
            body: "body".into(),
            severity: NotificationSeverity::Info,
            tags: vec![],
        })
        .await;
        drop(bus);
        handle.await.unwrap();
    }
}
