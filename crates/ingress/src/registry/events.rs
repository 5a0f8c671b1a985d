//! Lifecycle events and the loop feeding them to the registry manager

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use wharf_common::Service;

use super::RegistryManager;

/// A container or service lifecycle event
///
/// Encoded as one JSON object per line:
/// `{"event": "container_start", "service": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "service", rename_all = "snake_case")]
pub enum ContainerEvent {
    ContainerStart(Service),
    ContainerKill(Service),
    ServiceCreate(Service),
    ServiceRemove(Service),
}

impl ContainerEvent {
    pub fn service(&self) -> &Service {
        match self {
            ContainerEvent::ContainerStart(s)
            | ContainerEvent::ContainerKill(s)
            | ContainerEvent::ServiceCreate(s)
            | ContainerEvent::ServiceRemove(s) => s,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ContainerEvent::ContainerStart(_) => "container_start",
            ContainerEvent::ContainerKill(_) => "container_kill",
            ContainerEvent::ServiceCreate(_) => "service_create",
            ContainerEvent::ServiceRemove(_) => "service_remove",
        }
    }
}

/// Drains events into a [`RegistryManager`], one at a time
pub struct EventLoop {
    manager: Arc<RegistryManager>,
    rx: mpsc::Receiver<ContainerEvent>,
}

impl EventLoop {
    /// Create a loop and the sender feeding it.
    pub fn channel(
        manager: Arc<RegistryManager>,
        capacity: usize,
    ) -> (mpsc::Sender<ContainerEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { manager, rx })
    }

    /// Run until every sender is dropped.
    ///
    /// A failing event is logged and the loop moves on; events are not
    /// retried.
    pub async fn run(mut self) {
        info!("Starting event loop");
        let mut handled = 0u64;
        let mut failed = 0u64;

        while let Some(event) = self.rx.recv().await {
            let service = event.service();
            match self.manager.handle(&event).await {
                Ok(()) => {
                    handled += 1;
                    debug!(
                        event = event.kind(),
                        service = %service.name,
                        "Event handled"
                    );
                }
                Err(e) => {
                    failed += 1;
                    error!(
                        event = event.kind(),
                        service = %service.name,
                        domain = %service.domain,
                        error = %e,
                        "Event handling failed"
                    );
                }
            }
        }

        info!(handled = handled, failed = failed, "Event loop stopped");
    }
}

/// Parse JSON event lines from `reader` and forward them to `tx`.
///
/// Blank lines are skipped; malformed lines and invalid services are
/// logged and dropped. Returns the number of forwarded events once the
/// reader is exhausted or the loop has gone away.
pub async fn read_event_lines<R>(
    reader: R,
    tx: mpsc::Sender<ContainerEvent>,
) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut forwarded = 0;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let event: ContainerEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Discarding malformed event");
                continue;
            }
        };
        if let Err(e) = event.service().validate() {
            warn!(event = event.kind(), error = %e, "Discarding event with invalid service");
            continue;
        }

        if tx.send(event).await.is_err() {
            debug!("Event loop closed, stop reading");
            break;
        }
        forwarded += 1;
    }

    Ok(forwarded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{MemoryTableStorage, ServiceTable};
    use crate::testing::{RecordingRegistry, RecordingRequester};
    use wharf_common::{AutoTls, ServiceKind};
    use wharf_config::TableConfig;

    #[test]
    fn test_event_wire_format() {
        let line = r#"{"event":"container_start","service":{"name":"web","domain":"web.example.com","auto_tls":"acme","upstream":"10.0.0.2:80"}}"#;
        let event: ContainerEvent = serde_json::from_str(line).unwrap();
        assert_eq!(event.kind(), "container_start");
        let service = event.service();
        assert_eq!(service.kind, ServiceKind::Container);
        assert_eq!(service.auto_tls, Some(AutoTls::Acme));

        let back = serde_json::to_value(&event).unwrap();
        assert_eq!(back["event"], "container_start");
        assert_eq!(back["service"]["domain"], "web.example.com");
    }

    #[tokio::test]
    async fn test_read_event_lines_skips_bad_input() {
        let input = concat!(
            "\n",
            "not json\n",
            r#"{"event":"container_start","service":{"name":"web","domain":"web.example.com","upstream":"10.0.0.2:80"}}"#,
            "\n",
            r#"{"event":"container_start","service":{"name":"web","domain":"bad domain","upstream":"10.0.0.2:80"}}"#,
            "\n",
            r#"{"event":"service_remove","service":{"name":"api","domain":"api.example.com","kind":"service"}}"#,
            "\n",
        );
        let (tx, mut rx) = mpsc::channel(8);
        let forwarded = read_event_lines(input.as_bytes(), tx).await.unwrap();
        assert_eq!(forwarded, 2);

        assert_eq!(rx.recv().await.unwrap().kind(), "container_start");
        assert_eq!(rx.recv().await.unwrap().kind(), "service_remove");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_event_loop_continues_after_failure() {
        let services = Arc::new(
            ServiceTable::open(&TableConfig::default(), Arc::new(MemoryTableStorage::new()))
                .unwrap(),
        );
        let registry = Arc::new(RecordingRegistry::full(services.clone()));
        registry.fail_next();
        let manager = Arc::new(RegistryManager::new(
            registry.clone(),
            Arc::new(RecordingRequester::default()),
            services,
        ));

        let (tx, event_loop) = EventLoop::channel(manager, 4);
        let handle = tokio::spawn(event_loop.run());

        let web = Service::container("web", "web.example.com", "10.0.0.2:80");
        tx.send(ContainerEvent::ContainerStart(web.clone()))
            .await
            .unwrap();
        tx.send(ContainerEvent::ContainerStart(web)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(registry.calls(), vec!["add_service:web", "reload"]);
    }
}
