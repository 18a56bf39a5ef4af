//! Watch of the routes ConfigMap, turned into reconciler events
//!
//! The watcher reports object states; the reconciler wants transitions. The
//! translator remembers the last delivered data and emits Created, Updated
//! (old, new) or Deleted. A relist that no longer contains the ConfigMap
//! counts as a delete.

use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube_runtime::watcher::{self, watcher};
use kube_runtime::WatchStreamExt;
use tracing::{debug, info, warn};

use route_api::{canonical_string, RouteData};
use route_core::{Event, ReconcilerHandle};

use crate::KubeClient;

/// Turns watcher events for one ConfigMap into reconciler events
#[derive(Debug, Default)]
pub struct EventTranslator {
    current: Option<RouteData>,
    /// ConfigMap seen during a relist, `None` until one shows up
    relisted: Option<RouteData>,
}

impl EventTranslator {
    pub fn translate(&mut self, event: watcher::Event<ConfigMap>) -> Option<Event> {
        match event {
            watcher::Event::Apply(cm) => {
                let data = cm.data.unwrap_or_default();
                self.transition(Some(data))
            }
            watcher::Event::Delete(cm) => {
                let data = cm.data.unwrap_or_default();
                self.current.take().map(|_| Event::Deleted(data))
            }
            watcher::Event::Init => {
                debug!("Relisting routes ConfigMap");
                self.relisted = None;
                None
            }
            watcher::Event::InitApply(cm) => {
                self.relisted = Some(cm.data.unwrap_or_default());
                None
            }
            watcher::Event::InitDone => {
                let relisted = self.relisted.take();
                self.transition(relisted)
            }
        }
    }

    fn transition(&mut self, next: Option<RouteData>) -> Option<Event> {
        match (self.current.take(), next) {
            (None, None) => None,
            (None, Some(new)) => {
                self.current = Some(new.clone());
                Some(Event::Created(new))
            }
            (Some(old), None) => Some(Event::Deleted(old)),
            (Some(old), Some(new)) if old == new => {
                debug!("Routes ConfigMap unchanged: {}", canonical_string(&new));
                self.current = Some(new);
                None
            }
            (Some(old), Some(new)) => {
                self.current = Some(new.clone());
                Some(Event::Updated { old, new })
            }
        }
    }
}

/// Watch the named ConfigMap and feed its changes into the reconciler queue.
///
/// Returns when the reconciler stops accepting events.
pub async fn watch_routes(client: &KubeClient, name: &str, handle: ReconcilerHandle) -> anyhow::Result<()> {
    info!("Watching ConfigMap {}/{}", client.namespace(), name);
    let config = watcher::Config::default().fields(&format!("metadata.name={}", name));
    let mut stream = watcher(client.config_maps(), config).default_backoff().boxed();
    let mut translator = EventTranslator::default();

    while let Some(result) = stream.next().await {
        match result {
            Ok(event) => {
                if let Some(event) = translator.translate(event) {
                    handle.send(event).await?;
                }
            }
            Err(e) => warn!("Routes ConfigMap watch error: {}", e),
        }
    }
    Ok(())
}
