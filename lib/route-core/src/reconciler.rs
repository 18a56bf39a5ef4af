//! Reconciler state machine
//!
//! Topology events and the shutdown request share one queue and are handled
//! strictly one at a time, so a shutdown cleanup never interleaves with a
//! reconciliation in flight.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use route_api::{canonical_string, RouteData, RouteRecord};

use crate::apply::{Applier, ApplyReport};
use crate::facts::RouteEntry;
use crate::host::HostNetwork;
use crate::plan::Planner;
use crate::{CoreError, Result};

const EVENT_QUEUE_SIZE: usize = 64;

/// Changes to the routes record, plus the shutdown request
#[derive(Debug)]
pub enum Event {
    Created(RouteData),
    Updated { old: RouteData, new: RouteData },
    Deleted(RouteData),
    /// Tear down what is applied, then acknowledge
    Shutdown(oneshot::Sender<ApplyReport>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcilerState {
    Idle,
    Applied,
}

/// Reconciler owns the last applied record of this node
pub struct Reconciler<H: ?Sized> {
    planner: Planner,
    applier: Applier<H>,
    last_applied: Option<RouteRecord>,
}

impl<H: HostNetwork + ?Sized> Reconciler<H> {
    pub fn new(planner: Planner, host: Arc<H>) -> Self {
        Self {
            planner,
            applier: Applier::new(host),
            last_applied: None,
        }
    }

    pub fn state(&self) -> ReconcilerState {
        match self.last_applied {
            Some(_) => ReconcilerState::Applied,
            None => ReconcilerState::Idle,
        }
    }

    pub fn last_applied(&self) -> Option<&RouteRecord> {
        self.last_applied.as_ref()
    }

    /// Consume events until shutdown or until every sender is gone.
    ///
    /// Returns the first error a plan raises; those are consistency or
    /// dependency failures the caller should treat as fatal.
    pub async fn run(mut self, mut events: mpsc::Receiver<Event>) -> Result<()> {
        while let Some(event) = events.recv().await {
            if let Event::Shutdown(ack) = event {
                let report = self.shutdown().await;
                if ack.send(report).is_err() {
                    debug!("Shutdown requester went away before the cleanup finished");
                }
                return Ok(());
            }
            self.handle(event).await?;
        }
        info!("Event queue closed");
        self.shutdown().await;
        Ok(())
    }

    /// Process one topology event to completion
    pub async fn handle(&mut self, event: Event) -> Result<ApplyReport> {
        match event {
            Event::Created(data) => self.created(&data).await,
            Event::Updated { old, new } => self.updated(&old, &new).await,
            Event::Deleted(data) => self.deleted(&data).await,
            Event::Shutdown(ack) => {
                let report = self.shutdown().await;
                if ack.send(report).is_err() {
                    debug!("Shutdown requester went away before the cleanup finished");
                }
                Ok(report)
            }
        }
    }

    /// Tear down the last applied record, if any
    pub async fn shutdown(&mut self) -> ApplyReport {
        let Some(applied) = self.last_applied.take() else {
            info!("No routes applied, nothing to clean up");
            return ApplyReport::default();
        };
        info!("Cleaning up routes for {}", applied.canonical());
        let routes = self.current_routes().await;
        match self.planner.compute_plan(Some(&applied), None, &routes) {
            Ok(plan) => self.applier.apply(&plan).await,
            Err(e) => {
                warn!("Failed to plan route cleanup: {}", e);
                ApplyReport::default()
            }
        }
    }

    async fn created(&mut self, data: &RouteData) -> Result<ApplyReport> {
        info!("Routes record created: {}", canonical_string(data));
        let record = RouteRecord::from_data(data)?;
        if let Some(applied) = &self.last_applied {
            if applied.canonical() == record.canonical() {
                info!("Routes record matches what is applied, nothing to do");
                return Ok(ApplyReport::default());
            }
        }
        let old = self.last_applied.clone();
        self.reconcile(old, record).await
    }

    async fn updated(&mut self, old: &RouteData, new: &RouteData) -> Result<ApplyReport> {
        info!("Routes record updated: {}", canonical_string(new));
        let old_record = RouteRecord::from_data(old)?;
        let new_record = RouteRecord::from_data(new)?;

        let basis = match &self.last_applied {
            Some(applied) => applied.clone(),
            None => {
                warn!("No applied routes recorded, using the previous record instead");
                old_record.clone()
            }
        };
        if basis.canonical() == new_record.canonical() {
            info!("Routes record matches what is applied, nothing to do");
            return Ok(ApplyReport::default());
        }
        if basis.canonical() != old_record.canonical() {
            warn!(
                "Applied routes {} do not match the previous record {}",
                basis.canonical(),
                old_record.canonical()
            );
        }
        self.reconcile(Some(basis), new_record).await
    }

    async fn deleted(&mut self, data: &RouteData) -> Result<ApplyReport> {
        info!("Routes record deleted: {}", canonical_string(data));
        let Some(applied) = &self.last_applied else {
            info!("No routes applied, nothing to remove");
            return Ok(ApplyReport::default());
        };
        let routes = self.current_routes().await;
        let plan = self.planner.compute_plan(Some(applied), None, &routes)?;
        self.last_applied = None;
        Ok(self.applier.apply(&plan).await)
    }

    /// Tear down `old` and build up `new`. Only complete records are
    /// remembered as applied; a rejected plan leaves `last_applied` alone
    /// since nothing was torn down.
    async fn reconcile(&mut self, old: Option<RouteRecord>, new: RouteRecord) -> Result<ApplyReport> {
        let routes = self.current_routes().await;
        let plan = self.planner.compute_plan(old.as_ref(), Some(&new), &routes)?;
        let report = self.applier.apply(&plan).await;
        info!(
            "Reconciled routes: {} applied, {} skipped, {} failed",
            report.applied, report.skipped, report.failed
        );
        self.last_applied = new.is_complete().then_some(new);
        Ok(report)
    }

    /// Main routing table as it is now, falling back to the startup snapshot
    async fn current_routes(&self) -> Vec<RouteEntry> {
        match self.applier.host().list_routes(None).await {
            Ok(routes) if !routes.is_empty() => routes,
            Ok(_) => self.planner.facts().routes.clone(),
            Err(e) => {
                warn!("Failed to retrieve routing table, using the startup copy: {}", e);
                self.planner.facts().routes.clone()
            }
        }
    }
}

/// Cloneable front of the reconciler queue
#[derive(Clone, Debug)]
pub struct ReconcilerHandle {
    sender: mpsc::Sender<Event>,
}

impl ReconcilerHandle {
    /// Create the queue; hand the receiver to [`Reconciler::run`]
    pub fn channel() -> (Self, mpsc::Receiver<Event>) {
        let (sender, receiver) = mpsc::channel(EVENT_QUEUE_SIZE);
        (Self { sender }, receiver)
    }

    pub async fn send(&self, event: Event) -> Result<()> {
        self.sender
            .send(event)
            .await
            .map_err(|_| CoreError::Internal("reconciler is no longer running".to_string()))
    }

    /// Queue a shutdown behind every pending event and wait for the cleanup
    pub async fn shutdown(&self) -> Result<ApplyReport> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Shutdown(tx)).await?;
        rx.await
            .map_err(|_| CoreError::Internal("reconciler stopped before cleaning up".to_string()))
    }
}
