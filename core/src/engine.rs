//! The lifecycle engine: wires store, config, clock and transport.
//!
//! ADMISSION ORDER (fixed):
//!   1. Validate the brief            (ValidationFailed, nothing stored)
//!   2. Reserve quota                 (QuotaExceeded, nothing stored)
//!   3. In one transaction: create the pending record, count and audit
//!      it, move it to processing      (quota refunded on rollback)
//!   4. Send to the workflow engine   (DispatchFailed leaves the record failed)
//!
//! After dispatch the only mutation paths are `handle_callback` and the
//! stale-processing sweep. Neither touches a terminal record.

use crate::{
    clock::{Clock, SystemClock},
    config::LifecycleConfig,
    dispatcher::{HttpTransport, WorkflowDispatcher, WorkflowTransport},
    error::{SimError, SimResult},
    event::{EventLogEntry, LifecycleEvent},
    export::{self, ExportFormat, ExportRenderer},
    metrics::{DailyMetric, MetricsAggregator},
    quota::{QuotaGate, QuotaStatus},
    reconciler::WebhookReconciler,
    simulation::{SimulationError, SimulationRecord, StatusView, ERROR_PROCESSING_TIMEOUT},
    store::SimStore,
    types::{OwnerRef, SimulationId},
};
use chrono::{Duration, NaiveDate};
use std::sync::Arc;

pub struct LifecycleEngine {
    pub store: SimStore,
    pub config: LifecycleConfig,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn WorkflowTransport>,
}

impl LifecycleEngine {
    pub fn new(
        store: SimStore,
        config: LifecycleConfig,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn WorkflowTransport>,
    ) -> Self {
        Self { store, config, clock, transport }
    }

    /// Build a production engine: config from `data_dir`, wall clock,
    /// HTTP transport. The store must already be migrated.
    pub fn build(store: SimStore, data_dir: &str) -> anyhow::Result<Self> {
        let config = LifecycleConfig::load(data_dir)?;
        let transport = HttpTransport::from_config(&config.workflow, &config.webhook);
        if config.webhook.secret.is_none() {
            log::warn!("no webhook secret configured: callbacks are accepted unsigned");
        }
        Ok(Self::new(
            store,
            config,
            Arc::new(SystemClock),
            Arc::new(transport),
        ))
    }

    /// Test engine on a fresh in-memory store.
    pub fn build_test(
        clock: Arc<dyn Clock>,
        transport: Arc<dyn WorkflowTransport>,
    ) -> SimResult<Self> {
        let store = SimStore::in_memory()?;
        store.migrate()?;
        Ok(Self::new(store, LifecycleConfig::default_test(), clock, transport))
    }

    // ── Components ─────────────────────────────────────────────

    pub fn quota(&self) -> QuotaGate<'_> {
        QuotaGate::new(&self.store, &self.config.quota, &*self.clock)
    }

    pub fn metrics(&self) -> MetricsAggregator<'_> {
        MetricsAggregator::new(&self.store, &*self.clock)
    }

    pub fn dispatcher(&self) -> WorkflowDispatcher<'_> {
        WorkflowDispatcher::new(
            &self.store,
            &self.config.workflow,
            &*self.clock,
            &*self.transport,
        )
    }

    pub fn reconciler(&self) -> WebhookReconciler<'_> {
        WebhookReconciler::new(
            &self.store,
            &self.config.webhook,
            &self.config.contact,
            &*self.clock,
        )
    }

    // ── Admission ──────────────────────────────────────────────

    /// Reject malformed briefs before anything is stored or counted.
    pub fn validate_brief(&self, input: &serde_json::Value) -> SimResult<()> {
        let object = input
            .as_object()
            .ok_or_else(|| SimError::ValidationFailed("brief must be a JSON object".into()))?;
        if object.is_empty() {
            return Err(SimError::ValidationFailed("brief is empty".into()));
        }
        let size = serde_json::to_vec(input)?.len();
        if size > self.config.validation.max_input_bytes {
            return Err(SimError::ValidationFailed(format!(
                "brief is {size} bytes, limit is {}",
                self.config.validation.max_input_bytes
            )));
        }
        let missing: Vec<&str> = self
            .config
            .validation
            .required_fields
            .iter()
            .filter(|field| match object.get(field.as_str()) {
                None | Some(serde_json::Value::Null) => true,
                Some(serde_json::Value::String(s)) => s.trim().is_empty(),
                Some(_) => false,
            })
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(SimError::ValidationFailed(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }

    /// Submit a new brief. On `DispatchFailed` the record exists and is failed.
    pub fn submit(&self, owner: &OwnerRef, input: serde_json::Value) -> SimResult<SimulationRecord> {
        self.admit(owner, input, None)
    }

    /// Run a finished simulation again as a new record with the same brief.
    pub fn regenerate(&self, owner: &OwnerRef, parent_id: &str) -> SimResult<SimulationRecord> {
        let parent = self
            .store
            .get_simulation(parent_id)?
            .filter(|p| &p.owner == owner)
            .ok_or_else(|| SimError::NotFound { id: parent_id.to_string() })?;
        if !parent.status.is_terminal() {
            return Err(SimError::ValidationFailed(format!(
                "simulation {parent_id} is still {}",
                parent.status
            )));
        }
        self.admit(owner, parent.input, Some(parent.id))
    }

    fn admit(
        &self,
        owner: &OwnerRef,
        input: serde_json::Value,
        parent_id: Option<SimulationId>,
    ) -> SimResult<SimulationRecord> {
        self.validate_brief(&input)?;
        let quota = self.quota();
        let reservation = quota.check_and_reserve(owner)?;

        let is_regeneration = parent_id.is_some();
        let mut record =
            SimulationRecord::new_pending(owner.clone(), input, parent_id, self.clock.now());
        let dispatcher = self.dispatcher();
        let created = self.store.in_transaction(|store| {
            store.insert_simulation(&record)?;
            MetricsAggregator::new(store, &*self.clock).record_requested(is_regeneration)?;
            self.log_event(&LifecycleEvent::SimulationRequested {
                simulation_id: record.id.clone(),
                owner: owner.key(),
                regeneration_of: record.parent_id.clone(),
            })?;
            dispatcher.begin(&mut record)
        });
        let request = match created {
            Ok(request) => request,
            Err(e) => {
                quota.release(&reservation)?;
                return Err(e);
            }
        };
        log::info!(
            "simulation {} created for {owner} ({}/{} today, tier {})",
            record.id,
            reservation.used,
            reservation.limit,
            reservation.tier
        );

        dispatcher.send(&mut record, &request)?;
        Ok(record)
    }

    // ── Callbacks ──────────────────────────────────────────────

    pub fn handle_callback(&self, body: &[u8], signature: Option<&str>) -> bool {
        self.reconciler().reconcile(body, signature)
    }

    // ── Queries ────────────────────────────────────────────────

    pub fn simulation(&self, simulation_id: &str) -> SimResult<SimulationRecord> {
        self.store
            .get_simulation(simulation_id)?
            .ok_or_else(|| SimError::NotFound { id: simulation_id.to_string() })
    }

    pub fn status(&self, simulation_id: &str) -> SimResult<StatusView> {
        Ok(self.simulation(simulation_id)?.status_view())
    }

    pub fn history(&self, owner: &OwnerRef) -> SimResult<Vec<SimulationRecord>> {
        self.store.simulations_for_owner(owner)
    }

    pub fn quota_status(&self, owner: &OwnerRef) -> SimResult<QuotaStatus> {
        self.quota().status(owner)
    }

    pub fn set_tier(&self, owner: &OwnerRef, tier: &str) -> SimResult<()> {
        self.store.ensure_owner(owner, tier, self.clock.now())?;
        self.store.set_owner_tier(&owner.key(), tier)?;
        Ok(())
    }

    pub fn metrics_for(&self, date: Option<NaiveDate>) -> SimResult<DailyMetric> {
        match date {
            Some(d) => self.metrics().for_date(d),
            None => self.metrics().today(),
        }
    }

    pub fn events_for(&self, simulation_id: &str) -> SimResult<Vec<LifecycleEvent>> {
        self.store
            .events_for_simulation(simulation_id)?
            .iter()
            .map(|entry| entry.decode().map_err(SimError::from))
            .collect()
    }

    pub fn export(
        &self,
        simulation_id: &str,
        format: ExportFormat,
        renderer: &dyn ExportRenderer,
    ) -> SimResult<Vec<u8>> {
        let record = self.simulation(simulation_id)?;
        export::export(&record, format, renderer)
    }

    // ── Maintenance ────────────────────────────────────────────

    /// Fail records stuck in processing past the configured timeout.
    /// Late callbacks for them are then rejected as stale.
    pub fn expire_stale_processing(&self) -> SimResult<Vec<SimulationId>> {
        let now = self.clock.now();
        let timeout = self.config.processing_timeout_secs;
        let cutoff = now - Duration::seconds(timeout);
        let mut expired = Vec::new();

        for candidate in self.store.stale_processing(cutoff)? {
            let diagnostic = SimulationError {
                kind: ERROR_PROCESSING_TIMEOUT.into(),
                message: format!("no completion callback within {timeout}s"),
                details: None,
                occurred_at: now,
            };
            let result = self.store.in_transaction(|store| {
                store.modify_simulation(&candidate.id, |r| {
                    if r.status.is_terminal() {
                        return Err(SimError::StaleCallback {
                            simulation_id: r.id.clone(),
                            status: r.status.to_string(),
                        });
                    }
                    r.fail(diagnostic.clone(), now)
                })?;
                MetricsAggregator::new(store, &*self.clock).record_failed()?;
                self.log_event(&LifecycleEvent::SimulationFailed {
                    simulation_id: candidate.id.clone(),
                    kind: ERROR_PROCESSING_TIMEOUT.into(),
                })
            });
            match result {
                Ok(()) => {
                    log::warn!("simulation {} timed out in processing", candidate.id);
                    expired.push(candidate.id);
                }
                // Finished by a callback between the scan and the write.
                Err(SimError::StaleCallback { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(expired)
    }

    fn log_event(&self, event: &LifecycleEvent) -> SimResult<()> {
        self.store
            .append_event(&EventLogEntry::from_event(event, self.clock.now())?)
    }
}
