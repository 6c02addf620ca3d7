//! Quota Gate: per-owner daily admission control.
//!
//! The limit comes from the owner's subscription tier (config table with
//! a default for unknown tiers). Day rollover and the reservation are a
//! single conditional UPDATE in the store, never a read-then-write here.

use crate::{
    clock::Clock,
    config::QuotaConfig,
    error::{SimError, SimResult},
    event::{EventLogEntry, LifecycleEvent},
    store::SimStore,
    types::OwnerRef,
};
use chrono::NaiveDate;

/// Proof that one unit of today's quota was taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaReservation {
    pub owner: OwnerRef,
    pub date: NaiveDate,
    pub tier: String,
    pub limit: u32,
    pub used: u32,
}

/// Read-only view of an owner's quota.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct QuotaStatus {
    pub tier: String,
    pub limit: u32,
    pub used: u32,
    pub remaining: u32,
}

pub struct QuotaGate<'a> {
    store: &'a SimStore,
    config: &'a QuotaConfig,
    clock: &'a dyn Clock,
}

impl<'a> QuotaGate<'a> {
    pub fn new(store: &'a SimStore, config: &'a QuotaConfig, clock: &'a dyn Clock) -> Self {
        Self { store, config, clock }
    }

    fn default_tier(&self, owner: &OwnerRef) -> &str {
        match owner {
            OwnerRef::User(_) => &self.config.default_user_tier,
            OwnerRef::Guest(_) => &self.config.guest_tier,
        }
    }

    /// Make sure the owner row exists and return its tier.
    fn resolve_tier(&self, owner: &OwnerRef) -> SimResult<String> {
        self.store
            .ensure_owner(owner, self.default_tier(owner), self.clock.now())?;
        let row = self.store.owner_quota(&owner.key())?.ok_or_else(|| SimError::NotFound {
            id: owner.key(),
        })?;
        Ok(row.tier)
    }

    /// Atomically take one unit of today's quota or fail with
    /// `QuotaExceeded`.
    pub fn check_and_reserve(&self, owner: &OwnerRef) -> SimResult<QuotaReservation> {
        let tier = self.resolve_tier(owner)?;
        let limit = self.config.limit_for(&tier);
        let today = self.clock.today();

        match self.store.try_reserve_quota(&owner.key(), today, limit)? {
            Some(used) => {
                log::debug!("quota reserved for {owner}: {used}/{limit} ({tier})");
                Ok(QuotaReservation {
                    owner: owner.clone(),
                    date: today,
                    tier,
                    limit,
                    used,
                })
            }
            None => {
                let used = self
                    .store
                    .owner_quota(&owner.key())?
                    .map(|row| row.count_on(today))
                    .unwrap_or(0);
                log::info!("quota exceeded for {owner}: {used}/{limit} ({tier})");
                let event = LifecycleEvent::QuotaRejected {
                    owner: owner.key(),
                    tier: tier.clone(),
                    limit,
                    used,
                };
                self.store
                    .append_event(&EventLogEntry::from_event(&event, self.clock.now())?)?;
                Err(SimError::QuotaExceeded { limit, used, tier })
            }
        }
    }

    /// Refund a reservation whose request never produced a record.
    pub fn release(&self, reservation: &QuotaReservation) -> SimResult<()> {
        if !self.store.release_quota(&reservation.owner.key(), reservation.date)? {
            log::debug!(
                "quota release for {} skipped (day rolled over)",
                reservation.owner
            );
        }
        Ok(())
    }

    pub fn status(&self, owner: &OwnerRef) -> SimResult<QuotaStatus> {
        let tier = self.resolve_tier(owner)?;
        let limit = self.config.limit_for(&tier);
        let used = self
            .store
            .owner_quota(&owner.key())?
            .map(|row| row.count_on(self.clock.today()))
            .unwrap_or(0);
        Ok(QuotaStatus {
            tier,
            limit,
            used,
            remaining: limit.saturating_sub(used),
        })
    }
}
