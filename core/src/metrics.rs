//! Metrics Aggregator: daily lifecycle counters.
//!
//! One row per UTC calendar date, created by the first event of the day.
//! All increments happen inside the database, so concurrent writers for
//! the same date never lose an update.

use crate::{clock::Clock, error::SimResult, store::SimStore};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DailyMetric {
    pub date: NaiveDate,
    pub requested: i64,
    pub completed: i64,
    pub failed: i64,
    pub regenerated: i64,
    pub total_processing_seconds: i64,
    pub average_processing_seconds: i64,
}

impl DailyMetric {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            requested: 0,
            completed: 0,
            failed: 0,
            regenerated: 0,
            total_processing_seconds: 0,
            average_processing_seconds: 0,
        }
    }
}

pub struct MetricsAggregator<'a> {
    store: &'a SimStore,
    clock: &'a dyn Clock,
}

impl<'a> MetricsAggregator<'a> {
    pub fn new(store: &'a SimStore, clock: &'a dyn Clock) -> Self {
        Self { store, clock }
    }

    pub fn record_requested(&self, is_regeneration: bool) -> SimResult<()> {
        self.store.metric_record_requested(self.clock.today(), is_regeneration)
    }

    pub fn record_completed(&self, duration_seconds: Option<i64>) -> SimResult<()> {
        self.store.metric_record_completed(self.clock.today(), duration_seconds)
    }

    pub fn record_failed(&self) -> SimResult<()> {
        self.store.metric_record_failed(self.clock.today())
    }

    pub fn today(&self) -> SimResult<DailyMetric> {
        self.for_date(self.clock.today())
    }

    /// Days without events read as all-zero rows.
    pub fn for_date(&self, date: NaiveDate) -> SimResult<DailyMetric> {
        Ok(self
            .store
            .daily_metric(date)?
            .unwrap_or_else(|| DailyMetric::empty(date)))
    }
}
