use std::{sync::Arc, time::Duration};

use super::{metrics, store::EngineInner};
use crate::{
    error::Result,
    scheduler::{BackgroundTask, Context},
};

/// Re-checks compaction needs; catches jobs that failed on an earlier round.
pub struct CompactionTask {
    inner: Arc<EngineInner>,
}

impl CompactionTask {
    pub(crate) fn new(inner: Arc<EngineInner>) -> Self {
        Self { inner }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for CompactionTask {
    fn name(&self) -> &'static str {
        "compaction"
    }

    fn interval(&self) -> Duration {
        self.inner.options.compaction_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        self.inner.maybe_schedule_compaction()
    }
}

pub struct FlushTask {
    inner: Arc<EngineInner>,
}

impl FlushTask {
    pub(crate) fn new(inner: Arc<EngineInner>) -> Self {
        Self { inner }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for FlushTask {
    fn name(&self) -> &'static str {
        "memtable-flush"
    }

    fn interval(&self) -> Duration {
        self.inner.options.flush_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        self.inner.maybe_schedule_flush()
    }
}

pub struct MetricsTask {
    inner: Arc<EngineInner>,
}

impl MetricsTask {
    pub(crate) fn new(inner: Arc<EngineInner>) -> Self {
        Self { inner }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for MetricsTask {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn interval(&self) -> Duration {
        self.inner.options.metrics_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        metrics::log_metrics(&self.inner.state)
    }
}
