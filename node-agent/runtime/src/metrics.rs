use crate::Error;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct Metrics {
    operations: Family<OpLabels, Counter>,
    cached_workloads: Gauge,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct OpLabels {
    op: &'static str,
    result: &'static str,
}

#[derive(Copy, Clone, Debug)]
pub(crate) enum Op {
    Add,
    Remove,
    Delete,
    Snapshot,
}

// === impl Metrics ===

impl Metrics {
    pub fn register(reg: &mut Registry) -> Self {
        let operations = Family::<OpLabels, Counter>::default();
        reg.register(
            "lifecycle_operations",
            "Total number of mesh lifecycle operations by result",
            operations.clone(),
        );

        let cached_workloads = Gauge::default();
        reg.register(
            "cached_workloads",
            "Number of workloads tracked in the netns cache",
            cached_workloads.clone(),
        );

        Self {
            operations,
            cached_workloads,
        }
    }

    pub(crate) fn record(&self, op: Op, res: &Result<(), Error>, cached: usize) {
        let result = match res {
            Ok(()) => "ok",
            Err(e) if e.is_partial_add() => "partial",
            Err(_) => "error",
        };
        self.operations
            .get_or_create(&OpLabels {
                op: op.as_str(),
                result,
            })
            .inc();
        self.cached_workloads
            .set(i64::try_from(cached).unwrap_or(i64::MAX));
    }
}

// === impl Op ===

impl Op {
    fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
            Self::Delete => "delete",
            Self::Snapshot => "snapshot",
        }
    }
}
