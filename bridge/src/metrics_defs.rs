//! Metric definitions emitted by the bridge.

#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub description: &'static str,
}

pub const PASS_RUNS: MetricDef = MetricDef {
    name: "excbridge.pass.runs",
    description: "Completed orchestration passes",
};

pub const TICKETS_CREATED: MetricDef = MetricDef {
    name: "excbridge.tickets.created",
    description: "Tickets filed for new exceptions",
};

pub const TICKETS_SKIPPED: MetricDef = MetricDef {
    name: "excbridge.tickets.skipped",
    description: "Exceptions skipped because a marker already existed",
};

pub const TICKET_FAILURES: MetricDef = MetricDef {
    name: "excbridge.tickets.failures",
    description: "Ticket creations rejected by the tracker",
};

pub const TELEMETRY_FAILURES: MetricDef = MetricDef {
    name: "excbridge.telemetry.failures",
    description: "Telemetry queries that degraded to an empty result",
};

pub const STORE_FAILURES: MetricDef = MetricDef {
    name: "excbridge.store.failures",
    description: "Dedup store reads that failed open",
};

pub const MARK_FAILURES: MetricDef = MetricDef {
    name: "excbridge.store.mark_failures",
    description: "Markers dropped after exhausting upsert retries",
};
