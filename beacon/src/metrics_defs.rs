use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUESTS: MetricDef = MetricDef {
    name: "requests",
    metric_type: MetricType::Counter,
    description: "Inbound beacon requests. Tagged with status.",
};

pub const FORWARD_DURATION: MetricDef = MetricDef {
    name: "forward.duration",
    metric_type: MetricType::Histogram,
    description: "Time taken to deliver a view event, in seconds. Tagged with sink, status.",
};

pub const CREDENTIAL_REFRESH: MetricDef = MetricDef {
    name: "credential.refresh",
    metric_type: MetricType::Counter,
    description: "Access token refreshes against the token endpoint. Tagged with status.",
};

pub const ALL_METRICS: &[MetricDef] = &[REQUESTS, FORWARD_DURATION, CREDENTIAL_REFRESH];
