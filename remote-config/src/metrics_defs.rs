//! Metrics definitions for the remote configuration client.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Histogram,
}

#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub description: &'static str,
}

pub const POLL_COUNT: MetricDef = MetricDef {
    name: "remote_config.poll.count",
    metric_type: MetricType::Counter,
    description: "Number of poll requests sent to the agent",
};

pub const POLL_ERRORS: MetricDef = MetricDef {
    name: "remote_config.poll.errors",
    metric_type: MetricType::Counter,
    description: "Number of polls that failed at the transport level or returned a non-2xx status",
};

pub const POLL_DURATION: MetricDef = MetricDef {
    name: "remote_config.poll.duration",
    metric_type: MetricType::Histogram,
    description: "Time to complete a poll request in seconds",
};

pub const PARSE_ERRORS: MetricDef = MetricDef {
    name: "remote_config.parse.errors",
    metric_type: MetricType::Counter,
    description: "Number of poll responses that could not be parsed",
};

pub const DISPATCH_COUNT: MetricDef = MetricDef {
    name: "remote_config.dispatch.count",
    metric_type: MetricType::Counter,
    description: "Number of configurations passed to product handlers, tagged by action",
};

pub const ALL_METRICS: &[MetricDef] = &[
    POLL_COUNT,
    POLL_ERRORS,
    POLL_DURATION,
    PARSE_ERRORS,
    DISPATCH_COUNT,
];
