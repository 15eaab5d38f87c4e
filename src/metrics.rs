//! OpenTelemetry instrumentation for pool state, following the database
//! client semantic conventions (`db.client.connections.*`). All instruments
//! are tagged with `pool.name`.

use std::{sync::LazyLock, time::Duration};

use opentelemetry::{
    global,
    metrics::{Histogram, Meter, UpDownCounter},
    InstrumentationScope,
    KeyValue,
};

static METER: LazyLock<Meter> = LazyLock::new(|| {
    global::meter_with_scope(
        InstrumentationScope::builder("mysql-pool")
            .with_version(env!("CARGO_PKG_VERSION"))
            .build(),
    )
});

/// The instruments for one pool.
///
/// Counter updates are performed immediately after the corresponding list
/// lock is released, and the two halves of a state transition (e.g. idle −1,
/// used +1) are always published adjacently so aggregators see consistent
/// totals at steady state.
pub(crate) struct PoolMetrics {
    attrs: Vec<KeyValue>,
    attrs_idle: Vec<KeyValue>,
    attrs_used: Vec<KeyValue>,

    usage: UpDownCounter<i64>,
    idle_min: UpDownCounter<i64>,
    idle_max: UpDownCounter<i64>,
    max: UpDownCounter<i64>,
    pending_requests: UpDownCounter<i64>,
    create_time: Histogram<f64>,
    wait_time: Histogram<f64>,
}

impl PoolMetrics {
    pub(crate) fn new(pool_name: &str) -> Self {
        let attrs = vec![KeyValue::new("pool.name", pool_name.to_string())];
        let mut attrs_idle = attrs.clone();
        attrs_idle.push(KeyValue::new("state", "idle"));
        let mut attrs_used = attrs.clone();
        attrs_used.push(KeyValue::new("state", "used"));

        Self {
            attrs,
            attrs_idle,
            attrs_used,
            usage: METER
                .i64_up_down_counter("db.client.connections.usage")
                .with_description(
                    "The number of sessions that are currently in the state described by the \
                     state attribute",
                )
                .build(),
            idle_min: METER
                .i64_up_down_counter("db.client.connections.idle.min")
                .with_description("The minimum number of idle open sessions allowed")
                .build(),
            idle_max: METER
                .i64_up_down_counter("db.client.connections.idle.max")
                .with_description("The maximum number of idle open sessions allowed")
                .build(),
            max: METER
                .i64_up_down_counter("db.client.connections.max")
                .with_description("The maximum number of open sessions allowed")
                .build(),
            pending_requests: METER
                .i64_up_down_counter("db.client.connections.pending_requests")
                .with_description(
                    "The number of pending requests for an open session, cumulative for the \
                     entire pool",
                )
                .build(),
            create_time: METER
                .f64_histogram("db.client.connections.create_time")
                .with_description("The time it took to create a new session")
                .with_unit("ms")
                .build(),
            wait_time: METER
                .f64_histogram("db.client.connections.wait_time")
                .with_description("The time it took to obtain an open session from the pool")
                .with_unit("ms")
                .build(),
        }
    }

    /// Publishes the configured limits when the pool is created.
    pub(crate) fn publish_configured_limits(&self, min: u32, max: u32) {
        self.idle_min.add(i64::from(min), &self.attrs);
        self.idle_max.add(i64::from(max), &self.attrs);
        self.max.add(i64::from(max), &self.attrs);
    }

    /// Retracts the configured limits when the pool is disposed.
    pub(crate) fn retract_configured_limits(&self, min: u32, max: u32) {
        self.idle_min.add(-i64::from(min), &self.attrs);
        self.idle_max.add(-i64::from(max), &self.attrs);
        self.max.add(-i64::from(max), &self.attrs);
    }

    pub(crate) fn add_idle(&self, delta: i64) {
        self.usage.add(delta, &self.attrs_idle);
    }

    pub(crate) fn add_used(&self, delta: i64) {
        self.usage.add(delta, &self.attrs_used);
    }

    pub(crate) fn add_pending_requests(&self, delta: i64) {
        self.pending_requests.add(delta, &self.attrs);
    }

    pub(crate) fn record_create_time(&self, elapsed: Duration) {
        self.create_time
            .record(elapsed.as_secs_f64() * 1_000.0, &self.attrs);
    }

    pub(crate) fn record_wait_time(&self, elapsed: Duration) {
        self.wait_time
            .record(elapsed.as_secs_f64() * 1_000.0, &self.attrs);
    }
}
