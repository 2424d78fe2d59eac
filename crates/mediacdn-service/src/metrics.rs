//! Statsd reporting for both tiers.
//!
//! Reporting is off until [`configure_statsd`] is called. Until then, and in tests, the
//! [`metric!`](crate::metric) macro does nothing.

use std::collections::BTreeMap;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::OnceLock;

use anyhow::{Context, Result, bail};
use cadence::{Metric, MetricBuilder, StatsdClient, UdpMetricSink};

static REPORTER: OnceLock<Reporter> = OnceLock::new();

#[doc(hidden)]
pub mod prelude {
    pub use cadence::prelude::*;
}

/// A statsd client that attaches the configured `custom_tags` to every metric.
#[derive(Debug)]
pub struct Reporter {
    client: StatsdClient,
    global_tags: BTreeMap<String, String>,
}

impl Reporter {
    pub fn client(&self) -> &StatsdClient {
        &self.client
    }

    /// Adds the global tags and sends the metric, dropping it on error.
    pub fn emit<'a, T>(&'a self, builder: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        self.global_tags
            .iter()
            .fold(builder, |builder, (key, value)| builder.with_tag(key, value))
            .send()
    }
}

/// Starts reporting metrics to the statsd server at `host`, with every metric name prefixed by
/// `prefix`.
///
/// Reporting can be configured once per process, later calls only log a warning.
pub fn configure_statsd(
    prefix: &str,
    host: impl ToSocketAddrs,
    global_tags: BTreeMap<String, String>,
) -> Result<()> {
    let addrs: Vec<_> = host
        .to_socket_addrs()
        .context("failed to resolve statsd host")?
        .collect();
    let Some(first) = addrs.first() else {
        bail!("statsd host did not resolve to any address");
    };
    tracing::info!("Reporting metrics to statsd at {first}");

    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(&addrs[..], socket)?;

    let reporter = Reporter {
        client: StatsdClient::from_sink(prefix, sink),
        global_tags,
    };
    if REPORTER.set(reporter).is_err() {
        tracing::warn!("statsd reporting is already configured");
    }
    Ok(())
}

/// Runs `f` with the configured reporter, if there is one.
#[inline(always)]
pub fn with_reporter<F>(f: F)
where
    F: FnOnce(&Reporter),
{
    if let Some(reporter) = REPORTER.get() {
        f(reporter)
    }
}

/// Emits a metric with optional `"tag" => value` pairs.
///
/// ```ignore
/// metric!(counter("edge.resolve") += 1, "path" => "hit");
/// metric!(timer("requests.duration") = start.elapsed());
/// metric!(histogram("edge.origin.fetch.size") = len);
/// metric!(gauge("edge.cache.size") = total);
/// ```
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@emit count_with_tags($id, $value) $(, $k => $v)*)
    };
    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@emit gauge_with_tags($id, $value) $(, $k => $v)*)
    };
    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@emit time_with_tags($id, $value) $(, $k => $v)*)
    };
    (histogram($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@emit histogram_with_tags($id, $value) $(, $k => $v)*)
    };

    (@emit $method:ident($id:expr, $value:expr) $(, $k:expr => $v:expr)*) => {{
        #[allow(unused_imports)]
        use $crate::metrics::prelude::*;
        $crate::metrics::with_reporter(|reporter| {
            reporter.emit(reporter.client().$method($id, $value) $(.with_tag($k, $v))*);
        })
    }};
}
