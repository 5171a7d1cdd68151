//! Statsd reporting for cache and fetch activity.
//!
//! Nothing leaves the process until [`configure_statsd`] installs a recorder. Until then, and in
//! tests, [`metric!`](crate::metric) expands to a no-op.
use std::collections::BTreeMap;
use std::io;
use std::net::{ToSocketAddrs, UdpSocket};
use std::ops::Deref;
use std::sync::OnceLock;

use cadence::{Metric, MetricBuilder, StatsdClient, UdpMetricSink};

static RECORDER: OnceLock<Recorder> = OnceLock::new();

/// Traits the [`metric!`](crate::metric) expansion relies on.
pub mod prelude {
    pub use cadence::prelude::*;
}

/// A statsd client plus the tags attached to everything it reports.
#[derive(Debug)]
pub struct Recorder {
    client: StatsdClient,
    default_tags: BTreeMap<String, String>,
}

impl Recorder {
    /// Attaches the default tags and sends the metric.
    #[inline(always)]
    pub fn submit<'a, T>(&'a self, builder: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        self.default_tags
            .iter()
            .fold(builder, |builder, (name, value)| builder.with_tag(name, value))
            .send()
    }
}

impl Deref for Recorder {
    type Target = StatsdClient;

    fn deref(&self) -> &StatsdClient {
        &self.client
    }
}

/// Installs the global recorder, sending to the first address `host` resolves to.
///
/// Only the first call wins; later calls log a warning and leave the recorder untouched.
pub fn configure_statsd<A: ToSocketAddrs>(
    prefix: &str,
    host: A,
    default_tags: BTreeMap<String, String>,
) -> io::Result<()> {
    let targets: Vec<_> = host.to_socket_addrs()?.collect();
    let Some(target) = targets.first() else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "statsd host did not resolve to any address",
        ));
    };
    tracing::info!(%target, prefix, "sending metrics to statsd");

    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(*target, socket).map_err(io::Error::other)?;

    let recorder = Recorder {
        client: StatsdClient::from_sink(prefix, sink),
        default_tags,
    };
    if RECORDER.set(recorder).is_err() {
        tracing::warn!("statsd recorder already installed, ignoring new configuration");
    }
    Ok(())
}

/// Installs the recorder described by `config`. Does nothing without a statsd host.
pub fn init(config: &crate::config::Metrics) -> io::Result<()> {
    match &config.statsd {
        Some(host) => configure_statsd(&config.prefix, host.as_str(), config.custom_tags.clone()),
        None => Ok(()),
    }
}

/// Runs `f` against the installed recorder, or returns `R::default()` without one.
#[inline(always)]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&Recorder) -> R,
    R: Default,
{
    RECORDER.get().map(f).unwrap_or_default()
}

/// Emits a counter, gauge or timer, with optional `"tag" => value` pairs.
///
/// ```ignore
/// metric!(counter("query.fetch") += 1);
/// metric!(timer("query.fetch.duration") = elapsed, "outcome" => "success");
/// ```
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@emit count_with_tags, $id, $value $(, $k => $v)*)
    };
    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@emit gauge_with_tags, $id, $value $(, $k => $v)*)
    };
    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@emit time_with_tags, $id, $value $(, $k => $v)*)
    };
    (@emit $method:ident, $id:expr, $value:expr $(, $k:expr => $v:expr)*) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|recorder| {
            recorder.submit(recorder.$method($id, $value) $(.with_tag($k, $v))*);
        })
    }};
}
