use std::collections::BTreeMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, UdpSocket};

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::handler::HandlerWithoutStateExt;
use futures::future::BoxFuture;
use querycache::config::Config as AppConfig;
use querycache::{logging, metrics};

/// Which reporting pipelines run during the stresstest.
#[derive(Clone, Copy, Debug, Default)]
pub struct Config {
    pub backtraces: bool,
    pub sentry: bool,
    pub tracing: bool,
    pub metrics: bool,
}

/// Keeps the Sentry client alive and carries the sinks, which must be spawned on a runtime.
#[derive(Default)]
pub struct Guard {
    _sentry: Option<sentry::ClientInitGuard>,
    pub http_sink: Option<BoxFuture<'static, ()>>,
    pub udp_sink: Option<BoxFuture<'static, ()>>,
}

fn loopback() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
}

/// Accepts Sentry envelopes over HTTP, reads them in full and acknowledges them.
fn http_sink() -> io::Result<(u16, BoxFuture<'static, ()>)> {
    let listener = TcpListener::bind(loopback())?;
    listener.set_nonblocking(true)?;
    let port = listener.local_addr()?.port();

    let serve = async move {
        async fn ok(_envelope: Bytes) -> &'static str {
            "OK"
        }

        let listener = match tokio::net::TcpListener::from_std(listener) {
            Ok(listener) => listener,
            Err(error) => {
                tracing::error!(%error, "sentry sink failed to start");
                return;
            }
        };
        if let Err(error) = axum::serve(listener, ok.into_make_service()).await {
            tracing::error!(%error, "sentry sink stopped");
        }
    };
    Ok((port, Box::pin(serve)))
}

/// Receives statsd datagrams and drops them.
fn udp_sink() -> io::Result<(u16, BoxFuture<'static, ()>)> {
    let socket = UdpSocket::bind(loopback())?;
    socket.set_nonblocking(true)?;
    let port = socket.local_addr()?.port();

    let drain = async move {
        let Ok(socket) = tokio::net::UdpSocket::from_std(socket) else {
            return;
        };
        let mut datagram = Vec::with_capacity(1024);
        while socket.recv_buf(&mut datagram).await.is_ok() {
            datagram.clear();
        }
    };
    Ok((port, Box::pin(drain)))
}

/// Turns on the requested pipelines, each pointed at a sink on the loopback interface.
///
/// Without `tracing`, logs go to the console as configured in `app`.
///
/// # Safety
/// Setting `RUST_BACKTRACE` goes through [`std::env::set_var`], which requires that no other
/// thread is running.
pub unsafe fn init(config: Config, app: &AppConfig) -> Result<Guard> {
    if config.backtraces {
        // SAFETY: forwarded to the caller.
        unsafe { std::env::set_var("RUST_BACKTRACE", "1") };
    }

    let mut guard = Guard::default();

    if config.sentry {
        let (port, sink) = http_sink().context("failed to bind sentry sink")?;
        guard.http_sink = Some(sink);

        let options = sentry::ClientOptions {
            release: sentry::release_name!(),
            traces_sample_rate: 1.0,
            ..Default::default()
        };
        let dsn = format!("http://stress@127.0.0.1:{port}/1");
        guard._sentry = Some(sentry::init((dsn, options)));
    }

    if config.tracing {
        // every event is formatted in full, then discarded
        logging::init_json_logging("INFO", || Discard);
    } else {
        // SAFETY: forwarded to the caller.
        unsafe { logging::init_logging(app) };
    }

    if config.metrics {
        let (port, sink) = udp_sink().context("failed to bind metrics sink")?;
        guard.udp_sink = Some(sink);

        let tags = BTreeMap::from([
            ("env".to_owned(), "stresstest".to_owned()),
            ("host".to_owned(), "stresstest".to_owned()),
        ]);
        metrics::configure_statsd("querycache", ("127.0.0.1", port), tags)
            .context("failed to configure metrics")?;
    }

    Ok(guard)
}

struct Discard;

impl io::Write for Discard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // keep the formatted bytes observable so formatting is not optimized out
        Ok(std::hint::black_box(buf).len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
