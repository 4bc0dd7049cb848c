use std::collections::BTreeMap;
use std::env;
use std::future::Future;
use std::io::Write;
use std::net::{SocketAddr, UdpSocket};
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context, Result};
use fetchcache::logging::init_json_logging;
use fetchcache::metrics;
use sentry::{ClientOptions, Envelope, Transport};

#[derive(Debug, Default)]
pub struct Config {
    pub backtraces: bool,
    pub sentry: bool,
    pub tracing: bool,
    pub metrics: bool,
}

#[derive(Default)]
pub struct Guard {
    sentry: Option<sentry::ClientInitGuard>,
    pub udp_sink: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
}

/// Sets up sentry, logging and metrics so that all their machinery runs, without reporting
/// anything anywhere.
///
/// # Safety
/// With `backtraces` enabled, this modifies the environment, which is only safe to do before any
/// other threads are spawned.
pub unsafe fn init(config: Config) -> Result<Guard> {
    if config.backtraces {
        // SAFETY: Forwarded to the caller.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let mut guard = Guard::default();

    if config.sentry {
        let transport = |_: &ClientOptions| Arc::new(NoopTransport) as Arc<dyn Transport>;

        guard.sentry = Some(sentry::init((
            "https://some_token@sentry.invalid/1234",
            ClientOptions {
                release: sentry::release_name!(),
                traces_sample_rate: 1.0,
                transport: Some(Arc::new(transport)),
                ..Default::default()
            },
        )));
    }

    if config.tracing {
        // we want all the tracing machinery to be active, but not spam the console,
        // so redirect everything into the void:
        init_json_logging("INFO", || NoopWriter);
    }

    if config.metrics {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = UdpSocket::bind(addr).context("failed to bind metrics sink")?;
        listener.set_nonblocking(true)?;
        let socket = listener.local_addr()?;

        guard.udp_sink = Some(Box::pin(async move {
            let Ok(listener) = tokio::net::UdpSocket::from_std(listener) else {
                return;
            };
            let mut buf = Vec::with_capacity(1024);
            loop {
                buf.clear();
                if listener.recv_buf(&mut buf).await.is_err() {
                    break;
                }
            }
        }));

        // have some default tags, just to be closer to the real world config
        let mut tags = BTreeMap::new();
        tags.insert("env".into(), "stresstest".into());
        if let Some(host) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
            tags.insert("host".into(), host);
        }

        metrics::configure_statsd("fetchcache", ("127.0.0.1", socket.port()), tags)?;
    }

    Ok(guard)
}

struct NoopTransport;
impl Transport for NoopTransport {
    fn send_envelope(&self, envelope: Envelope) {
        std::hint::black_box(envelope);
    }
}

struct NoopWriter;
impl Write for NoopWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        // try to prevent the compiler from optimizing away all the formatting code:
        let buf = std::hint::black_box(buf);

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
