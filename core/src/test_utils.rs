//! Shared test utilities

use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::port::{PortManager, PortProtocol};
use crate::socket::{ShimSettings, SocketRegistry, SocketShim};

static LOGGING: Once = Once::new();

/// Route tracing output through the test harness; `RUST_LOG` filters it
pub fn init_test_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Port manager that records every request
#[derive(Default)]
pub struct RecordingPortManager {
    pub added: Mutex<Vec<(PortProtocol, u16)>>,
    pub removed: Mutex<Vec<(PortProtocol, u16)>>,
}

impl PortManager for RecordingPortManager {
    fn add(&self, protocol: PortProtocol, port: u16) -> bool {
        self.added.lock().push((protocol, port));
        true
    }

    fn remove(&self, protocol: PortProtocol, port: u16) -> bool {
        self.removed.lock().push((protocol, port));
        true
    }
}

/// Shim settings that never probe the outside world
pub fn loopback_settings() -> ShimSettings {
    ShimSettings {
        route_probe: "127.0.0.1:9".parse().unwrap(),
        max_wait_us: 200_000,
        ..ShimSettings::default()
    }
}

pub fn test_shim() -> (Arc<SocketShim>, Arc<RecordingPortManager>) {
    let ports = Arc::new(RecordingPortManager::default());
    let shim = Arc::new(SocketShim::new(
        Arc::new(SocketRegistry::new()),
        ports.clone(),
        loopback_settings(),
    ));
    (shim, ports)
}

/// Poll `predicate` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    predicate()
}
