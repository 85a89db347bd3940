use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::Arc;

use prometheus::{Encoder, IntCounter, Opts, Registry, TextEncoder};

/// Monotonic counters for the things the tool has done. Counters are
/// registered with a private registry and exposed in the Prometheus text
/// format when the listener is enabled.
pub struct Metrics {
    registry: Registry,

    pub briefcase_reset: IntCounter,
    pub vault_token_written: IntCounter,
    pub vault_token_refreshed: IntCounter,
    pub secret_updates: IntCounter,
    pub sidecar_sync_errors: IntCounter,
    pub vault_token_errors: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let briefcase_reset = counter(
            &registry,
            "vaultsync_briefcase_reset_total",
            "Times the briefcase was reset because the vault token changed",
        );
        let vault_token_written = counter(
            &registry,
            "vaultsync_vault_token_written_total",
            "Times the vault token was written to its output file",
        );
        let vault_token_refreshed = counter(
            &registry,
            "vaultsync_vault_token_refreshed_total",
            "Times the vault token was renewed against the server",
        );
        let secret_updates = counter(
            &registry,
            "vaultsync_secret_updates_total",
            "Secret artifacts written to disk",
        );
        let sidecar_sync_errors = counter(
            &registry,
            "vaultsync_sidecar_sync_errors_total",
            "Sidecar passes that failed",
        );
        let vault_token_errors = counter(
            &registry,
            "vaultsync_vault_token_errors_total",
            "Failures to obtain a usable vault token",
        );

        Self {
            registry,
            briefcase_reset,
            vault_token_written,
            vault_token_refreshed,
            secret_updates,
            sidecar_sync_errors,
            vault_token_errors,
        }
    }

    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(err) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::warn!(error = %err, "could not encode metrics");
            return String::new();
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Serve `GET /metrics` on the given port from a background thread. The
    /// listener lives for the rest of the process.
    pub fn serve(self: Arc<Self>, port: u16) -> std::io::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        tracing::info!(port, "serving metrics");

        let metrics = self;
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let mut stream = match stream {
                    Ok(s) => s,
                    Err(err) => {
                        tracing::warn!(error = %err, "metrics accept failed");
                        continue;
                    }
                };
                // Drain whatever request came in; the answer is always the
                // current counter state.
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);

                let body = metrics.render();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });

        Ok(())
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::with_opts(Opts::new(name, help)).unwrap();
    registry.register(Box::new(counter.clone())).unwrap();
    counter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_are_monotonic() {
        let metrics = Metrics::new();
        assert_eq!(metrics.briefcase_reset.get(), 0);

        metrics.briefcase_reset.inc();
        metrics.secret_updates.inc_by(3);
        assert_eq!(metrics.briefcase_reset.get(), 1);
        assert_eq!(metrics.secret_updates.get(), 3);
    }

    #[test]
    fn render_includes_counter_names() {
        let metrics = Metrics::new();
        metrics.vault_token_refreshed.inc();
        let text = metrics.render();
        assert!(text.contains("vaultsync_vault_token_refreshed_total 1"));
        assert!(text.contains("vaultsync_briefcase_reset_total 0"));
    }
}
