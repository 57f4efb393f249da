// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Ingress --------
pub static NOTIFICATIONS_RECEIVED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("notifications_received_total", "inbound trading alerts").unwrap()
});

pub static COMMANDS_RECEIVED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("remote_commands_received_total", "inbound remote commands").unwrap()
});

// -------- Admission / matching --------
pub static REJECTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "notifications_rejected_total",
            "rejected notifications by reason",
        ),
        &["reason"],
    )
    .unwrap()
});

// -------- Orders / positions --------
pub static ORDERS_PLACED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("orders_placed_total", "entry orders accepted by the exchange"),
        &["exchange"],
    )
    .unwrap()
});

pub static ORDERS_REJECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("orders_rejected_total", "entry orders that never went live"),
        &["reason"],
    )
    .unwrap()
});

pub static POSITIONS_OPEN: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("positions_open", "currently open positions").unwrap());

pub static STOP_UPDATES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("stop_updates_total", "protective stop adjustments per symbol"),
        &["symbol"],
    )
    .unwrap()
});

// -------- Reconciliation / streams --------
pub static RECONCILE_ACTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "reconcile_actions_total",
            "timeout-driven cancels and forced closes",
        ),
        &["action"],
    )
    .unwrap()
});

pub static WS_RECONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ws_reconnects_total", "websocket reconnect attempts"),
        &["stream"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(NOTIFICATIONS_RECEIVED.clone())),
        REGISTRY.register(Box::new(COMMANDS_RECEIVED.clone())),
        REGISTRY.register(Box::new(REJECTIONS.clone())),
        REGISTRY.register(Box::new(ORDERS_PLACED.clone())),
        REGISTRY.register(Box::new(ORDERS_REJECTED.clone())),
        REGISTRY.register(Box::new(POSITIONS_OPEN.clone())),
        REGISTRY.register(Box::new(STOP_UPDATES.clone())),
        REGISTRY.register(Box::new(RECONCILE_ACTIONS.clone())),
        REGISTRY.register(Box::new(WS_RECONNECTS.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics) — tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean)
pub async fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(listener) => listener,
            Err(e) => {
                eprintln!("metrics bind {} failed: {}", addr, e);
                return;
            }
        };
        eprintln!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => eprintln!("metrics accept error: {}", e),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_encodes_after_init() {
        init();
        NOTIFICATIONS_RECEIVED.inc();
        REJECTIONS.with_label_values(&["capacity"]).inc();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("notifications_received_total"));
        assert!(text.contains("notifications_rejected_total"));
    }
}
