// ===============================
// src/server.rs
// ===============================
//
// Webhook ingress. Fire-and-forget contract: the source system never sees
// processing errors, so every request is answered immediately and the payload
// is handled on a spawned task. Malformed bodies are logged and dropped.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::domain::{Event, Notification, RawNotification, RemoteCommand};
use crate::metrics::{COMMANDS_RECEIVED, NOTIFICATIONS_RECEIVED};
use crate::signal_manager::SignalManager;

pub async fn serve(
    manager: Arc<SignalManager>,
    recorder: Option<mpsc::Sender<Event>>,
    port: u16,
) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make = make_service_fn(move |_conn| {
        let manager = manager.clone();
        let recorder = recorder.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                handle(req, manager.clone(), recorder.clone())
            }))
        }
    });

    info!(%addr, "webhook ingress listening");
    if let Err(e) = Server::bind(&addr).serve(make).await {
        error!(?e, "ingress server failed");
    }
}

async fn handle(
    request: Request<Body>,
    manager: Arc<SignalManager>,
    recorder: Option<mpsc::Sender<Event>>,
) -> Result<Response<Body>, Infallible> {
    let method = request.method().clone();
    let path = request.uri().path().to_ascii_lowercase();

    if method == Method::POST && path == "/api/notification/listen" {
        let body = read_body(request).await;
        tokio::spawn(async move {
            handle_notification(manager, recorder, body).await;
        });
        return Ok(ok());
    }
    if method == Method::POST && path == "/api/remotecommand/execute" {
        let body = read_body(request).await;
        tokio::spawn(async move {
            handle_command(manager, recorder, body).await;
        });
        return Ok(ok());
    }

    Ok(Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::empty())
        .unwrap_or_default())
}

fn ok() -> Response<Body> {
    Response::new(Body::empty())
}

async fn read_body(request: Request<Body>) -> Vec<u8> {
    match hyper::body::to_bytes(request.into_body()).await {
        Ok(bytes) => bytes.to_vec(),
        Err(e) => {
            error!(?e, "failed to read request body");
            Vec::new()
        }
    }
}

async fn handle_notification(
    manager: Arc<SignalManager>,
    recorder: Option<mpsc::Sender<Event>>,
    body: Vec<u8>,
) {
    let raw: RawNotification = match serde_json::from_slice(&body) {
        Ok(raw) => raw,
        Err(e) => {
            // unknown shape: dropped after logging, the ingress never fails
            error!(?e, "unparseable notification payload, dropped");
            return;
        }
    };
    NOTIFICATIONS_RECEIVED.inc();
    let notification = Notification::from_raw(raw);
    debug!(symbol = %notification.symbol_name, "notification received");
    if let Some(recorder) = recorder {
        let _ = recorder
            .try_send(Event::Notification(notification.clone()));
    }
    manager.execute(notification).await;
}

async fn handle_command(
    manager: Arc<SignalManager>,
    recorder: Option<mpsc::Sender<Event>>,
    body: Vec<u8>,
) {
    let command: RemoteCommand = match serde_json::from_slice(&body) {
        Ok(command) => command,
        Err(e) => {
            error!(?e, "unparseable remote command, dropped");
            return;
        }
    };
    COMMANDS_RECEIVED.inc();
    debug!(?command, "remote command received");
    if let Some(recorder) = recorder {
        let _ = recorder.try_send(Event::Command(command.clone()));
    }
    manager.execute_remote_command(command).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RemoteCommandTarget, RemoteCommandType};

    #[test]
    fn notification_payload_parses() {
        let body = br#"{
            "Type": 1, "SignalTypeId": 2, "MarketName": "BTCUSDT", "Signal": 1,
            "SignalPrice": 50000, "StopLoss": 49000,
            "Target1": 50500, "Target2": 51000, "Target3": 51500,
            "Target4": 52000, "Target5": 52500
        }"#;
        let raw: RawNotification = serde_json::from_slice(body).unwrap();
        let notification = Notification::from_raw(raw);
        assert_eq!(notification.symbol_name, "BTCUSDT");
        assert_eq!(notification.targets[4], 52500.0);
    }

    #[test]
    fn command_payload_parses() {
        let body = br#"{"Type": "ChangeStrategyRisk", "Target": "Short", "RiskFactor": 1.5}"#;
        let command: RemoteCommand = serde_json::from_slice(body).unwrap();
        assert_eq!(command.r#type, RemoteCommandType::ChangeStrategyRisk);
        assert_eq!(command.target, RemoteCommandTarget::Short);
        assert_eq!(command.risk_factor, Some(1.5));
        assert_eq!(command.is_signal_active, None);
    }

    #[test]
    fn garbage_payload_is_rejected_by_parser() {
        assert!(serde_json::from_slice::<RemoteCommand>(b"not json").is_err());
        // notifications have fully optional fields, so an empty object parses
        assert!(serde_json::from_slice::<RawNotification>(b"{}").is_ok());
    }
}
