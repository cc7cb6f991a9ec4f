use std::thread;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Router,
};
use log::{info, warn};

use crate::config::AppConfig;
use crate::dispatcher::Dispatcher;
use crate::events::{event_channel, Event, EventKind, EventSender};
use crate::provider::Provider;

use super::webhook::{classify_payload, verify_signature};

#[derive(Clone)]
struct AppState {
    events: EventSender,
    hmac: Option<String>,
}

async fn root() -> &'static str {
    "qram"
}

async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, String) {
    if let Some(secret) = &state.hmac {
        let header = headers
            .get("x-hub-signature-256")
            .and_then(|value| value.to_str().ok());
        if let Err(err) = verify_signature(secret, &body, header) {
            info!("request unverified: {err}");
            return (StatusCode::FORBIDDEN, err.to_string());
        }
        info!("request verified");
    }

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            warn!("failed to decode JSON from request body: {err}");
            return (
                StatusCode::BAD_REQUEST,
                format!("failed to decode JSON from request body: {err}"),
            );
        }
    };

    let Some(kind) = classify_payload(&payload) else {
        info!("nothing to process in request");
        return (StatusCode::OK, "OK".to_owned());
    };
    let event = Event::new(kind.clone()).caused_by(cause_for(&kind, &payload));
    info!("enqueued: {event:?}");
    if state.events.send(event).is_err() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "dispatcher is gone".to_owned(),
        );
    }
    (StatusCode::OK, "OK".to_owned())
}

fn cause_for(kind: &EventKind, payload: &serde_json::Value) -> String {
    match kind {
        EventKind::PrComment { comment_id, .. } => {
            format!("WEB/webhook PR comment {comment_id}")
        }
        EventKind::CheckCompleted { .. } => {
            format!("WEB/webhook WORKFLOW {}", payload["workflow_run"]["id"])
        }
        _ => "WEB/webhook PING".to_owned(),
    }
}

async fn stop(State(state): State<AppState>) -> (StatusCode, String) {
    info!("putting STOP event on the queue");
    let _ = state
        .events
        .send(Event::new(EventKind::Stop).caused_by("WEB/stop"));
    (StatusCode::OK, "Goodbye.".to_owned())
}

/// Runs the webhook server and the dispatcher until a `Stop` event drains
/// the queue. The dispatcher gets its own thread; the server shuts down
/// gracefully once that thread finishes.
pub fn serve<P>(
    config: &AppConfig,
    provider: P,
    provide_stop: bool,
    initialize_repos: bool,
) -> Result<()>
where
    P: Provider + Send + 'static,
{
    let hmac = config.github.as_ref().and_then(|github| github.hmac.clone());
    if hmac.is_some() {
        info!("HMAC secret provided, incoming requests will be verified");
    }

    let (sender, receiver) = event_channel();
    sender
        .send(Event::new(EventKind::Ping).caused_by("initialization"))
        .expect("the receiver is alive at startup");
    if initialize_repos {
        sender
            .send(Event::new(EventKind::Initialize).caused_by("initialization"))
            .expect("the receiver is alive at startup");
    }

    let dispatcher = Dispatcher::new(config.workdir.clone(), provider);
    let worker = thread::spawn(move || dispatcher.run(&receiver));

    let state = AppState {
        events: sender,
        hmac,
    };
    let mut router = Router::new()
        .route("/", get(root))
        .route("/webhook", post(webhook));
    if provide_stop {
        router = router.route("/stop", post(stop));
    }
    let app = router.with_state(state);

    let addr = format!("{}:{}", config.bind_to, config.port);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting the async runtime")?;
    runtime.block_on(async {
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        info!("serving on {addr}");
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                // The dispatcher exiting (Stop event, or every sender gone)
                // is the shutdown signal.
                let _ = tokio::task::spawn_blocking(move || worker.join()).await;
            })
            .await
            .context("serving")
    })?;
    info!("server stopped");
    Ok(())
}
