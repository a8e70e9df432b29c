//! WebSocket push channel for job control and progress events

mod protocol;

pub use protocol::{ClientMessage, ServerMessage};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::error::ServerError;
use crate::jobs::{JobRequest, JobUpdate, Orchestrator, ResumeOutcome};

/// Frames queued for one connection
#[derive(Debug)]
enum Outgoing {
    Frame(String),
    /// A forwarded job stream ended
    Detached(String),
}

pub fn router(orchestrator: Orchestrator) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .layer(TraceLayer::new_for_http())
        .with_state(orchestrator)
}

/// Serve `/ws` on `bind` and sweep expired jobs in the background
pub async fn serve(orchestrator: Orchestrator, bind: &str) -> Result<(), ServerError> {
    let addr: SocketAddr = bind.parse().map_err(|source| ServerError::BindAddress {
        addr: bind.to_string(),
        source,
    })?;

    let sweeper = orchestrator.spawn_cleanup_loop();
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on ws://{}/ws", listener.local_addr()?);

    let result = axum::serve(listener, router(orchestrator)).await;
    sweeper.abort();
    result?;
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(orchestrator): State<Orchestrator>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection(socket, orchestrator))
}

async fn connection(socket: WebSocket, orchestrator: Orchestrator) {
    debug!("WebSocket connection opened");
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outgoing>(256);
    let mut watching: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            outgoing = rx.recv() => match outgoing {
                Some(Outgoing::Frame(text)) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(Outgoing::Detached(job_id)) => {
                    watching.remove(&job_id);
                }
                None => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    handle_text(&orchestrator, &text, &tx, &mut watching).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("WebSocket receive error: {}", e);
                    break;
                }
            },
        }
    }
    // Jobs keep running; only this connection's forwarders stop
    debug!("WebSocket connection closed");
}

async fn handle_text(
    orchestrator: &Orchestrator,
    text: &str,
    tx: &mpsc::Sender<Outgoing>,
    watching: &mut HashSet<String>,
) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            send(tx, &ServerMessage::error(format!("Invalid message: {}", e), None)).await;
            return;
        }
    };

    match message {
        ClientMessage::StartJob {
            text,
            custom_instructions,
            audience_parameters,
            rigor_level,
        } => {
            let request = JobRequest {
                text,
                instructions: custom_instructions,
                audience: audience_parameters,
                rigor: rigor_level,
            };
            match orchestrator.start_job(request).await {
                Ok(started) => forward(&started.job_id, started.events, tx, watching),
                Err(e) => send(tx, &ServerMessage::error(e.to_string(), None)).await,
            }
        }
        ClientMessage::AbortJob { job_id } => match orchestrator.abort_job(&job_id).await {
            Ok(true) => {}
            Ok(false) => {
                let message = format!("Job '{}' is not running", job_id);
                send(tx, &ServerMessage::error(message, Some(&job_id))).await;
            }
            Err(e) => send(tx, &ServerMessage::error(e.to_string(), Some(&job_id))).await,
        },
        ClientMessage::ResumeJob { job_id } => match orchestrator.resume_job(&job_id).await {
            Ok(ResumeOutcome::Cached(job)) => {
                send(tx, &protocol::cached_completion(&job)).await;
            }
            Ok(ResumeOutcome::Resumed(started)) => {
                forward(&started.job_id, started.events, tx, watching)
            }
            Err(e) => send(tx, &ServerMessage::error(e.to_string(), Some(&job_id))).await,
        },
        ClientMessage::GetStatus { job_id } => match orchestrator.get_status(&job_id).await {
            Ok(snapshot) => {
                let active = snapshot.active;
                send(tx, &ServerMessage::JobStatus(snapshot)).await;
                if active && !watching.contains(&job_id) {
                    if let Some(events) = orchestrator.watch(&job_id) {
                        forward(&job_id, events, tx, watching);
                    }
                }
            }
            Err(e) => send(tx, &ServerMessage::error(e.to_string(), Some(&job_id))).await,
        },
    }
}

async fn send<T: Serialize>(tx: &mpsc::Sender<Outgoing>, message: &T) {
    match serde_json::to_string(message) {
        Ok(json) => {
            let _ = tx.send(Outgoing::Frame(json)).await;
        }
        Err(e) => warn!("Failed to encode frame: {}", e),
    }
}

/// Relay a job's events to this connection until a terminal event or the channel closes
fn forward(
    job_id: &str,
    mut events: broadcast::Receiver<JobUpdate>,
    tx: &mpsc::Sender<Outgoing>,
    watching: &mut HashSet<String>,
) {
    watching.insert(job_id.to_string());
    let tx = tx.clone();
    let job_id = job_id.to_string();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(update) => {
                    let terminal = update.event.is_terminal();
                    let json = match serde_json::to_string(&update) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!("Failed to encode event for job {}: {}", job_id, e);
                            continue;
                        }
                    };
                    if tx.send(Outgoing::Frame(json)).await.is_err() {
                        return;
                    }
                    if terminal {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Connection fell {} events behind on job {}", skipped, job_id);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        let _ = tx.send(Outgoing::Detached(job_id)).await;
    });
}
