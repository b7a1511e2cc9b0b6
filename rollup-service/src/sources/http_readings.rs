use std::{net::SocketAddr, sync::Arc};

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use energy_client::domain::Reading;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::IncomingReading;
use crate::pipeline::{Envelope, EnvelopeStream, PipelineError, Source};

#[derive(Clone)]
struct SharedSender {
    tx: mpsc::Sender<Envelope<Reading>>,
}

/// Accepts `POST /ingest/readings` with a JSON array of readings.
#[derive(Clone)]
pub struct HttpReadingsSource {
    receiver: Arc<tokio::sync::Mutex<Option<mpsc::Receiver<Envelope<Reading>>>>>,
}

pub fn router(tx: mpsc::Sender<Envelope<Reading>>) -> Router {
    Router::new()
        .route("/ingest/readings", post(ingest_readings))
        .with_state(SharedSender { tx })
}

impl HttpReadingsSource {
    pub async fn new(bind_addr: &str, channel_capacity: usize) -> Result<Self, PipelineError> {
        let (tx, rx) = mpsc::channel(channel_capacity);
        let app = router(tx);

        let addr: SocketAddr = bind_addr
            .parse()
            .map_err(|e| PipelineError::Source(format!("invalid bind addr: {e}")))?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| PipelineError::Source(format!("failed to bind {addr}: {e}")))?;
        tracing::info!(%addr, "HTTP readings source listening");

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                tracing::error!(error = %e, "HTTP readings source server error");
            }
        });

        Ok(Self::from_receiver(rx))
    }

    pub fn from_receiver(rx: mpsc::Receiver<Envelope<Reading>>) -> Self {
        Self {
            receiver: Arc::new(tokio::sync::Mutex::new(Some(rx))),
        }
    }
}

#[async_trait::async_trait]
impl Source<Reading> for HttpReadingsSource {
    async fn stream(&self) -> Result<EnvelopeStream<Reading>, PipelineError> {
        let rx = self
            .receiver
            .lock()
            .await
            .take()
            .ok_or_else(|| PipelineError::Source("readings stream already taken".to_string()))?;

        Ok(Box::pin(ReceiverStream::new(rx).map(Ok)))
    }
}

async fn ingest_readings(
    State(sender): State<SharedSender>,
    Json(payload): Json<Vec<IncomingReading>>,
) -> Result<StatusCode, StatusCode> {
    metrics::counter!("http_ingest_requests_total").increment(1);

    for incoming in payload {
        let reading: Reading = incoming.into();
        if sender.tx.send(Envelope::new(reading)).await.is_err() {
            metrics::counter!("http_ingest_failed_total").increment(1);
            return Err(StatusCode::SERVICE_UNAVAILABLE);
        }
    }

    Ok(StatusCode::ACCEPTED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    const BODY: &str = r#"[{
        "location": "VT",
        "ts": "2024-06-01T14:00:00Z",
        "site": {"instant_power": 1.0},
        "load": {"instant_power": 2.0},
        "battery": {"instant_power": 3.0},
        "solar": {"instant_power": 4.0}
    }]"#;

    fn post(body: &'static str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/ingest/readings")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn accepted_readings_are_streamed() {
        let (tx, rx) = mpsc::channel(8);
        let source = HttpReadingsSource::from_receiver(rx);

        let res = router(tx).oneshot(post(BODY)).await.unwrap();
        assert_eq!(res.status(), StatusCode::ACCEPTED);

        let mut stream = source.stream().await.unwrap();
        let env = stream.next().await.unwrap().unwrap();
        assert_eq!(env.payload.location, "VT");
        assert_eq!(env.payload.solar.power, 4.0);
        assert!(source.stream().await.is_err());
    }

    #[tokio::test]
    async fn closed_pipeline_reports_unavailable() {
        let (tx, rx) = mpsc::channel(8);
        drop(rx);

        let res = router(tx).oneshot(post(BODY)).await.unwrap();
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
