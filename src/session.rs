use std::collections::HashMap;
use std::future::Future;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};

use crate::engine::{OutputSentinels, PendingCounts, Reconciler};
use crate::error::Result;
use crate::events::{Event, OutputChunk, Step};
use crate::transport::{Connector, Subscription, Topic};
use crate::waterfall::WaterfallModel;

/// Output sentinels backed by one websocket per running step.
///
/// Every sentinel forwards its chunks into a single channel that the session
/// loop drains, so engine state is only ever touched from that loop.
pub struct SocketSentinels {
    connector: Connector,
    chunks: mpsc::UnboundedSender<OutputChunk>,
    live: HashMap<String, oneshot::Sender<()>>,
}

impl SocketSentinels {
    pub fn new(connector: Connector, chunks: mpsc::UnboundedSender<OutputChunk>) -> Self {
        Self {
            connector,
            chunks,
            live: HashMap::new(),
        }
    }
}

impl OutputSentinels for SocketSentinels {
    fn open(&mut self, step: &Step) {
        let (close, mut close_rx) = oneshot::channel::<()>();
        let connector = self.connector.clone();
        let chunks = self.chunks.clone();
        let uuid = step.uuid.clone();

        tokio::spawn(async move {
            let topic = Topic::StepOutput {
                step_uuid: uuid.clone(),
            };
            let mut subscription = match connector.connect(topic).await {
                Ok(subscription) => subscription,
                Err(e) => {
                    warn!("Could not stream output of step {uuid}: {e}");
                    return;
                }
            };

            loop {
                tokio::select! {
                    _ = &mut close_rx => break,
                    notice = subscription.next_notice() => {
                        let Some(notice) = notice else { break };
                        match Event::from_notice(&notice) {
                            Ok(Some(Event::StepOutputInfo(mut chunk))) => {
                                if chunk.uuid.is_empty() {
                                    chunk.uuid = uuid.clone();
                                }
                                if chunks.send(chunk).is_err() {
                                    break;
                                }
                            }
                            Ok(_) => debug!("Ignoring {} on output feed of {uuid}", notice.event_type),
                            Err(e) => debug!("Malformed output frame for {uuid}: {e}"),
                        }
                    }
                }
            }

            subscription.closed().await;
            debug!("Output sentinel for step {uuid} closed");
        });

        self.live.insert(step.uuid.clone(), close);
    }

    /// Closing a step whose sentinel is already gone does nothing.
    fn close(&mut self, step_uuid: &str) -> Result<()> {
        let Some(close) = self.live.remove(step_uuid) else {
            debug!("No output sentinel open for step {step_uuid}, nothing to close");
            return Ok(());
        };
        // The task may already have ended with its socket.
        let _ = close.send(());
        Ok(())
    }
}

/// One live waterfall view: the engine, its main feed and its output sentinels.
pub struct WaterfallSession {
    engine: Reconciler<WaterfallModel, SocketSentinels>,
    feed: Subscription,
    chunks: mpsc::UnboundedReceiver<OutputChunk>,
}

/// Opens the repository's waterfall feed.
///
/// Subscribe before fetching the snapshot that seeds [`WaterfallSession::start`]:
/// frames published in between queue up on the feed and are applied after
/// the seed, where the engine absorbs whatever the snapshot already covered.
pub async fn subscribe(connector: &Connector, repo_id: &str) -> Result<Subscription> {
    connector
        .connect(Topic::Waterfall {
            repo_id: repo_id.to_string(),
        })
        .await
}

impl WaterfallSession {
    /// Applies `seed` to `model`, then hands the session the already open feed.
    pub fn start(
        connector: &Connector,
        feed: Subscription,
        model: WaterfallModel,
        seed: Vec<Event>,
        max_output_bytes: usize,
    ) -> Self {
        let (chunk_tx, chunks) = mpsc::unbounded_channel();
        let sentinels = SocketSentinels::new(connector.clone(), chunk_tx);
        let mut engine =
            Reconciler::with_sentinels(model, sentinels).with_max_output_bytes(max_output_bytes);

        let seeded = seed.len();
        for event in seed {
            engine.apply(event);
        }
        info!("Seeded waterfall with {seeded} events");

        Self {
            engine,
            feed,
            chunks,
        }
    }

    /// Processes events until `shutdown` resolves or the feed closes, calling
    /// `on_change` after every event that changed the view.
    ///
    /// Returns the last known view and whatever was still queued.
    pub async fn run<F, S>(mut self, mut on_change: F, shutdown: S) -> (WaterfallModel, PendingCounts)
    where
        F: FnMut(&WaterfallModel),
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        on_change(self.engine.sink());

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Closing waterfall view");
                    break;
                }
                notice = self.feed.next_notice() => {
                    let Some(notice) = notice else {
                        warn!("{} closed, keeping last known state", self.feed.topic());
                        break;
                    };
                    match Event::from_notice(&notice) {
                        Ok(Some(event)) => {
                            self.engine.apply(event);
                            on_change(self.engine.sink());
                        }
                        Ok(None) => debug!("Ignoring {} event", notice.event_type),
                        Err(e) => warn!("Ignoring malformed {} event: {e}", notice.event_type),
                    }
                }
                Some(chunk) = self.chunks.recv() => {
                    if self.engine.step_output(chunk) {
                        on_change(self.engine.sink());
                    }
                }
            }
        }

        self.feed.disconnect();
        self.engine.teardown()
    }
}

/// Feeds recorded frames, one JSON envelope per line, through a fresh engine.
///
/// Blank lines and frames with unknown tags are skipped; malformed frames are
/// logged and skipped.
pub fn replay(model: WaterfallModel, frames: &str, max_output_bytes: usize) -> (WaterfallModel, PendingCounts) {
    let mut engine = Reconciler::new(model).with_max_output_bytes(max_output_bytes);

    for (line_no, line) in frames.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match Event::decode(line) {
            Ok(Some(event)) => {
                engine.apply(event);
            }
            Ok(None) => debug!("Line {}: ignoring untyped or unknown frame", line_no + 1),
            Err(e) => warn!("Line {}: malformed frame: {e}", line_no + 1),
        }
    }

    engine.teardown()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Status;
    use futures::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::tungstenite::Message;
    use url::Url;

    fn frames() -> Vec<serde_json::Value> {
        let buildset = json!({"id": "bs-1", "title": "commit", "branch": "master"});
        let builder = json!({"id": "1", "name": "py311"});
        vec![
            json!({"event_type": "step_started", "uuid": "s1", "index": 1, "status": "running", "build": {"uuid": "b1"}}),
            json!({"event_type": "build_added", "uuid": "b1", "status": "pending", "builder": builder, "buildset": buildset}),
            json!({"event_type": "build_started", "uuid": "b1", "status": "running", "builder": builder, "buildset": buildset}),
            json!({"event_type": "step_started", "uuid": "s0", "index": 0, "status": "running", "build": {"uuid": "b1"}}),
            json!({"event_type": "repo_status_changed", "status": "running"}),
            json!({"event_type": "step_finished", "uuid": "s0", "index": 0, "status": "success", "total_time": "0:00:01", "build": {"uuid": "b1"}}),
            json!({"event_type": "step_finished", "uuid": "s1", "index": 1, "status": "success", "output": "ok", "build": {"uuid": "b1"}}),
            json!({"event_type": "build_finished", "uuid": "b1", "status": "success", "builder": builder, "buildset": buildset}),
        ]
    }

    #[test]
    fn test_replay_reconciles_recorded_frames() {
        let recorded = frames()
            .iter()
            .map(|frame| frame.to_string())
            .chain(["".to_string(), "not json".to_string()])
            .collect::<Vec<_>>()
            .join("\n");

        let (model, stranded) = replay(WaterfallModel::default(), &recorded, 1024);
        assert_eq!(stranded.total(), 0);
        assert_eq!(model.build("b1").unwrap().status, Status::Success);
        assert_eq!(model.step_order("b1"), vec![0, 1]);
        assert_eq!(model.step("s1").unwrap().output, "ok");
        assert_eq!(model.builder("1").unwrap().status, Some(Status::Success));
    }

    #[tokio::test]
    async fn test_session_runs_until_feed_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let frames = frames();
        let expected = frames.len();

        // Serves the waterfall feed, then one output feed per running step.
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else { break };
                let mut path = String::new();
                let callback = |request: &Request,
                                response: Response|
                 -> std::result::Result<Response, ErrorResponse> {
                    path = request.uri().path().to_string();
                    Ok(response)
                };
                let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(socket, callback).await else {
                    continue;
                };

                if path.ends_with("builds") {
                    for frame in &frames {
                        ws.send(Message::Text(frame.to_string())).await.unwrap();
                    }
                    let _ = ws.close(None).await;
                } else {
                    tokio::spawn(async move {
                        while let Some(Ok(message)) = ws.next().await {
                            if message.is_close() {
                                break;
                            }
                        }
                    });
                }
            }
        });

        let connector = Connector::new(Url::parse(&format!("ws://{addr}")).unwrap(), None);
        let feed = subscribe(&connector, "repo").await.unwrap();
        let session = WaterfallSession::start(&connector, feed, WaterfallModel::default(), Vec::new(), 1024);

        let mut redraws = 0;
        let (model, stranded) = session
            .run(|_| redraws += 1, std::future::pending::<()>())
            .await;

        assert!(redraws >= expected);
        assert_eq!(stranded.total(), 0);
        assert_eq!(model.build("b1").unwrap().status, Status::Success);
        assert_eq!(model.step_order("b1"), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_session_stops_on_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(socket).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                if message.is_close() {
                    break;
                }
            }
        });

        let connector = Connector::new(Url::parse(&format!("ws://{addr}")).unwrap(), None);
        let feed = subscribe(&connector, "repo").await.unwrap();
        let session = WaterfallSession::start(&connector, feed, WaterfallModel::default(), Vec::new(), 1024);

        let (model, stranded) = session.run(|_| {}, async {}).await;
        assert!(model.build("anything").is_none());
        assert_eq!(stranded.total(), 0);
    }

    #[tokio::test]
    async fn test_events_published_before_seeding_are_kept() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (sent_tx, sent_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(socket).await.unwrap();
            let added = json!({
                "event_type": "build_added",
                "uuid": "b-live",
                "status": "pending",
                "builder": {"id": "1", "name": "py311"},
                "buildset": {"id": "bs-live"}
            });
            ws.send(Message::Text(added.to_string())).await.unwrap();
            let _ = sent_tx.send(());
            let _ = ws.close(None).await;
        });

        let connector = Connector::new(Url::parse(&format!("ws://{addr}")).unwrap(), None);
        let feed = subscribe(&connector, "repo").await.unwrap();
        // The snapshot is fetched only after the server already published.
        sent_rx.await.unwrap();

        let snapshot: Vec<crate::events::BuildSet> = serde_json::from_value(json!([{
            "id": "bs-old",
            "builds": [{"uuid": "b-old", "status": "pending", "builder": {"id": "1", "name": "py311"}}]
        }]))
        .unwrap();
        let seed = crate::waterfall::seed_events(&snapshot);
        let session = WaterfallSession::start(&connector, feed, WaterfallModel::default(), seed, 1024);

        let (model, stranded) = session.run(|_| {}, std::future::pending::<()>()).await;
        assert_eq!(stranded.total(), 0);
        assert_eq!(model.build("b-old").unwrap().status, Status::Pending);
        assert_eq!(model.build("b-live").unwrap().status, Status::Pending);
    }

    #[tokio::test]
    async fn test_closing_a_sentinel_twice_is_a_noop() {
        let (chunk_tx, _chunks) = mpsc::unbounded_channel();
        let connector = Connector::new(Url::parse("ws://127.0.0.1:1").unwrap(), None);
        let mut sentinels = SocketSentinels::new(connector, chunk_tx);

        let step = Step {
            uuid: "s0".to_string(),
            ..Step::default()
        };
        sentinels.open(&step);
        tokio_test::assert_ok!(sentinels.close("s0"));
        tokio_test::assert_ok!(sentinels.close("s0"));
        tokio_test::assert_ok!(sentinels.close("never-opened"));
    }
}
