//! Websocket subscriptions to the server's event feeds.
//!
//! Each [`Subscription`] owns one socket. Frames are decoded to [`Notice`]s,
//! republished on the optional [`EventBus`] and queued for the owner in
//! delivery order. There is no reconnect: once the socket closes the
//! subscription simply yields no more notices.

mod bus;
mod topic;

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::auth::Token;
use crate::error::{BuildWatchError, Result};
use crate::events::Notice;

pub use bus::EventBus;
pub use topic::Topic;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Open,
    Closing,
    Closed,
}

/// Opens subscriptions against one server.
#[derive(Clone)]
pub struct Connector {
    ws_url: Url,
    token: Option<Token>,
    bus: Option<EventBus>,
}

impl Connector {
    pub fn new(ws_url: Url, token: Option<Token>) -> Self {
        Self {
            ws_url,
            token,
            bus: None,
        }
    }

    /// Republishes every decoded frame of every subscription on `bus`.
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub async fn connect(&self, topic: Topic) -> Result<Subscription> {
        let url = topic.url(&self.ws_url)?;
        let mut request = url.as_str().into_client_request()?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token.as_str()))
                .map_err(|e| BuildWatchError::Config(format!("Invalid token: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        debug!("Connecting to {url}");
        let (stream, _response) = connect_async(request).await?;
        info!("Subscribed to {topic}");

        let (mut write, mut read) = stream.split();
        let (notice_tx, notices) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ReadyState::Open);
        let (close, mut close_rx) = oneshot::channel::<()>();
        let bus = self.bus.clone();
        let label = topic.to_string();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut close_rx => {
                        let _ = state_tx.send(ReadyState::Closing);
                        if let Err(e) = write.send(Message::Close(None)).await {
                            debug!("Close handshake on {label} failed: {e}");
                        }
                        break;
                    }
                    frame = read.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            let Some(notice) = Notice::decode(&text) else {
                                debug!("Ignoring frame without event_type on {label}");
                                continue;
                            };
                            if let Some(bus) = &bus {
                                bus.publish(notice.clone());
                            }
                            if notice_tx.send(notice).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!("Server closed {label}");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("Lost {label}: {e}");
                            break;
                        }
                    }
                }
            }
            let _ = state_tx.send(ReadyState::Closed);
        });

        Ok(Subscription {
            topic,
            notices,
            state,
            close: Some(close),
            task,
        })
    }
}

/// One open websocket feed.
pub struct Subscription {
    topic: Topic,
    notices: mpsc::UnboundedReceiver<Notice>,
    state: watch::Receiver<ReadyState>,
    close: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn ready_state(&self) -> ReadyState {
        *self.state.borrow()
    }

    /// Next notice in delivery order; `None` once the socket is gone and
    /// everything it delivered has been consumed.
    pub async fn next_notice(&mut self) -> Option<Notice> {
        self.notices.recv().await
    }

    /// Closes the socket if it is open. Closing a socket that is already
    /// closing or closed does nothing.
    pub fn disconnect(&mut self) {
        if self.ready_state() != ReadyState::Open {
            debug!("{} already closing, nothing to disconnect", self.topic);
            return;
        }
        if let Some(close) = self.close.take() {
            let _ = close.send(());
        }
    }

    /// Waits until the socket task has finished.
    pub async fn closed(mut self) {
        self.disconnect();
        if let Err(e) = (&mut self.task).await {
            warn!("Socket task for {} ended abnormally: {e}", self.topic);
        }
    }

    /// Hands every notice to `callback` on a background task.
    pub fn on_event<F>(mut self, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(Notice) + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(notice) = self.next_notice().await {
                callback(notice);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// Serves one websocket connection that sends `frames` and then waits
    /// for the client to hang up.
    async fn serve(frames: Vec<String>) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(socket).await.unwrap();
            for frame in frames {
                ws.send(Message::Text(frame)).await.unwrap();
            }
            while let Some(Ok(message)) = ws.next().await {
                if message.is_close() {
                    break;
                }
            }
        });

        Url::parse(&format!("ws://{addr}")).unwrap()
    }

    fn repo_topic() -> Topic {
        Topic::Waterfall {
            repo_id: "repo-1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_delivers_notices_in_order_and_republishes() {
        let url = serve(vec![
            r#"{"event_type": "build_added", "uuid": "b1"}"#.to_string(),
            "garbage".to_string(),
            r#"{"event_type": "repo_status_changed", "status": "ready"}"#.to_string(),
        ])
        .await;

        let bus = EventBus::default();
        let mut listener = bus.listen_to("repo_status_changed");
        let connector = Connector::new(url, None).with_bus(bus);
        let mut subscription = connector.connect(repo_topic()).await.unwrap();
        assert_eq!(subscription.ready_state(), ReadyState::Open);

        assert_eq!(subscription.next_notice().await.unwrap().event_type, "build_added");
        assert_eq!(
            subscription.next_notice().await.unwrap().event_type,
            "repo_status_changed"
        );
        assert_eq!(listener.recv().await.unwrap().payload["status"], "ready");

        subscription.closed().await;
    }

    #[tokio::test]
    async fn test_bus_listener_ends_with_the_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(socket).await.unwrap();
            ws.send(Message::Text(
                r#"{"event_type": "repo_status_changed", "status": "running"}"#.to_string(),
            ))
            .await
            .unwrap();
            let _ = ws.close(None).await;
        });

        let bus = EventBus::default();
        let mut statuses = bus.listen_to("repo_status_changed");
        let connector = Connector::new(Url::parse(&format!("ws://{addr}")).unwrap(), None)
            .with_bus(bus);
        let feed = connector.connect(repo_topic()).await.unwrap().on_event(|_| {});
        drop(connector);

        assert_eq!(statuses.recv().await.unwrap().payload["status"], "running");
        assert!(statuses.recv().await.is_none());
        feed.await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_twice_is_a_noop() {
        let url = serve(Vec::new()).await;
        let connector = Connector::new(url, Some(Token::from("secret")));
        let mut subscription = connector.connect(repo_topic()).await.unwrap();

        subscription.disconnect();
        subscription.disconnect();
        assert!(subscription.next_notice().await.is_none());
        assert_eq!(subscription.ready_state(), ReadyState::Closed);
        subscription.disconnect();
    }

    #[tokio::test]
    async fn test_on_event_forwards_to_callback() {
        let url = serve(vec![r#"{"event_type": "step_output_info", "uuid": "s", "output": "x"}"#.to_string()]).await;
        let connector = Connector::new(url, None);
        let subscription = connector.connect(repo_topic()).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = subscription.on_event(move |notice| {
            let _ = tx.send(notice.event_type);
        });

        assert_eq!(rx.recv().await.unwrap(), "step_output_info");
    }
}
