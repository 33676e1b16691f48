//! Packet correlation and subscription routing.
//!
//! [`SubscriptionProtocol`] is transport-agnostic: outbound frames go to the
//! receiver returned by [`SubscriptionProtocol::new`] and inbound frames are
//! fed to [`SubscriptionProtocol::handle_frame`]. The socket driver in
//! [`socket`](super::socket) wires both ends to a WebSocket, tests wire them
//! to plain channels.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::error::{ProtocolError, SubscriptionError};
use super::goal::Goal;
use super::packet::{Packet, PacketRequest, PacketResponse};
use super::subscription::{DataEvent, Subscription, SubscriptionStatus};
use crate::core::constants::{DEFAULT_OUTBOUND_CAPACITY, DEFAULT_REPLY_TIMEOUT};

/// Protocol settings.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// How long a packet waits for its reply.
    pub reply_timeout: Duration,

    /// Capacity of the outbound frame queue.
    pub outbound_capacity: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

/// What [`SubscriptionProtocol::handle_frame`] did with a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Matched an outstanding packet and completed it.
    Correlated {
        /// Packet id.
        id: String,
        /// Packet goal.
        goal: Goal,
    },
    /// A data push routed to a subscription.
    Data {
        /// Client id of the subscription.
        subscription: String,
        /// Whether a channel received it.
        delivered: bool,
    },
    /// Nobody was waiting for it.
    Dropped,
}

#[derive(Default)]
struct Tables {
    outstanding: HashMap<String, Arc<Packet>>,
    subscriptions: HashMap<String, Subscription>,
    routes: HashMap<String, String>,
}

struct ProtocolInner {
    config: ProtocolConfig,
    outbound: mpsc::Sender<String>,
    unsubscribe_tx: mpsc::UnboundedSender<Subscription>,
    tables: Mutex<Tables>,
}

/// Correlation engine for one socket session. Cheap to clone.
#[derive(Clone)]
pub struct SubscriptionProtocol {
    inner: Arc<ProtocolInner>,
}

impl SubscriptionProtocol {
    /// Create the engine and the receiver of its outbound frames.
    ///
    /// Spawns the task that turns [`Subscription::unsubscribe`] calls into
    /// Unsubscribe packets, so it must run inside a tokio runtime.
    pub fn new(config: ProtocolConfig) -> (Self, mpsc::Receiver<String>) {
        let (outbound, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let (unsubscribe_tx, mut unsubscribe_rx) = mpsc::unbounded_channel::<Subscription>();

        let inner = Arc::new(ProtocolInner {
            config,
            outbound,
            unsubscribe_tx,
            tables: Mutex::new(Tables::default()),
        });

        let weak: Weak<ProtocolInner> = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(subscription) = unsubscribe_rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let protocol = SubscriptionProtocol { inner };
                tokio::spawn(async move {
                    if let Err(e) = protocol.send_unsubscribe(&subscription).await {
                        warn!(id = %subscription.id(), error = %e, "unsubscribe failed");
                    }
                });
            }
            debug!("unsubscribe bridge stopped");
        });

        (Self { inner }, outbound_rx)
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.inner
            .tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Send `request` and wait for the correlated reply.
    ///
    /// The reply is returned whatever its result code.
    pub async fn request(&self, request: PacketRequest) -> Result<PacketResponse, ProtocolError> {
        let frame = request.to_frame()?;
        let packet = Arc::new(Packet::new(request));
        let id = packet.id().to_string();

        self.tables()
            .outstanding
            .insert(id.clone(), Arc::clone(&packet));
        packet.mark_sent();
        debug!(%id, goal = ?packet.goal(), "packet sent");

        if self.inner.outbound.send(frame).await.is_err() {
            self.tables().outstanding.remove(&id);
            return Err(ProtocolError::ConnectionClosed);
        }

        let waited =
            tokio::time::timeout(self.inner.config.reply_timeout, packet.reply().wait()).await;
        self.tables().outstanding.remove(&id);
        match waited {
            Ok(outcome) => outcome,
            Err(_) => {
                let error = ProtocolError::Timeout { id };
                // A reply racing the timeout may already have completed it.
                let _ = packet.fail(error.clone());
                Err(error)
            }
        }
    }

    /// Authenticate the session.
    pub async fn authenticate(&self, token: &str) -> Result<PacketResponse, ProtocolError> {
        self.request(PacketRequest::auth(token)).await?.into_result()
    }

    /// Announce presence.
    pub async fn presence(&self, online: bool) -> Result<PacketResponse, ProtocolError> {
        self.request(PacketRequest::presence(online))
            .await?
            .into_result()
    }

    /// Query connection status.
    pub async fn status(&self) -> Result<PacketResponse, ProtocolError> {
        self.request(PacketRequest::status()).await?.into_result()
    }

    /// Open `subscription` and wait until the server acknowledges it.
    ///
    /// On success the subscription is ACTIVE. On failure it is CANCELLED and
    /// its error channel has been notified. A subscription unsubscribed while
    /// the reply was pending yields [`SubscriptionError::Cancelled`].
    pub async fn subscribe(&self, subscription: &Subscription) -> Result<(), ProtocolError> {
        subscription.mark_pending()?;

        subscription.set_close_hook(self.inner.unsubscribe_tx.clone());
        self.tables()
            .subscriptions
            .insert(subscription.id().to_string(), subscription.clone());

        match self.request(PacketRequest::subscribe(subscription)).await {
            Ok(response) => {
                response.into_result()?;
                if subscription.status() != SubscriptionStatus::Active {
                    debug!(id = %subscription.id(), "cancelled before the subscribe reply");
                    return Err(SubscriptionError::Cancelled.into());
                }
                Ok(())
            }
            Err(e) => {
                self.forget(subscription);
                subscription.fail(e.clone());
                Err(e)
            }
        }
    }

    /// Cancel `subscription` and wait for the server to acknowledge the
    /// Unsubscribe packet.
    pub async fn unsubscribe(
        &self,
        subscription: &Subscription,
    ) -> Result<PacketResponse, ProtocolError> {
        subscription.take_close_hook();
        if !subscription.unsubscribe() {
            return Err(SubscriptionError::Cancelled.into());
        }
        self.send_unsubscribe(subscription).await
    }

    async fn send_unsubscribe(
        &self,
        subscription: &Subscription,
    ) -> Result<PacketResponse, ProtocolError> {
        self.forget(subscription);
        let server_id = subscription.subscription_id();
        info!(id = %subscription.id(), ?server_id, "unsubscribing");
        self.request(PacketRequest::unsubscribe(
            subscription.id(),
            server_id.as_deref(),
        ))
        .await?
        .into_result()
    }

    fn forget(&self, subscription: &Subscription) {
        let mut tables = self.tables();
        tables.subscriptions.remove(subscription.id());
        tables
            .routes
            .retain(|_, client_id| client_id != subscription.id());
    }

    /// Handle one inbound text frame.
    ///
    /// A frame that does not parse is an error; a frame nobody waits for is
    /// logged and reported as [`Dispatch::Dropped`].
    pub fn handle_frame(&self, frame: &str) -> Result<Dispatch, ProtocolError> {
        let response = PacketResponse::from_frame(frame)?;

        let packet = response
            .id
            .as_deref()
            .and_then(|id| self.tables().outstanding.remove(id));
        if let Some(packet) = packet {
            let id = packet.id().to_string();
            let goal = packet.goal();
            if goal == Goal::Subscribe && response.goal == Goal::Subscribe {
                self.settle_subscribe(&id, &response);
            }
            packet.set_response(response)?;
            return Ok(Dispatch::Correlated { id, goal });
        }

        if response.goal == Goal::Data {
            return self.route_data(response);
        }

        warn!(id = ?response.id, goal = ?response.goal, "reply for unknown packet dropped");
        Ok(Dispatch::Dropped)
    }

    fn settle_subscribe(&self, id: &str, response: &PacketResponse) {
        let subscription = self.tables().subscriptions.get(id).cloned();
        let Some(subscription) = subscription else {
            return;
        };

        if !response.is_success() {
            self.forget(&subscription);
            subscription.fail(ProtocolError::Rejected {
                goal: Goal::Subscribe,
                code: response.result_code,
                message: response.result_code_message.clone(),
            });
            return;
        }

        let server_id = response
            .field("subscriptionId")
            .and_then(|v| v.as_str())
            .unwrap_or(id)
            .to_string();
        match subscription.activate(server_id.clone()) {
            Ok(()) => {
                self.tables().routes.insert(server_id, id.to_string());
            }
            Err(e) => warn!(%id, error = %e, "subscribe reply for non-pending subscription"),
        }
    }

    fn route_data(&self, response: PacketResponse) -> Result<Dispatch, ProtocolError> {
        let subscription = {
            let tables = self.tables();
            let client_id = response
                .field("subscriptionId")
                .and_then(|v| v.as_str())
                .and_then(|server_id| tables.routes.get(server_id))
                .or(response.id.as_ref());
            client_id
                .and_then(|client_id| tables.subscriptions.get(client_id))
                .cloned()
        };
        let Some(subscription) = subscription else {
            warn!(id = ?response.id, "data for unknown subscription dropped");
            return Ok(Dispatch::Dropped);
        };
        let client_id = subscription.id().to_string();

        if !response.is_success() {
            warn!(id = %client_id, code = response.result_code, "subscription failed on server");
            self.forget(&subscription);
            subscription.fail(ProtocolError::Rejected {
                goal: Goal::Data,
                code: response.result_code,
                message: response.result_code_message,
            });
            return Ok(Dispatch::Data {
                subscription: client_id,
                delivered: false,
            });
        }

        let event = DataEvent::from_response(&response)?;
        let delivered = subscription.dispatch(&event);
        Ok(Dispatch::Data {
            subscription: client_id,
            delivered,
        })
    }

    /// Write every outstanding packet again, after a reconnect.
    pub async fn resend_outstanding(&self) -> Result<usize, ProtocolError> {
        let packets: Vec<Arc<Packet>> = self.tables().outstanding.values().cloned().collect();
        for packet in &packets {
            let frame = packet.request().to_frame()?;
            packet.mark_sent();
            self.inner
                .outbound
                .send(frame)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }
        if !packets.is_empty() {
            info!(count = packets.len(), "outstanding packets resent");
        }
        Ok(packets.len())
    }

    /// Reject every outstanding packet with `error`.
    pub fn fail_outstanding(&self, error: ProtocolError) -> usize {
        let packets: Vec<Arc<Packet>> = self
            .tables()
            .outstanding
            .drain()
            .map(|(_, packet)| packet)
            .collect();
        for packet in &packets {
            let _ = packet.fail(error.clone());
        }
        if !packets.is_empty() {
            warn!(count = packets.len(), %error, "outstanding packets failed");
        }
        packets.len()
    }

    /// Number of packets waiting for a reply.
    pub fn outstanding_count(&self) -> usize {
        self.tables().outstanding.len()
    }

    /// Subscriptions currently registered.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.tables()
            .subscriptions
            .values()
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for SubscriptionProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables();
        f.debug_struct("SubscriptionProtocol")
            .field("outstanding", &tables.outstanding.len())
            .field("subscriptions", &tables.subscriptions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::{OperationMask, SubscriptionStatus};
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn protocol(reply_timeout: Duration) -> (SubscriptionProtocol, mpsc::Receiver<String>) {
        SubscriptionProtocol::new(ProtocolConfig {
            reply_timeout,
            ..ProtocolConfig::default()
        })
    }

    async fn next_frame(rx: &mut mpsc::Receiver<String>) -> Value {
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        serde_json::from_str(&frame).unwrap()
    }

    fn reply(protocol: &SubscriptionProtocol, request: &Value, extra: Value) -> Dispatch {
        let mut body = json!({ "id": request["id"], "goal": request["goal"] });
        if let (Some(body), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
            body.extend(extra.clone());
        }
        protocol.handle_frame(&body.to_string()).unwrap()
    }

    fn counter<T>(channel: &crate::ws::EventChannel<T>) -> Arc<AtomicUsize> {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        channel.listen(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        hits
    }

    async fn subscribed(
        protocol: &SubscriptionProtocol,
        rx: &mut mpsc::Receiver<String>,
        server_id: &str,
    ) -> Subscription {
        let subscription = Subscription::new("device", OperationMask::ALL, json!({ "site": 1 }));
        let call = {
            let protocol = protocol.clone();
            let subscription = subscription.clone();
            tokio::spawn(async move { protocol.subscribe(&subscription).await })
        };
        let request = next_frame(rx).await;
        reply(protocol, &request, json!({ "subscriptionId": server_id }));
        call.await.unwrap().unwrap();
        subscription
    }

    #[tokio::test]
    async fn test_reply_correlated_by_id() {
        let (protocol, mut rx) = protocol(Duration::from_secs(5));
        let call = {
            let protocol = protocol.clone();
            tokio::spawn(async move { protocol.status().await })
        };

        let request = next_frame(&mut rx).await;
        assert_eq!(request["goal"], 5);
        let id = request["id"].as_str().unwrap().to_string();

        let dispatch = reply(&protocol, &request, json!({ "uptime": 42 }));
        assert_eq!(dispatch, Dispatch::Correlated { id, goal: Goal::Status });

        let response = call.await.unwrap().unwrap();
        assert_eq!(response.field("uptime"), Some(&json!(42)));
        assert_eq!(protocol.outstanding_count(), 0);
    }

    #[tokio::test]
    async fn test_rejected_reply() {
        let (protocol, mut rx) = protocol(Duration::from_secs(5));
        let call = {
            let protocol = protocol.clone();
            tokio::spawn(async move { protocol.authenticate("bad").await })
        };

        let request = next_frame(&mut rx).await;
        assert_eq!(request["token"], "bad");
        reply(&protocol, &request, json!({ "resultCode": 2 }));

        assert!(matches!(
            call.await.unwrap(),
            Err(ProtocolError::Rejected { goal: Goal::Auth, code: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_reply_timeout() {
        let (protocol, mut rx) = protocol(Duration::from_millis(20));
        let result = protocol.presence(true).await;

        assert!(matches!(result, Err(ProtocolError::Timeout { .. })));
        assert_eq!(protocol.outstanding_count(), 0);
        assert_eq!(next_frame(&mut rx).await["online"], true);
    }

    #[tokio::test]
    async fn test_unknown_id_dropped() {
        let (protocol, _rx) = protocol(Duration::from_secs(5));
        assert_eq!(
            protocol.handle_frame(r#"{"id":"nobody","goal":5}"#).unwrap(),
            Dispatch::Dropped
        );
        assert!(matches!(
            protocol.handle_frame("not json"),
            Err(ProtocolError::Json(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_and_route_data() {
        let (protocol, mut rx) = protocol(Duration::from_secs(5));
        let subscription = Subscription::new("device", OperationMask::ALL, json!({ "site": 1 }));
        let creates = counter(subscription.on_create());
        let edits = counter(subscription.on_edit());

        let call = {
            let protocol = protocol.clone();
            let subscription = subscription.clone();
            tokio::spawn(async move { protocol.subscribe(&subscription).await })
        };

        let request = next_frame(&mut rx).await;
        assert_eq!(request["goal"], 3);
        assert_eq!(request["id"], subscription.id());
        assert_eq!(request["type"], "device");
        assert_eq!(request["operation"], 7);
        assert_eq!(subscription.status(), SubscriptionStatus::Pending);

        reply(&protocol, &request, json!({ "subscriptionId": "srv-9" }));
        call.await.unwrap().unwrap();
        assert_eq!(subscription.status(), SubscriptionStatus::Active);
        assert_eq!(subscription.subscription_id().as_deref(), Some("srv-9"));

        let dispatch = protocol
            .handle_frame(r#"{"goal":6,"subscriptionId":"srv-9","operation":2,"data":{"id":1}}"#)
            .unwrap();
        assert_eq!(
            dispatch,
            Dispatch::Data {
                subscription: subscription.id().to_string(),
                delivered: true,
            }
        );
        assert_eq!(edits.load(Ordering::SeqCst), 1);
        assert_eq!(creates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_subscribe_rejected() {
        let (protocol, mut rx) = protocol(Duration::from_secs(5));
        let subscription = Subscription::new("device", OperationMask::CREATE, json!({}));
        let errors = counter(subscription.on_error());

        let call = {
            let protocol = protocol.clone();
            let subscription = subscription.clone();
            tokio::spawn(async move { protocol.subscribe(&subscription).await })
        };
        let request = next_frame(&mut rx).await;
        reply(&protocol, &request, json!({ "resultCode": 9, "resultCodeMessage": "no" }));

        assert!(matches!(
            call.await.unwrap(),
            Err(ProtocolError::Rejected { code: 9, .. })
        ));
        assert_eq!(subscription.status(), SubscriptionStatus::Cancelled);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(protocol.subscriptions().is_empty());

        assert!(matches!(
            protocol.subscribe(&subscription).await,
            Err(ProtocolError::Subscription(SubscriptionError::Cancelled))
        ));
    }

    #[tokio::test]
    async fn test_direct_unsubscribe_sends_packet() {
        let (protocol, mut rx) = protocol(Duration::from_secs(5));
        let subscription = subscribed(&protocol, &mut rx, "srv-1").await;

        assert!(subscription.unsubscribe());

        let request = next_frame(&mut rx).await;
        assert_eq!(request["goal"], 4);
        assert_eq!(request["requestId"], subscription.id());
        assert_eq!(request["subscriptionId"], "srv-1");
        reply(&protocol, &request, json!({}));

        assert!(!subscription.unsubscribe());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
        assert!(protocol.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_explicit_unsubscribe_sends_once() {
        let (protocol, mut rx) = protocol(Duration::from_secs(5));
        let subscription = subscribed(&protocol, &mut rx, "srv-2").await;
        let unsubscribes = counter(subscription.on_unsubscribe());

        let call = {
            let protocol = protocol.clone();
            let subscription = subscription.clone();
            tokio::spawn(async move { protocol.unsubscribe(&subscription).await })
        };
        let request = next_frame(&mut rx).await;
        assert_eq!(request["goal"], 4);
        reply(&protocol, &request, json!({}));
        call.await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(unsubscribes.load(Ordering::SeqCst), 1);
        assert_eq!(subscription.status(), SubscriptionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_unsubscribe_after_destroy_reaches_server() {
        let (protocol, mut rx) = protocol(Duration::from_secs(5));
        let subscription = subscribed(&protocol, &mut rx, "srv-4").await;

        subscription.destroy();
        assert!(subscription.unsubscribe());

        let request = next_frame(&mut rx).await;
        assert_eq!(request["goal"], 4);
        assert_eq!(request["subscriptionId"], "srv-4");
        reply(&protocol, &request, json!({}));
        assert!(protocol.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_while_pending_fails_subscribe() {
        let (protocol, mut rx) = protocol(Duration::from_secs(5));
        let subscription = Subscription::new("device", OperationMask::ALL, json!({}));
        let call = {
            let protocol = protocol.clone();
            let subscription = subscription.clone();
            tokio::spawn(async move { protocol.subscribe(&subscription).await })
        };
        let subscribe = next_frame(&mut rx).await;

        assert!(subscription.unsubscribe());
        let unsubscribe = next_frame(&mut rx).await;
        assert_eq!(unsubscribe["goal"], 4);

        reply(&protocol, &subscribe, json!({ "subscriptionId": "srv-5" }));
        assert_eq!(
            call.await.unwrap(),
            Err(ProtocolError::Subscription(SubscriptionError::Cancelled))
        );
        assert_eq!(subscription.status(), SubscriptionStatus::Cancelled);
        assert!(protocol.subscriptions().is_empty());
        reply(&protocol, &unsubscribe, json!({}));
    }

    #[tokio::test]
    async fn test_data_error_cancels_subscription() {
        let (protocol, mut rx) = protocol(Duration::from_secs(5));
        let subscription = subscribed(&protocol, &mut rx, "srv-3").await;
        let errors = counter(subscription.on_error());

        let dispatch = protocol
            .handle_frame(r#"{"goal":6,"subscriptionId":"srv-3","resultCode":11}"#)
            .unwrap();

        assert!(matches!(dispatch, Dispatch::Data { delivered: false, .. }));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(subscription.status(), SubscriptionStatus::Cancelled);
        assert_eq!(
            protocol
                .handle_frame(r#"{"goal":6,"subscriptionId":"srv-3","operation":1}"#)
                .unwrap(),
            Dispatch::Dropped
        );
    }

    #[tokio::test]
    async fn test_resend_and_fail_outstanding() {
        let (protocol, mut rx) = protocol(Duration::from_secs(5));
        let call = {
            let protocol = protocol.clone();
            tokio::spawn(async move { protocol.status().await })
        };
        let first = next_frame(&mut rx).await;

        assert_eq!(protocol.resend_outstanding().await.unwrap(), 1);
        let second = next_frame(&mut rx).await;
        assert_eq!(first["id"], second["id"]);

        assert_eq!(protocol.fail_outstanding(ProtocolError::ConnectionClosed), 1);
        assert_eq!(call.await.unwrap(), Err(ProtocolError::ConnectionClosed));
        assert_eq!(protocol.outstanding_count(), 0);
    }
}
