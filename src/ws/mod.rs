//! WebSocket subscription protocol.
//!
//! Goal-tagged packets are correlated with their replies by id; data pushes
//! are routed to the [`Subscription`] that owns them.

mod error;
mod events;
mod goal;
mod packet;
mod protocol;
#[cfg(feature = "websocket")]
mod socket;
mod subscription;

pub use error::{ProtocolError, SubscriptionError};
pub use events::{EventChannel, ListenerId};
pub use goal::{Goal, Operation, OperationMask};
pub use packet::{Packet, PacketRequest, PacketResponse};
pub use protocol::{Dispatch, ProtocolConfig, SubscriptionProtocol};
#[cfg(feature = "websocket")]
#[cfg_attr(docsrs, doc(cfg(feature = "websocket")))]
pub use socket::{WsConnection, WsStream};
pub use subscription::{DataEvent, Subscription, SubscriptionStatus};
