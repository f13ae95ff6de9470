pub mod channel;
pub mod message;
pub mod relay;
pub mod transport;

pub use channel::{ChannelEvent, ChannelSender, SignalingChannel};
pub use message::{MessageKind, SignalingMessage, BROADCAST};
pub use relay::MemoryRelay;
pub use transport::{PubSubTransport, Subscription, SubscriptionHandle, TransportEvent};
