//! Client-side session manager for a cloud IoT pub/sub broker
//!
//! The crate keeps one logical pub/sub session alive across transport
//! replacements and network interruptions:
//!
//! - [`SessionManager`] validates credentials, attaches policies, resolves the
//!   broker endpoint and installs a [`transport::Transport`]
//! - subscriptions requested while disconnected are queued and replayed in
//!   order on the next Connect
//! - transport lifecycle signals are normalized into [`Event`]s on an
//!   [`EventBus`], with `/gz` topic payloads decompressed on the way
//!
//! The MQTT adapter in [`transport::mqtt`] talks to the broker over
//! SigV4-presigned websockets, MQTTS or plain MQTT.

pub mod codec;
pub mod config;
pub mod control_plane;
pub mod credentials;
pub mod error;
pub mod events;
pub mod observability;
pub mod session;
pub mod testing;
pub mod transport;

pub use codec::CodecError;
pub use config::{ConfigError, SessionConfig};
pub use control_plane::{ControlPlane, ControlPlaneError, StaticControlPlane};
pub use credentials::{
    Credential, CredentialError, CredentialProvider, ExternalCredentials, PoolCredentials,
    StaticCredentials,
};
pub use error::{SessionError, SessionResult};
pub use events::{Event, EventBus, EventSubscription};
pub use session::{
    ConnectRequest, HandleStatus, SessionManager, SessionOptions, SessionState,
    SubscriptionDropped, SubscriptionHandle,
};
pub use transport::{Transport, TransportError, TransportFactory, TransportSignal};
