//! Client sessions
//!
//! Each configured MQTT-SN client gets a [`SessionDriver`] task owning its
//! [`SessionState`], its [`PublishForwarder`] and its retry timer.

pub mod driver;
pub mod forwarder;
pub mod state;
pub mod timer;

pub use driver::{SessionDriver, SessionEvent, SessionHandle};
pub use forwarder::{Action, ForwarderState, InFlight, Phase, PublishForwarder};
pub use state::{ConnectionStatus, PendingPublish, RetryConfig, SessionState};
pub use timer::RetryTimer;
