//! forktunnel: an event tunnel between a process and its forked child.
//!
//! Two cooperating processes — one of which forked the other — exchange
//! application-level events over a private socket pair, as if a single event
//! bus spanned both. Dispatchers are registered before the fork; afterwards,
//! any registered event raised on one side is serialized, framed, written to
//! the bridge, and redispatched on the other side exactly once, with a
//! loopback guard so a relayed event never bounces back.
//!
//! ```no_run
//! use std::rc::Rc;
//! use forktunnel::{Dispatcher, DispatcherHandle, EventBus, Role, Tunnel};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Ping { n: u32 }
//!
//! # fn main() -> anyhow::Result<()> {
//! let bus: Rc<EventBus<Ping>> = Rc::new(EventBus::new());
//! let handle: DispatcherHandle<Ping> = bus.clone();
//!
//! let tunnel: Tunnel<Ping> = Tunnel::new()?;
//! tunnel.register_listener(&handle, ["ping"])?;
//!
//! // fork() here, then on both sides:
//! match tunnel.split()? {
//!     Role::Child => bus.dispatch("ping", &Ping { n: 1 })?,
//!     Role::Parent => {
//!         tunnel.wait(None)?; // handshake
//!         tunnel.wait(None)?; // the ping arrives on `bus`
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod dispatch;
pub mod event;

mod error;
mod identity;
mod kernel;
mod notify;
mod tunnel;

pub use bridge::codec::EnvelopeCodec;
pub use bridge::protocol::{DispatcherIndex, Envelope};
pub use dispatch::{Dispatcher, DispatcherHandle, EventBus, Listener, Subscription};
pub use error::{BoxError, Error, Result};
pub use event::{EventCodec, JsonEventCodec};
pub use identity::{ProcessIdentity, Role};
pub use tunnel::{Tunnel, TunnelConfig};
