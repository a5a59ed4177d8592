//! Agent runtime: network listeners, background pollers and shutdown.
//!
//! Every long-running service registers with one [`ServiceRegistry`] for the
//! lifetime of its loop and owns its own stop handle. Shutdown stops each
//! service in turn, then waits on the registry.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                       hostagent                        │
//! ├──────────────┬──────────────┬─────────────┬────────────┤
//! │ Passive      │ Server       │ Control     │ Status     │
//! │ listener     │ connector    │ channel     │ channel    │
//! │ (tcp, ZBXD)  │ (1s ticks)   │ (unix sock) │ (http)     │
//! ├──────────────┴──────────────┴─────────────┴────────────┤
//! │         Scheduler: built-ins │ plugin processes        │
//! └────────────────────────────────────────────────────────┘
//! ```

pub mod connector;
#[cfg(unix)]
pub mod control;
pub mod listener;
pub mod passive;
pub mod registry;
pub mod server;
pub mod status;

pub use connector::{ActiveCheck, ConnectorMessage, ServerConnector};
#[cfg(unix)]
pub use control::{send_command, Client, ControlChannel};
pub use listener::{ListenerContext, PassiveListener};
pub use registry::{ServiceHandle, ServiceRegistry};
pub use server::Agent;
pub use status::StatusChannel;
