pub mod dispatch;
pub mod error;
pub mod manager;
pub mod state;

#[cfg(test)]
mod test;

pub use self::error::{CloseReason, ConnectionError, Result};
pub use self::manager::{ClosedCallback, Connection, EngineFactory, ReadyCallback};
pub use self::state::ConnectionState;
