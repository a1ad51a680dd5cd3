//! TCP side: reliable message sessions and the acceptor that creates them.

mod acceptor;
mod session;

pub use acceptor::{ConnectListener, SessionAcceptor};
pub use session::{MessageListener, Reconnecting, Session};
