//! TCP networking built on the reactor: socket/address wrappers, the
//! listening [`Acceptor`], per-connection state in [`Connection`], and
//! [`Server`] which ties them to a worker thread pool.

mod acceptor;
mod connection;
mod inet_addr;
mod server;
mod socket;

pub use acceptor::Acceptor;
pub use connection::{Connection, ConnState, ConnectionCallback, MessageCallback};
pub use inet_addr::InetAddress;
pub use server::Server;
pub use socket::Socket;
