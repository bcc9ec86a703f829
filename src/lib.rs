//! `reactor_web`: a single-host HTTP/1.1 and WebSocket server framework
//! built on a hand-rolled epoll reactor — one [`reactor::EventLoop`] per
//! thread, `Channel`s registered on it, timers driven by `timerfd`, and
//! cross-thread wakeup via an `eventfd`-backed `Waker`.
//!
//! [`net::Server`] ties the reactor to a listening socket and a worker
//! thread pool; [`dispatcher::Dispatcher`] sits between a [`net::Connection`]
//! and a [`router::Router`], feeding bytes to the HTTP/WebSocket parsers and
//! serializing responses back out.

pub mod buffer;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod mempool;
pub mod net;
pub mod reactor;
pub mod router;
pub mod timestamp;
pub mod tls;
pub mod websocket;

pub use buffer::Buffer;
pub use config::AppConfig;
pub use dispatcher::Dispatcher;
pub use error::{ConfigError, HttpError, ServerError, TlsError, WsError};
pub use net::{Connection, Server};
pub use reactor::{EventLoop, EventLoopHandle};
pub use router::{Middleware, Router};
pub use timestamp::Timestamp;
