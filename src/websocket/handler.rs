//! Application-facing WebSocket connection lifecycle callbacks.

use crate::net::Connection;
use crate::reactor::EventLoop;

pub trait WsHandler: Send + Sync {
    fn on_connect(&self, loop_: &mut EventLoop, conn: &mut Connection);
    fn on_message(&self, loop_: &mut EventLoop, conn: &mut Connection, message: &[u8]);
    fn on_close(&self, loop_: &mut EventLoop, conn: &mut Connection);
}
