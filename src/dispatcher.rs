//! Per-connection protocol state and the glue between a [`Connection`]'s
//! raw bytes and the [`Router`]'s matched handler chain: feeds the HTTP
//! parser, serializes responses, and performs the WebSocket upgrade and
//! frame dispatch once a connection has switched protocols.

use std::sync::Arc;

use log::{info, warn};

use crate::buffer::Buffer;
use crate::http::{self, Request, Response, StatusCode, Version};
use crate::net::Connection;
use crate::reactor::EventLoop;
use crate::router::{self, Router};
use crate::timestamp::Timestamp;
use crate::websocket::{self, Opcode, WsHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Protocol {
    Http,
    WebSocket,
}

/// Lives in a [`Connection`]'s context slot for the connection's whole
/// lifetime; the HTTP parser is reset (not replaced) after each request
/// so keep-alive connections reuse it across requests.
struct SocketContext {
    protocol: Protocol,
    http_parser: http::Parser,
    ws_parser: websocket::Parser,
    ws_handler: Option<Arc<dyn WsHandler>>,
}

impl SocketContext {
    fn new() -> Self {
        SocketContext {
            protocol: Protocol::Http,
            http_parser: http::Parser::new(),
            ws_parser: websocket::Parser::new(),
            ws_handler: None,
        }
    }
}

fn context_mut(conn: &mut Connection) -> Option<&mut SocketContext> {
    conn.context_mut().and_then(|c| c.downcast_mut::<SocketContext>())
}

pub struct Dispatcher {
    router: Arc<Router>,
}

impl Dispatcher {
    pub fn new(router: Arc<Router>) -> Self {
        Dispatcher { router }
    }

    pub fn on_connection(&self, _loop_: &mut EventLoop, conn: &mut Connection) {
        conn.set_context(Box::new(SocketContext::new()));
    }

    pub fn on_close(&self, loop_: &mut EventLoop, conn: &mut Connection) {
        let handler = context_mut(conn).filter(|c| c.protocol == Protocol::WebSocket).and_then(|c| c.ws_handler.clone());
        if let Some(handler) = handler {
            handler.on_close(loop_, conn);
        }
    }

    pub fn on_message(&self, loop_: &mut EventLoop, conn: &mut Connection, ts: Timestamp) {
        let protocol = context_mut(conn).map(|c| c.protocol);
        match protocol {
            Some(Protocol::Http) => self.dispatch_http(loop_, conn, ts),
            Some(Protocol::WebSocket) => self.dispatch_websocket(loop_, conn),
            None => {}
        }
    }

    /// Drains as many complete requests as the input buffer currently
    /// holds (pipelining), stopping once the request asks the connection
    /// to close or an upgrade or parse error has handled the connection
    /// itself.
    fn dispatch_http(&self, loop_: &mut EventLoop, conn: &mut Connection, _ts: Timestamp) {
        loop {
            let parsed = {
                let (input, ctx) = conn.input_and_context();
                let Some(ctx) = ctx.and_then(|c| c.downcast_mut::<SocketContext>()) else { return };
                ctx.http_parser.parse(input)
            };

            if parsed.is_err() {
                self.write_status(loop_, conn, StatusCode::BadRequest, true);
                conn.shutdown();
                return;
            }

            let got_all = context_mut(conn).map(|c| c.http_parser.got_all()).unwrap_or(false);
            if !got_all {
                return;
            }

            let mut request = context_mut(conn).unwrap().http_parser.take_request();
            context_mut(conn).unwrap().http_parser.reset();

            if self.try_upgrade(loop_, conn, &mut request) {
                return;
            }

            let close = should_close(&request);
            self.route_and_respond(loop_, conn, &mut request, close);
            if close {
                return;
            }
        }
    }

    /// Returns `true` if the request was a WebSocket upgrade (handled
    /// here, protocol flipped) rather than a regular HTTP request.
    fn try_upgrade(&self, loop_: &mut EventLoop, conn: &mut Connection, request: &mut Request) -> bool {
        let wants_upgrade = request
            .header("Upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);
        if !wants_upgrade {
            return false;
        }

        let handler = match self.router.match_websocket(request.path()) {
            Some(h) => h,
            None => return false,
        };

        let key = match request.header("Sec-WebSocket-Key") {
            Some(k) => k.to_string(),
            None => {
                self.write_status(loop_, conn, StatusCode::BadRequest, true);
                conn.shutdown();
                return true;
            }
        };

        let mut resp = Response::new(false);
        resp.set_status_code(StatusCode::SwitchingProtocols);
        resp.set_status_message("Switching Protocols");
        resp.set_header("Upgrade", "websocket");
        resp.set_header("Connection", "Upgrade");
        resp.set_header("Sec-WebSocket-Accept", websocket::accept_key(&key));
        self.send_response(loop_, conn, &resp);

        if let Some(ctx) = context_mut(conn) {
            ctx.protocol = Protocol::WebSocket;
            ctx.ws_handler = Some(handler.clone());
        }
        info!("connection {} upgraded to WebSocket at {}", conn.name(), request.path());
        handler.on_connect(loop_, conn);
        true
    }

    fn route_and_respond(&self, loop_: &mut EventLoop, conn: &mut Connection, request: &mut Request, close: bool) {
        let method_str = router::method_str(request.method());
        let result = self.router.match_route(method_str, request.path());

        let mut resp = Response::new(close);
        if !result.matched || result.chain.is_empty() {
            resp.set_status_code(StatusCode::NotFound);
            resp.set_status_message("Not Found");
            resp.set_content_type("text/html");
            resp.set_body(b"<html><body><h1>404 Not Found</h1></body></html>".to_vec());
            warn!("404 Not Found: {}", request.path());
        } else {
            request.set_params(result.params);
            router::run_chain(&result.chain, request, &mut resp);
        }
        self.send_response(loop_, conn, &resp);
    }

    fn dispatch_websocket(&self, loop_: &mut EventLoop, conn: &mut Connection) {
        let handler = match context_mut(conn).and_then(|c| c.ws_handler.clone()) {
            Some(h) => h,
            None => return,
        };

        let mut frames = Vec::new();
        let parsed = {
            let (input, ctx) = conn.input_and_context();
            let Some(ctx) = ctx.and_then(|c| c.downcast_mut::<SocketContext>()) else { return };
            ctx.ws_parser.parse(input, |op, payload| frames.push((op, payload)))
        };
        if parsed.is_err() {
            conn.shutdown();
            return;
        }

        for (op, payload) in frames {
            match op {
                Opcode::Text | Opcode::Binary => handler.on_message(loop_, conn, &payload),
                Opcode::Ping => {
                    let frame = websocket::encode_frame(Opcode::Pong, &payload, true);
                    conn.send(loop_, &frame);
                }
                Opcode::Pong => {}
                Opcode::Close => {
                    handler.on_close(loop_, conn);
                    conn.shutdown();
                }
                Opcode::Continuation => {}
            }
        }
    }

    fn write_status(&self, loop_: &mut EventLoop, conn: &mut Connection, code: StatusCode, close: bool) {
        let mut resp = Response::new(close);
        resp.set_status_code(code);
        self.send_response(loop_, conn, &resp);
    }

    fn send_response(&self, loop_: &mut EventLoop, conn: &mut Connection, resp: &Response) {
        let mut out = Buffer::new();
        resp.append_to_buffer(&mut out);
        conn.send(loop_, out.peek());

        if let Some(path) = resp.file_path() {
            if let Err(e) = conn.send_file(loop_, path, resp.close_connection()) {
                warn!("connection {} send_file({path}) failed: {e}", conn.name());
                conn.shutdown();
            }
        }
    }
}

fn should_close(req: &Request) -> bool {
    match req.header("Connection") {
        Some(v) if v.eq_ignore_ascii_case("close") => true,
        Some(v) if v.eq_ignore_ascii_case("keep-alive") => false,
        _ => req.version() == Version::Http10,
    }
}
