//! Process entry point: loads config, wires a [`Router`] and
//! [`Dispatcher`] into a [`Server`], and runs the accept loop until
//! `SIGINT`/`SIGTERM`.

use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info};

use reactor_web::config::AppConfig;
use reactor_web::dispatcher::Dispatcher;
use reactor_web::error::ServerError;
use reactor_web::net::{InetAddress, Server};
use reactor_web::reactor::EventLoop;
use reactor_web::router::{Flow, Middleware, Router};
use reactor_web::http::{Request, Response, StatusCode};

fn health_check() -> Middleware {
    Arc::new(|_req: &mut Request, resp: &mut Response| {
        resp.set_status_code(StatusCode::Ok);
        resp.set_content_type("text/plain");
        resp.set_body(b"ok".to_vec());
        Flow::Continue
    })
}

fn build_router() -> Router {
    let mut router = Router::new();
    router.get("/healthz", vec![health_check()]);
    router
}

fn run() -> Result<(), ServerError> {
    let config_path = env::args().nth(1).unwrap_or_else(|| "config.yaml".to_string());
    let config = AppConfig::load(&config_path)?;

    env_logger::Builder::new()
        .filter_level(config.log.level.as_filter())
        .init();

    let router = Arc::new(build_router());
    let dispatcher = Arc::new(Dispatcher::new(router));

    let mut server = Server::new("reactor-webd", &config.network)?;

    let conn_dispatcher = dispatcher.clone();
    server.set_connection_callback(Box::new(move |loop_, conn| {
        conn_dispatcher.on_connection(loop_, conn);
    }));

    let msg_dispatcher = dispatcher.clone();
    server.set_message_callback(Box::new(move |loop_, conn, ts| {
        msg_dispatcher.on_message(loop_, conn, ts);
    }));

    let close_dispatcher = dispatcher.clone();
    server.set_close_callback(Box::new(move |loop_, conn| {
        close_dispatcher.on_close(loop_, conn);
    }));

    let mut main_loop = EventLoop::new(config.network.epoll_mode == reactor_web::config::EpollMode::Et, true)?;
    main_loop.register_for_termination_signals();

    let addr = InetAddress::new(&config.network.ip, config.network.port)
        .map_err(|e| ServerError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string())))?;
    server.start(&mut main_loop, &addr, config.network.reuse_port)?;

    info!("reactor-webd listening on {addr}");
    main_loop.run()?;
    info!("reactor-webd shutting down");
    Ok(())
}

fn main() -> ExitCode {
    if let Err(e) = run() {
        error!("fatal: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
