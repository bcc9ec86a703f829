//! Ties an [`Acceptor`] to an [`EventLoopThreadPool`]: every accepted
//! socket is handed off to the next worker loop round-robin, where it
//! becomes a [`Connection`].

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::info;

use crate::config::NetworkConfig;
use crate::reactor::{EventLoop, EventLoopThreadPool};
use crate::tls::TlsContext;

use super::acceptor::Acceptor;
use super::connection::{Connection, ConnectionCallback, MessageCallback};
use super::inet_addr::InetAddress;

type ConnectionMap = Arc<Mutex<HashMap<String, Arc<Mutex<Connection>>>>>;

pub struct Server {
    name: String,
    acceptor: Option<Acceptor>,
    thread_pool: EventLoopThreadPool,
    connections: ConnectionMap,
    next_conn_id: Arc<AtomicU64>,
    tls_context: Option<Arc<TlsContext>>,
    connection_cb: Option<Arc<Mutex<ConnectionCallback>>>,
    message_cb: Option<Arc<Mutex<MessageCallback>>>,
    close_cb: Option<Arc<Mutex<ConnectionCallback>>>,
    idle_timeout_secs: u64,
}

impl Server {
    pub fn new(name: impl Into<String>, config: &NetworkConfig) -> io::Result<Self> {
        let tls_context = if config.ssl.enabled {
            let ctx = TlsContext::load(&config.ssl.cert_path, &config.ssl.key_path)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            Some(Arc::new(ctx))
        } else {
            None
        };

        let mut thread_pool = EventLoopThreadPool::new(config.epoll_mode == crate::config::EpollMode::Et);
        thread_pool.set_thread_num(config.thread_pool.thread_num);
        thread_pool.set_queue_size(config.thread_pool.queue_size);
        thread_pool.set_keep_alive_time(config.thread_pool.keep_alive_time);
        thread_pool.set_max_idle_threads(config.thread_pool.max_idle_threads);
        thread_pool.set_min_idle_threads(config.thread_pool.min_idle_threads);

        Ok(Server {
            name: name.into(),
            acceptor: None,
            thread_pool,
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_conn_id: Arc::new(AtomicU64::new(0)),
            tls_context,
            connection_cb: None,
            message_cb: None,
            close_cb: None,
            idle_timeout_secs: config.idle_timeout,
        })
    }

    pub fn set_connection_callback(&mut self, cb: ConnectionCallback) {
        self.connection_cb = Some(Arc::new(Mutex::new(cb)));
    }

    pub fn set_message_callback(&mut self, cb: MessageCallback) {
        self.message_cb = Some(Arc::new(Mutex::new(cb)));
    }

    pub fn set_close_callback(&mut self, cb: ConnectionCallback) {
        self.close_cb = Some(Arc::new(Mutex::new(cb)));
    }

    /// Starts the thread pool's worker loops and binds the listener on
    /// `base_loop`. `base_loop` must be the loop that will call `run()`
    /// (conventionally the process's main loop).
    pub fn start(&mut self, base_loop: &mut EventLoop, addr: &InetAddress, reuse_port: bool) -> io::Result<()> {
        self.thread_pool.start(base_loop, |_loop_| {})?;

        let name = self.name.clone();
        let connections = self.connections.clone();
        let tls_context = self.tls_context.clone();
        let connection_cb = self.connection_cb.clone();
        let message_cb = self.message_cb.clone();
        let close_cb = self.close_cb.clone();
        let idle_timeout_secs = self.idle_timeout_secs;
        let local = *addr;
        let next_conn_id = self.next_conn_id.clone();

        // The acceptor itself lives on `base_loop`; each accepted socket
        // is round-robined onto a worker loop (or, with zero worker
        // threads, registered back onto `base_loop` via its own handle).
        let pool_handles: Vec<_> = self.thread_pool.get_all_loops();
        let next_counter = Arc::new(AtomicU64::new(0));
        let base_handle = base_loop.handle();

        let acceptor = Acceptor::new(base_loop, addr, reuse_port, move |_accept_loop, socket, peer| {
            let conn_id = next_conn_id.fetch_add(1, Ordering::Relaxed);
            let conn_name = format!("{name}-{peer}#{conn_id}");

            let target_handle = if pool_handles.is_empty() {
                base_handle.clone()
            } else {
                let idx = next_counter.fetch_add(1, Ordering::Relaxed) as usize % pool_handles.len();
                pool_handles[idx].clone()
            };

            let connections = connections.clone();
            let tls_context = tls_context.clone();
            let connection_cb = connection_cb.clone();
            let message_cb = message_cb.clone();
            let close_cb = close_cb.clone();

            target_handle.queue_in_loop(move |loop_| {
                let conn = match Connection::new(
                    conn_name.clone(),
                    socket,
                    local,
                    peer,
                    loop_.handle(),
                    tls_context.as_deref(),
                ) {
                    Ok(c) => Arc::new(Mutex::new(c)),
                    Err(e) => {
                        log::warn!("failed to establish TLS session for {conn_name}: {e}");
                        return;
                    }
                };

                {
                    let mut guard = conn.lock().unwrap();
                    if let Some(cb) = connection_cb.clone() {
                        guard.set_connection_callback(Box::new(move |loop_, conn| {
                            (cb.lock().unwrap())(loop_, conn);
                        }));
                    }
                    if let Some(cb) = message_cb.clone() {
                        guard.set_message_callback(Box::new(move |loop_, conn, ts| {
                            (cb.lock().unwrap())(loop_, conn, ts);
                        }));
                    }
                    let conns_for_close = connections.clone();
                    let name_for_close = conn_name.clone();
                    let user_close_cb = close_cb.clone();
                    guard.set_close_callback(Box::new(move |loop_, conn| {
                        conns_for_close.lock().unwrap().remove(&name_for_close);
                        if let Some(cb) = user_close_cb.clone() {
                            (cb.lock().unwrap())(loop_, conn);
                        }
                    }));
                }

                connections.lock().unwrap().insert(conn_name.clone(), conn.clone());
                if let Err(e) = Connection::connect_established(loop_, conn.clone()) {
                    log::warn!("failed to register connection {conn_name}: {e}");
                    connections.lock().unwrap().remove(&conn_name);
                    return;
                }

                if idle_timeout_secs > 0 {
                    let weak: Weak<Mutex<Connection>> = Arc::downgrade(&conn);
                    let mut guard = conn.lock().unwrap();
                    guard.set_self_handle(weak);
                    guard.set_idle_timeout(std::time::Duration::from_secs(idle_timeout_secs));
                    guard.renew_idle_timer(loop_);
                }
            });
        })?;

        info!("server \"{}\" accepting on {addr}", self.name);
        self.acceptor = Some(acceptor);
        Ok(())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }
}
