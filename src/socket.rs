//! The supervisor's TCP listener.
//!
//! Bound once per supervisor on the loopback interface and kept across child
//! restarts. It carries no protocol of its own: connected clients and received
//! bytes are reported as events, and raw payloads are handed to the optional
//! [`SocketDataHandler`] so an application can layer its own protocol on top.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info};

use crate::control::SupervisorHandle;
use crate::error::SupervisorError;
use crate::event::{Emitter, Event};
use crate::logger::Sinks;

/// Called with every chunk a client sends, plus a handle to the supervisor.
pub type SocketDataHandler = Arc<dyn Fn(&[u8], &SupervisorHandle) + Send + Sync>;

/// What a listener needs to report to the rest of the supervisor.
#[derive(Clone)]
pub struct ListenerContext {
    pub emitter: Emitter,
    pub sinks: Sinks,
    pub on_data: Option<SocketDataHandler>,
    pub handle: SupervisorHandle,
    pub idle_timeout: Option<Duration>,
}

pub struct SocketListener {
    port: u16,
    accept_task: JoinHandle<()>,
}

impl SocketListener {
    /// Binds `127.0.0.1:port` (0 for an ephemeral port) and starts accepting.
    pub async fn open(port: u16, ctx: ListenerContext) -> Result<Self, SupervisorError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .await
            .map_err(SupervisorError::Socket)?;
        let port = listener
            .local_addr()
            .map_err(SupervisorError::Socket)?
            .port();
        info!(port, "socket listener bound");
        let accept_task = tokio::spawn(accept_loop(listener, port, ctx));
        Ok(Self { port, accept_task })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stops accepting and drops every open client connection.
    ///
    /// Reports `socketclosed`. A listener task that died by panicking is logged.
    pub async fn close(self, emitter: &Emitter, sinks: &Sinks) {
        self.accept_task.abort();
        match self.accept_task.await {
            Err(e) if e.is_panic() => {
                sinks.errlog.error(&format!("Socket listener on port {} failed: {}", self.port, e));
            }
            _ => {}
        }
        emitter.emit(Event::SocketClosed(self.port));
        sinks.syslog.info(&format!("Socket communication closed on port {}.", self.port));
    }
}

async fn accept_loop(listener: TcpListener, port: u16, ctx: ListenerContext) {
    // Dropping the set (task abort) drops every client connection with it.
    let mut clients = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    ctx.emitter.emit(Event::SocketConnect(peer));
                    ctx.sinks.syslog.info(&format!("Client connected via socket on port {port}"));
                    clients.spawn(serve_client(stream, peer, port, ctx.clone()));
                }
                Err(e) => {
                    ctx.emitter.emit(Event::SocketError(e.to_string()));
                    ctx.sinks.errlog.error(&e.to_string());
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            Some(_) = clients.join_next(), if !clients.is_empty() => {}
        }
    }
}

async fn serve_client(mut stream: TcpStream, peer: SocketAddr, port: u16, ctx: ListenerContext) {
    let mut buf = vec![0u8; 8 * 1024];
    loop {
        let read = match ctx.idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, stream.read(&mut buf)).await {
                Ok(read) => read,
                Err(_) => {
                    ctx.emitter.emit(Event::SocketTimeout(port));
                    ctx.sinks.errlog.info(&format!("Socket connection timed out on port {port}."));
                    return;
                }
            },
            None => stream.read(&mut buf).await,
        };
        match read {
            Ok(0) => {
                debug!(%peer, "socket client disconnected");
                return;
            }
            Ok(n) => {
                if let Some(on_data) = &ctx.on_data {
                    let data = &buf[..n];
                    ctx.emitter.emit(Event::SocketData(data.to_vec()));
                    on_data(data, &ctx.handle);
                }
            }
            Err(e) => {
                ctx.emitter.emit(Event::SocketError(e.to_string()));
                ctx.sinks.errlog.error(&e.to_string());
                return;
            }
        }
    }
}
