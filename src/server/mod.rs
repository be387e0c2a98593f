// Copyright PingCAP Inc. 2025.
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; version 2 of the License.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! TCP serving: one acceptor, one freshly spawned worker thread per
//! connection, each running read-parse-verify-handle-respond to completion.
//!
//! Shutdown is cooperative: SIGINT/SIGTERM set a flag (registered without
//! SA_RESTART so a blocking `accept` returns EINTR), the accept loop exits,
//! the listener closes, and the process lingers briefly so in-flight workers
//! can drain.

use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::auth::{verify_presigned, AuthError};
use crate::buffer::{BufferPool, Msg};
use crate::config::Config;
use crate::handler::handle_request;
use crate::http::{parse_request, read_request, HttpError};
use crate::meta::MetaStore;
use crate::response::write_error;

const DRAIN_WAIT: Duration = Duration::from_secs(5);

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

/// Register SIGINT/SIGTERM to trip the global shutdown flag. No SA_RESTART:
/// the accept call must come back with EINTR so the loop can observe the
/// flag.
pub fn install_signal_handlers() {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        sa.sa_flags = 0;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
        libc::sigaction(libc::SIGTERM, &sa, std::ptr::null_mut());
    }
}

pub fn shutdown_flag() -> &'static AtomicBool {
    &SHUTDOWN
}

pub struct Server {
    listener: TcpListener,
    cfg: Arc<Config>,
    store: Arc<MetaStore>,
    pool: BufferPool,
}

impl Server {
    pub fn bind(cfg: Arc<Config>, store: Arc<MetaStore>, pool: BufferPool) -> std::io::Result<Self> {
        let listener = TcpListener::bind((cfg.listen_addr.as_str(), cfg.listen_port))?;
        Ok(Self {
            listener,
            cfg,
            store,
            pool,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until `shutdown` goes true, spawning a detached worker per
    /// connection. Returns once the listener has closed.
    pub fn run(self, shutdown: &'static AtomicBool) {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    tracing::debug!(%peer, "connection accepted");
                    let cfg = self.cfg.clone();
                    let store = self.store.clone();
                    let pool = self.pool.clone();
                    thread::spawn(move || {
                        handle_connection(stream, &cfg, &store, &pool);
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }
        drop(self.listener);
        tracing::info!("shutting down: accept stopped, draining in-flight requests");
        thread::sleep(DRAIN_WAIT);
    }
}

/// One request per connection: frame, parse, verify, handle, respond, close.
pub fn handle_connection(
    mut stream: TcpStream,
    cfg: &Config,
    store: &MetaStore,
    pool: &BufferPool,
) {
    let _ = stream.set_nodelay(true);

    let mut req_msg = Msg::new();
    let framed = match read_request(&mut stream, pool, &mut req_msg) {
        Ok(framed) => framed,
        Err(HttpError::ConnectionClosed) => return,
        Err(HttpError::PoolExhausted) => {
            respond_error(&mut stream, pool, 503, "ServiceUnavailable", "Buffer pool exhausted");
            return;
        }
        Err(HttpError::Io(e)) => {
            tracing::debug!(error = %e, "request read failed");
            return;
        }
        Err(e) => {
            tracing::debug!(error = %e, "rejecting unframeable request");
            respond_error(&mut stream, pool, 400, "BadRequest", "Invalid request");
            return;
        }
    };

    let req = match parse_request(&req_msg) {
        Ok(req) => req,
        Err(e) => {
            tracing::debug!(error = %e, "rejecting unparseable request");
            respond_error(&mut stream, pool, 400, "BadRequest", "Invalid request");
            return;
        }
    };
    tracing::info!(
        method = %req.method,
        path = %req.path,
        content_length = framed.content_length,
        "request"
    );

    let ctx = match verify_presigned(&req, cfg, store) {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::info!(path = %req.path, reason = %e, "access denied");
            let message = match e {
                AuthError::Expired => "Request has expired",
                _ => "Signature does not match",
            };
            respond_error(&mut stream, pool, 403, "AccessDenied", message);
            return;
        }
    };

    // The body, when present, is re-exposed as zero-copy slices of the
    // already-framed request bytes.
    let mut body_msg = Msg::new();
    let body = if framed.content_length > 0 {
        body_msg.append_view(&req_msg, framed.header_len, framed.content_length as usize);
        Some(&body_msg)
    } else {
        None
    };

    let mut out = Msg::new();
    if !handle_request(&req, body, &ctx, cfg, store, pool, &mut out) {
        out.clear();
        if !write_error(&mut out, pool, 503, "ServiceUnavailable", "Buffer pool exhausted") {
            return;
        }
    }
    if let Err(e) = write_msg(&mut stream, &out) {
        tracing::debug!(error = %e, "response write failed");
    }
}

fn respond_error(stream: &mut TcpStream, pool: &BufferPool, status: u16, code: &str, message: &str) {
    let mut out = Msg::new();
    if write_error(&mut out, pool, status, code, message) {
        let _ = write_msg(stream, &out);
    }
}

/// Vectored write of the whole message, resuming after partial writes.
fn write_msg(stream: &mut TcpStream, msg: &Msg) -> std::io::Result<()> {
    let total = msg.total_length();
    let mut written = 0;
    while written < total {
        let slices = msg.io_slices_from(written, 64);
        let n = stream.write_vectored(&slices)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "socket write returned zero",
            ));
        }
        written += n;
    }
    stream.flush()
}
