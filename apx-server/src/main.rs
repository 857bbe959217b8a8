// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! APX Server
//!
//! Standalone routing server: accepts node connections over TCP (and,
//! optionally, a Unix domain socket) and matches provide/require ports
//! across them per their derived data signatures.
//!
//! # Usage
//!
//! ```bash
//! apx_server server.json
//! ```

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

mod config;

use apx::{ConnectionId, FrameReader, OutboundHandle, ServerConnectionHandler, ServerCore};
use config::ServerConfig;

/// APX Server - routes signals between producer and consumer nodes
#[derive(Parser, Debug)]
#[command(name = "apx_server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the JSON configuration file
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match ServerConfig::from_file(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("apx_server: configuration error: {err}");
            return ExitCode::from(1);
        }
    };

    init_logging(&args.log_level, &config);

    info!("+----------------------------------------------------+");
    info!("|              APX Server v{}                    |", env!("CARGO_PKG_VERSION"));
    info!("+----------------------------------------------------+");
    info!(tcp_port = config.extension.socket_server.tcp_port, "starting");

    let core = Arc::new(ServerCore::new());

    let (gc_stop_tx, gc_stop_rx) = crossbeam_channel::unbounded();
    let gc_core = Arc::clone(&core);
    let gc_handle = apx::spawn_gc_thread(Duration::from_secs(5), move || gc_core.gc_tick(), gc_stop_rx);

    if config.extension.monitor.extension_enabled {
        info!("monitor extension enabled");
    }

    let tcp_addr = format!("0.0.0.0:{}", config.extension.socket_server.tcp_port);
    let tcp_listener = match TcpListener::bind(&tcp_addr) {
        Ok(listener) => listener,
        Err(err) => {
            error!(%err, addr = %tcp_addr, "failed to bind tcp listener");
            let _ = gc_stop_tx.send(());
            return ExitCode::from(1);
        }
    };
    info!(addr = %tcp_addr, "listening");

    let accept_core = Arc::clone(&core);
    std::thread::spawn(move || accept_tcp_loop(tcp_listener, accept_core));

    #[cfg(unix)]
    if let Some(unix_path) = config.extension.socket_server.unix_file.clone() {
        let unix_core = Arc::clone(&core);
        match std::os::unix::net::UnixListener::bind(&unix_path) {
            Ok(listener) => {
                info!(path = %unix_path, "listening on unix socket");
                std::thread::spawn(move || accept_unix_loop(listener, unix_core));
            }
            Err(err) => {
                warn!(%err, path = %unix_path, "failed to bind unix socket, continuing without it");
            }
        }
    }

    if let Some(secs) = config.server.shutdown_timer {
        info!(secs, "shutdown timer armed");
        std::thread::sleep(Duration::from_secs(secs));
        info!("shutdown timer elapsed, stopping");
        let _ = gc_stop_tx.send(());
        let _ = gc_handle.join();
        return ExitCode::from(0);
    }

    // No shutdown timer: run until the process is killed. The listener
    // threads own the accept loops and never return on their own.
    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}

fn init_logging(log_level: &str, config: &ServerConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    let stdout_layer = tracing_subscriber::fmt::layer().with_target(true);

    let file_layer = if config.extension.textlog.extension_enabled && config.extension.textlog.file_enabled {
        config.extension.textlog.file_path.as_ref().and_then(|path| match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(tracing_subscriber::fmt::layer().with_writer(std::sync::Mutex::new(file)).with_ansi(false)),
            Err(err) => {
                eprintln!("apx_server: textlog extension failed to open {path}: {err}, continuing without it");
                None
            }
        })
    } else {
        None
    };

    tracing_subscriber::registry().with(filter).with(stdout_layer).with(file_layer).init();
}

fn accept_tcp_loop(listener: TcpListener, core: Arc<ServerCore>) {
    for incoming in listener.incoming() {
        match incoming {
            Ok(stream) => {
                let core = Arc::clone(&core);
                std::thread::spawn(move || serve_tcp_connection(stream, core));
            }
            Err(err) => {
                warn!(%err, "failed to accept tcp connection");
            }
        }
    }
}

#[cfg(unix)]
fn accept_unix_loop(listener: std::os::unix::net::UnixListener, core: Arc<ServerCore>) {
    for incoming in listener.incoming() {
        match incoming {
            Ok(stream) => {
                let core = Arc::clone(&core);
                std::thread::spawn(move || serve_unix_connection(stream, core));
            }
            Err(err) => {
                warn!(%err, "failed to accept unix connection");
            }
        }
    }
}

/// Per-connection transport thread: reads raw bytes off the socket and
/// feeds them to the protocol handler, writing its outbound channel back
/// to the same socket from a second thread. Grounded on
/// `hdds-discovery-server/src/server/relay.rs`'s one-task-per-connection
/// pattern, reworked from a tokio task pair to blocking `std::thread`s.
fn serve_tcp_connection(stream: TcpStream, core: Arc<ServerCore>) {
    let write_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(err) => {
            warn!(%err, "failed to clone tcp stream, dropping connection");
            return;
        }
    };
    let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_else(|_| "unknown".into());
    run_connection(stream, write_stream, core, &peer);
}

#[cfg(unix)]
fn serve_unix_connection(stream: std::os::unix::net::UnixStream, core: Arc<ServerCore>) {
    let write_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(err) => {
            warn!(%err, "failed to clone unix stream, dropping connection");
            return;
        }
    };
    run_connection(stream, write_stream, core, "unix");
}

fn run_connection<R, W>(mut reader: R, mut writer: W, core: Arc<ServerCore>, peer: &str)
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    let (tx, rx) = crossbeam_channel::unbounded::<Vec<u8>>();
    let connection_id: ConnectionId = core.add_connection(OutboundHandle::new(tx));
    info!(connection_id, peer, "connection accepted");

    let writer_handle = std::thread::spawn(move || {
        for frame in rx {
            if writer.write_all(&frame).is_err() {
                break;
            }
        }
    });

    let mut handler = ServerConnectionHandler::new(Arc::clone(&core), connection_id);
    let mut frame_reader = FrameReader::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                warn!(connection_id, %err, "read error, closing connection");
                break;
            }
        };
        frame_reader.push(&buf[..n]);
        loop {
            match frame_reader.try_next_frame() {
                Ok(Some(body)) => {
                    if let Err(err) = handler.handle_frame_body(&body) {
                        error!(connection_id, %err, "protocol error, closing connection");
                        let _ = core.remove_connection(connection_id);
                        let _ = writer_handle.join();
                        return;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    error!(connection_id, %err, "malformed frame, closing connection");
                    let _ = core.remove_connection(connection_id);
                    drop(writer_handle);
                    return;
                }
            }
        }
    }

    info!(connection_id, "connection closed");
    let _ = core.remove_connection(connection_id);
    let _ = writer_handle.join();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn run_connection_registers_and_removes_on_eof() {
        let core = Arc::new(ServerCore::new());
        let reader = Cursor::new(Vec::new());
        let writer = Vec::new();
        run_connection(reader, writer, Arc::clone(&core), "test");
        assert_eq!(core.connection_count(), 0);
    }

    #[test]
    fn run_connection_completes_greeting_and_writes_reply() {
        let core = Arc::new(ServerCore::new());
        let body = apx::frame_for_wire(b"RMFP/1.0\n\n");
        let reader = Cursor::new(body);
        let writer = Arc::new(std::sync::Mutex::new(Vec::new()));
        let writer_clone = SharedVecWriter(Arc::clone(&writer));
        run_connection(reader, writer_clone, Arc::clone(&core), "test");
        assert!(!writer.lock().unwrap().is_empty());
    }

    struct SharedVecWriter(Arc<std::sync::Mutex<Vec<u8>>>);

    impl Write for SharedVecWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
