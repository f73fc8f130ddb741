// Copyright (c) 2022 Lev Kokotov <hi@levthe.dev>
// Copyright (c) 2023 Dmitriy Vasiliev <dmitrivasilyev@ozon.ru>

// Permission is hereby granted, free of charge, to any person obtaining
// a copy of this software and associated documentation files (the
// "Software"), to deal in the Software without restriction, including
// without limitation the rights to use, copy, modify, merge, publish,
// distribute, sublicense, and/or sell copies of the Software, and to
// permit persons to whom the Software is furnished to do so, subject to
// the following conditions:

// The above copyright notice and this permission notice shall be
// included in all copies or substantial portions of the Software.

// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND,
// EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF
// MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND
// NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS BE
// LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER IN AN ACTION
// OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN CONNECTION
// WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use log::{debug, error, info, warn};
use once_cell::sync::Lazy;
use std::io::{self, IsTerminal};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpSocket;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::broadcast;
use tokio::{runtime::Builder, sync::mpsc};

extern crate exitcode;

use pg_router::admin::Console;
use pg_router::client::ClientContext;
use pg_router::config::{get_config, reload_config, VERSION};
use pg_router::format_duration;
use pg_router::messages::configure_tcp_socket;
use pg_router::pool::retain_connections;
use pg_router::stats::Collector;
use pg_router::tls::build_acceptor;
use pg_router::{cmd_args, logger};

pub static CURRENT_CLIENT_COUNT: Lazy<Arc<AtomicI64>> = Lazy::new(|| Arc::new(AtomicI64::new(0)));

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = cmd_args::parse();

    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    // Create a transient runtime for loading the config for the first time.
    {
        let runtime = Builder::new_multi_thread().worker_threads(1).enable_all().build()?;

        runtime.block_on(async {
            if let Err(err) = pg_router::config::parse(args.config_file.as_str()).await {
                if io::stdin().is_terminal() {
                    eprintln!("Config parse error: {err}");
                } else {
                    error!("Config parse error: {err:?}");
                }
                std::process::exit(exitcode::CONFIG);
            }
        });
    }

    let config = get_config();
    logger::init(&args, config.general.syslog_prog_name.clone());

    info!("Welcome to pg_router! (Version {VERSION})");

    // Create the runtime now we know required worker_threads.
    let runtime = Builder::new_multi_thread()
        .worker_threads(config.general.worker_threads)
        .enable_all()
        .thread_name("worker-pg-router")
        .build()?;

    runtime.block_on(async move {
        // starting listener.
        let addr: SocketAddr = match format!("{}:{}", config.general.host, config.general.port).parse() {
            Ok(addr) => addr,
            Err(err) => {
                error!("Invalid listen address: {err}");
                std::process::exit(exitcode::CONFIG);
            }
        };
        let listener = match listen(addr, config.general.backlog) {
            Ok(listener) => listener,
            Err(err) => {
                error!("Listener socket error: {err:?}");
                std::process::exit(exitcode::CONFIG);
            }
        };
        info!("Running on {addr}");

        config.show();

        Collector::default().collect(config.general.stats_period).await;

        let retain_interval = config.general.retain_connections_interval;
        tokio::task::spawn(async move {
            retain_connections(retain_interval).await;
        });

        let console = Console::start();

        let (mut term_signal, mut interrupt_signal, mut sighup_signal) = match (
            unix_signal(SignalKind::terminate()),
            unix_signal(SignalKind::interrupt()),
            unix_signal(SignalKind::hangup()),
        ) {
            (Ok(term), Ok(interrupt), Ok(hangup)) => (term, interrupt, hangup),
            _ => {
                error!("Failed to install signal handlers");
                std::process::exit(exitcode::OSERR);
            }
        };
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let (drain_tx, mut drain_rx) = mpsc::channel::<i32>(2048);
        let (exit_tx, mut exit_rx) = mpsc::channel::<()>(1);
        let mut admin_only = false;
        let mut total_clients = 0;

        // It is not updated by 'HUP'.
        let tls_acceptor: Option<tokio_native_tls::TlsAcceptor> =
            match (&config.general.tls_certificate, &config.general.tls_private_key) {
                (Some(certificate), Some(private_key)) => {
                    match build_acceptor(Path::new(certificate), Path::new(private_key)) {
                        Ok(acceptor) => Some(acceptor),
                        Err(err) => {
                            error!("Failed to build TLS acceptor: {err}");
                            std::process::exit(exitcode::CONFIG);
                        }
                    }
                }
                _ => None,
            };

        info!("Waiting for clients");
        loop {
            tokio::select! {

                // Reload config:
                // kill -SIGHUP $(pgrep pg_router)
                _ = sighup_signal.recv() => {
                    info!("Reloading config");
                    if reload_config().await.is_ok() {
                        get_config().show();
                    }
                },

                // Initiate graceful shutdown sequence on sig int
                // kill -SIGINT $(pgrep pg_router)
                _ = interrupt_signal.recv() => {
                    info!("Got SIGINT, starting graceful shutdown");

                    // Don't want this to happen more than once
                    if admin_only {
                        continue;
                    }

                    admin_only = true;

                    // Broadcast that client tasks need to finish
                    let _ = shutdown_tx.send(());
                    let exit_tx = exit_tx.clone();
                    let _ = drain_tx.send(0).await;
                    let shutdown_timeout = get_config().general.shutdown_timeout;

                    tokio::task::spawn(async move {
                        info!("waiting for {} client{}", total_clients, if total_clients == 1 { "" } else { "s" });

                        tokio::time::sleep(Duration::from_millis(shutdown_timeout)).await;

                        // We're done waiting.
                        error!("Graceful shutdown timed out, closing remaining clients");

                        let _ = exit_tx.send(()).await;
                    });
                },

                _ = term_signal.recv() => {
                    info!("Got SIGTERM, closing with {total_clients} clients active");
                    break;
                },

                // new client.
                new_client = listener.accept() => {
                    let (mut socket, addr) = match new_client {
                        Ok((socket, addr)) => (socket, addr),
                        Err(err) => {
                            error!("accept error: {err:?}");
                            continue;
                        }
                    };
                    if admin_only {
                        warn!("Refusing new client {addr} during shutdown");
                        let _ = socket.shutdown().await;
                        continue;
                    }
                    debug!("Client {addr} connected");
                    let context = ClientContext {
                        console: console.clone(),
                        drain: drain_tx.clone(),
                        admin_only,
                        tls_acceptor: tls_acceptor.clone(),
                    };
                    let shutdown_rx = shutdown_tx.subscribe();
                    let config = get_config();

                    let log_client_disconnections = config.general.log_client_disconnections;
                    let max_connections = config.general.max_connections;

                    configure_tcp_socket(&socket);
                    tokio::task::spawn(async move {
                        let current_clients = CURRENT_CLIENT_COUNT.fetch_add(1, Ordering::SeqCst);
                        // max clients.
                        if current_clients as u64 >= max_connections {
                            warn!("Client {addr:?}: too many clients already");
                            if let Err(err) = pg_router::client::client_entrypoint_too_many_clients_already(socket).await {
                                error!("Client {addr:?}: disconnected with error: {err}");
                            }
                            CURRENT_CLIENT_COUNT.fetch_add(-1, Ordering::SeqCst);
                            return;
                        }
                        let start = chrono::offset::Utc::now().naive_utc();

                        match pg_router::client::client_entrypoint(socket, context, shutdown_rx).await {
                            Ok(()) => {
                                let duration = chrono::offset::Utc::now().naive_utc() - start;

                                if log_client_disconnections {
                                    info!(
                                        "Client {:?} disconnected, session duration: {}",
                                        addr,
                                        format_duration(&duration)
                                    );
                                } else {
                                    debug!(
                                        "Client {:?} disconnected, session duration: {}",
                                        addr,
                                        format_duration(&duration)
                                    );
                                }
                            }

                            Err(err) => {
                                let duration = chrono::offset::Utc::now().naive_utc() - start;
                                warn!("Client {:?} disconnected with error {}, duration: {}", addr, err, format_duration(&duration));
                            }
                        };
                        CURRENT_CLIENT_COUNT.fetch_add(-1, Ordering::SeqCst);
                    });
                }

                _ = exit_rx.recv() => {
                    break;
                }

                client_ping = drain_rx.recv() => {
                    total_clients += client_ping.unwrap_or(0);

                    if total_clients == 0 && admin_only {
                        let _ = exit_tx.send(()).await;
                    }
                }

            }
        }
        info!("Shutting down...");
    });

    Ok(())
}

/// Bind the client listener.
fn listen(addr: SocketAddr, backlog: u32) -> io::Result<tokio::net::TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.set_nodelay(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}
