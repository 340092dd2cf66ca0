//! Server binary: binds the FIX acceptor, starts the worker pool, matching
//! engine and (optionally) the mock market-data feed, and runs the
//! Reactor event loop on the main thread until SIGINT/SIGTERM.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use clap::Parser;
use parking_lot::Mutex;
use tracing::{info, warn};

use fix_futures_gateway::config::Config;
use fix_futures_gateway::domain::account::AccountLedger;
use fix_futures_gateway::domain::instrument::{Instrument, InstrumentCatalog};
use fix_futures_gateway::domain::position::PositionLedger;
use fix_futures_gateway::fix::codec::Codec;
use fix_futures_gateway::fix::tags::{self, msg_type};
use fix_futures_gateway::gateway::TradeGateway;
use fix_futures_gateway::market_data::mock_feed::MockFeed;
use fix_futures_gateway::matching::engine::MatchingEngine;
use fix_futures_gateway::net::connection::Connection;
use fix_futures_gateway::net::reactor::Reactor;
use fix_futures_gateway::net::worker_pool::WorkerPool;
use fix_futures_gateway::persistence::port::PersistencePort;
use fix_futures_gateway::persistence::sqlite_store::SqliteStore;
use fix_futures_gateway::session::fsm::{BusinessOutcome, Session, SessionId};
use fix_futures_gateway::session::registry::SessionRegistry;
use fix_futures_gateway::timing::wheel::TimingWheel;

#[derive(Parser, Debug)]
#[command(name = "fix-gateway", about = "Simulated futures trading gateway")]
struct Args {
    /// Worker pool thread count (overrides the config file's server.worker_count).
    worker_threads: Option<usize>,
    /// TCP listen port (overrides the config file's server.port).
    port: Option<u16>,
    #[arg(long, default_value = "gateway.toml")]
    config: String,
    #[arg(long, default_value = "gateway.sqlite")]
    db_path: String,
    /// Starts the synthetic random-walk market-data feed.
    #[arg(long)]
    mock_feed: bool,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

static SHUTDOWN_PIPE_WRITE: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_shutdown_signal(_sig: libc::c_int) {
    let fd = SHUTDOWN_PIPE_WRITE.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte: u8 = 1;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    std::env::set_var("GATEWAY_CONFIG_PATH", &args.config);
    let mut config = Config::from_env();
    if let Some(n) = args.worker_threads {
        config.server.worker_count = n;
    }
    if let Some(p) = args.port {
        config.server.port = p;
    }

    if let Err(e) = run(args, config) {
        warn!(error = %e, "fatal startup error");
        std::process::exit(1);
    }
    std::process::exit(0);
}

fn run(args: Args, config: Config) -> anyhow::Result<()> {
    let own_comp_id = "GATEWAY".to_string();

    let account_ledger = Arc::new(AccountLedger::new());
    let position_ledger = Arc::new(PositionLedger::new());
    let instrument_catalog = Arc::new(InstrumentCatalog::new());
    instrument_catalog.load_from_config(default_instruments());

    let persistence: Arc<dyn PersistencePort> = Arc::new(SqliteStore::open(&args.db_path)?);
    let session_registry = Arc::new(SessionRegistry::new());
    let worker_pool = Arc::new(WorkerPool::new(config.server.worker_count.max(1)));

    // The matching engine's exec callback needs the gateway, and the
    // gateway's constructor needs the engine's order sender: break the
    // cycle with a slot the engine reads lazily after the gateway exists.
    let gateway_slot: Arc<Mutex<Option<Arc<TradeGateway>>>> = Arc::new(Mutex::new(None));
    let gateway_slot_for_engine = gateway_slot.clone();
    let engine = MatchingEngine::new(
        account_ledger.clone(),
        position_ledger.clone(),
        instrument_catalog.clone(),
        Box::new(move |session_id, report| {
            let gateway = gateway_slot_for_engine.lock().clone();
            if let Some(gateway) = gateway {
                gateway.on_execution_report(session_id, report);
            }
        }),
    );
    engine.start();

    let gateway = Arc::new(TradeGateway::new(
        own_comp_id.clone(),
        1_000_000.0,
        account_ledger.clone(),
        position_ledger.clone(),
        instrument_catalog.clone(),
        session_registry.clone(),
        persistence.clone(),
        engine.order_sender(),
        worker_pool.clone(),
    ));
    *gateway_slot.lock() = Some(gateway.clone());

    let mock_feed = if args.mock_feed {
        let (md_tx, md_rx) = crossbeam::channel::unbounded();
        let feed = MockFeed::new(md_tx);
        for instrument in instrument_catalog.search_prefix("", 1000) {
            feed.subscribe(&instrument.instrument_id);
        }
        feed.start();

        let engine_md_tx = engine.market_data_sender();
        let gateway_for_md = gateway.clone();
        let catalog_for_md = instrument_catalog.clone();
        std::thread::Builder::new()
            .name("md-forwarder".into())
            .spawn(move || {
                while let Ok(snapshot) = md_rx.recv() {
                    let volume_multiple = catalog_for_md
                        .get_instrument(&snapshot.instrument_id)
                        .map(|i| i.volume_multiple)
                        .unwrap_or(1);
                    gateway_for_md.on_market_data(&snapshot, volume_multiple);
                    if engine_md_tx.send(snapshot).is_err() {
                        break;
                    }
                }
            })?;
        Some(feed)
    } else {
        None
    };

    let reactor = Reactor::new()?;
    let reactor_handle = reactor.handle();

    let wheel = Arc::new(TimingWheel::new(config.timing_wheel.slots, config.timing_wheel.tick_interval_ms));
    {
        let gateway = gateway.clone();
        let heart_bt = config.client.default_heart_bt_int;
        wheel.add_periodic_task(1000, move || {
            gateway.tick_sessions_heartbeats(heart_bt, now_millis());
        });
    }
    {
        let wheel = wheel.clone();
        reactor_handle.add_timer(config.timing_wheel.tick_interval_ms, Box::new(move |_fd| {
            wheel.tick();
        }));
    }

    let (pipe_read, pipe_write) = make_self_pipe()?;
    SHUTDOWN_PIPE_WRITE.store(pipe_write, Ordering::SeqCst);
    unsafe {
        libc::signal(libc::SIGINT, on_shutdown_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_shutdown_signal as libc::sighandler_t);
    }
    {
        let reactor_handle = reactor_handle.clone();
        reactor_handle.clone().add_fd(
            pipe_read,
            Box::new(move |fd| {
                let mut buf = [0u8; 8];
                unsafe {
                    libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len());
                }
                info!("shutdown signal received");
                reactor_handle.stop();
            }),
        );
    }

    let listen_fd = bind_listener(config.server.port, config.server.listen_backlog)?;
    accept_loop(
        listen_fd,
        reactor_handle.clone(),
        worker_pool.clone(),
        session_registry.clone(),
        gateway.clone(),
        persistence.clone(),
        own_comp_id.clone(),
        config.protocol.max_buffer_size,
        config.protocol.max_body_length,
    );

    info!(port = config.server.port, workers = config.server.worker_count, "gateway listening");
    reactor.run();

    info!("shutting down");
    if let Some(feed) = &mock_feed {
        feed.stop();
    }
    engine.stop();
    unsafe {
        libc::close(listen_fd);
        libc::close(pipe_read);
        libc::close(pipe_write);
    }
    Ok(())
}

fn default_instruments() -> Vec<Instrument> {
    vec![Instrument::new("IF2401", "SIM", "IF", 0.2, 300, 0.12)]
}

fn make_self_pipe() -> anyhow::Result<(RawFd, RawFd)> {
    let mut fds: [RawFd; 2] = [-1, -1];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    for fd in fds {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        unsafe {
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
    Ok((fds[0], fds[1]))
}

fn bind_listener(port: u16, backlog: i32) -> anyhow::Result<RawFd> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let one: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );

        let mut addr: libc::sockaddr_in = std::mem::zeroed();
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = port.to_be();
        addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();

        let rc = libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        );
        if rc != 0 {
            libc::close(fd);
            return Err(std::io::Error::last_os_error().into());
        }
        if libc::listen(fd, backlog) != 0 {
            libc::close(fd);
            return Err(std::io::Error::last_os_error().into());
        }
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        Ok(fd)
    }
}

/// Registers the listening socket with the Reactor; each accepted
/// connection is handed a pinned worker (`fd mod N`) and an inbound-frame
/// dispatcher wired to the session FSM and the Trade Gateway.
#[allow(clippy::too_many_arguments)]
fn accept_loop(
    listen_fd: RawFd,
    reactor_handle: fix_futures_gateway::net::reactor::ReactorHandle,
    worker_pool: Arc<WorkerPool>,
    session_registry: Arc<SessionRegistry>,
    gateway: Arc<TradeGateway>,
    persistence: Arc<dyn PersistencePort>,
    own_comp_id: String,
    max_buffer_size: usize,
    max_body_length: usize,
) {
    reactor_handle.clone().add_fd(
        listen_fd,
        Box::new(move |fd| loop {
            let accepted = unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) };
            if accepted < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() != std::io::ErrorKind::WouldBlock {
                    warn!(error = %err, "accept failed");
                }
                return;
            }
            let thread_index = worker_pool.thread_for_fd(accepted);
            let conn = Connection::new(accepted, thread_index, reactor_handle.clone(), max_buffer_size, max_body_length);
            let session_slot: Arc<Mutex<Option<SessionId>>> = Arc::new(Mutex::new(None));

            let worker_pool_f = worker_pool.clone();
            let session_registry_f = session_registry.clone();
            let gateway_f = gateway.clone();
            let persistence_f = persistence.clone();
            let own_comp_id_f = own_comp_id.clone();
            let session_slot_f = session_slot.clone();
            let gateway_c = gateway.clone();
            let session_registry_c = session_registry.clone();
            let session_slot_c = session_slot.clone();

            conn.start(
                worker_pool.clone(),
                move |conn, frame| {
                    handle_inbound_frame(
                        conn,
                        frame,
                        &session_slot_f,
                        &own_comp_id_f,
                        &session_registry_f,
                        &gateway_f,
                        &worker_pool_f,
                        &persistence_f,
                    );
                },
                move |_conn, reason| {
                    debug_closed(reason);
                    if let Some(session_id) = session_slot_c.lock().clone() {
                        session_registry_c.unregister(&session_id);
                        gateway_c.unbind_connection(&session_id);
                    }
                },
            );
        }),
    );
}

fn debug_closed(reason: &str) {
    tracing::debug!(reason, "connection closed");
}

#[allow(clippy::too_many_arguments)]
fn handle_inbound_frame(
    conn: &Arc<Connection>,
    raw: Vec<u8>,
    session_slot: &Arc<Mutex<Option<SessionId>>>,
    own_comp_id: &str,
    session_registry: &Arc<SessionRegistry>,
    gateway: &Arc<TradeGateway>,
    worker_pool: &Arc<WorkerPool>,
    persistence: &Arc<dyn PersistencePort>,
) {
    let codec = Codec::new();
    let msg = match codec.decode(&raw) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "malformed frame");
            conn.close();
            return;
        }
    };
    let now = now_millis();
    let msg_type = msg.msg_type().unwrap_or("").to_string();

    let session_id = {
        let mut slot = session_slot.lock();
        match slot.clone() {
            Some(id) => id,
            None => {
                if msg_type != msg_type::LOGON {
                    warn!("first frame on a new connection was not Logon");
                    conn.close();
                    return;
                }
                let peer = msg.get_string_opt(tags::SENDER_COMP_ID).unwrap_or("UNKNOWN").to_string();
                let id = SessionId::new(own_comp_id, peer);
                *slot = Some(id.clone());
                id
            }
        }
    };

    let session = match session_registry.get(&session_id) {
        Some(s) => s,
        None => {
            let s = Arc::new(Session::new(session_id.clone(), now));
            if let Ok(Some(persisted)) =
                persistence.load_session_state(&session_id.sender_comp_id, &session_id.target_comp_id)
            {
                s.restore_persisted(&persisted);
            }
            session_registry.register(s.clone());
            s
        }
    };

    match msg_type.as_str() {
        msg_type::LOGON => match session.on_logon_received(&msg, now) {
            Ok(Some(mut ack)) => {
                gateway.bind_connection(session_id.clone(), conn.clone());
                gateway.on_logon_success(&session_id);
                conn.send(codec.encode(&mut ack), worker_pool);
            }
            Ok(None) => {
                gateway.bind_connection(session_id.clone(), conn.clone());
                gateway.on_logon_success(&session_id);
            }
            Err(e) => {
                warn!(error = %e, "logon rejected");
                conn.close();
            }
        },
        msg_type::HEARTBEAT => session.on_heartbeat_received(now),
        msg_type::TEST_REQUEST => {
            let mut hb = session.on_test_request_received(&msg, now);
            conn.send(codec.encode(&mut hb), worker_pool);
        }
        msg_type::LOGOUT => {
            let mut out = session.on_logout_received(now);
            conn.send(codec.encode(&mut out), worker_pool);
            session_registry.unregister(&session_id);
            gateway.unbind_connection(&session_id);
            conn.close();
        }
        _ => match session.on_business_message(msg, now) {
            BusinessOutcome::Deliver(messages) => {
                for delivered in &messages {
                    gateway.handle_business_message(&session_id, delivered);
                }
            }
            BusinessOutcome::ResendRequest(mut req) => {
                conn.send(codec.encode(&mut req), worker_pool);
            }
            BusinessOutcome::Shutdown(reason) => {
                warn!(reason, "session shutdown");
                session.force_disconnect();
                session_registry.unregister(&session_id);
                gateway.unbind_connection(&session_id);
                conn.close();
            }
        },
    }
}
