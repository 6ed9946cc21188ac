//! `cadenced` — the control-endpoint and orchestrator process.
//!
//! Spawns the player worker over a socketpair, binds the control socket,
//! and runs a single poll-based event loop shared by both links.

mod cli;
mod control;
mod daemon;
mod orchestrator;
mod player_link;
mod track_open;

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use tracing_subscriber::EnvFilter;

use cadence_core::config::{self, Config};
use cadence_core::event_loop::{EventCore, IoToken, Readiness};
use cadence_core::persist;
use cadence_core::{Playlist, Slab};
use cadence_proto::{Connection, MessageType};

use crate::control::{AcceptOutcome, ConnectionRecord, ListenerState};
use crate::daemon::{Daemon, DispatchOutcome};
use crate::player_link::SocketPlayerLink;

/// How long main waits for buffered output to drain before giving up on
/// a clean shutdown.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(2);

fn main() -> Result<()> {
    let args = cli::Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,cadenced=info")))
        .init();

    match run(args) {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::error!("{e:#}");
            std::process::exit(1);
        }
    }
}

fn run(args: cli::Args) -> Result<()> {
    let config = match args.config.as_ref() {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let socket_path = args.socket.clone().unwrap_or_else(config::socket_path);
    let persist_enabled = !args.no_persist && config.persist_playlist;
    let snapshot_path = config::snapshot_path();
    let player_bin = args.player_bin.clone().unwrap_or_else(default_player_bin);

    tracing::info!(socket = %socket_path.display(), player_bin = %player_bin.display(), "starting cadenced");

    // SIGPIPE's default action would kill the process the first time a
    // peer disappears mid-write; every write already checks the Result.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let listener = control::bind_control_socket(&socket_path).context("bind control socket")?;
    let mut events = EventCore::new().context("create event core")?;
    let listener_token = events.register(listener.as_raw_fd(), true, false)?;
    let mut listener_state = ListenerState::Listening(listener_token);

    // `Signals` owns a self-pipe and exposes its read end via `AsRawFd`,
    // so it slots into the same raw-fd registration path as every other
    // source the event core tracks (no separate `mio::event::Source` path
    // needed).
    let signals = signal_hook::iterator::Signals::new([SIGTERM, SIGINT, SIGHUP])
        .context("register signal handlers")?;
    let signals_token = events.register(signals.as_raw_fd(), true, false)?;

    let device = args.device.clone().or_else(|| config.audio_device.clone());

    let (player_conn, mut child) = spawn_player(&player_bin, device.as_deref()).context("spawn player worker")?;
    let mut player_token = events.register(player_conn.as_raw_fd(), true, false)?;
    let mut player = SocketPlayerLink::new(player_conn);
    let mut worker_restarts = 0u32;

    let playlist = if persist_enabled && snapshot_path.exists() {
        persist::load(&snapshot_path).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load playlist snapshot, starting empty");
            Playlist::new()
        })
    } else {
        Playlist::new()
    };

    let mut daemon = Daemon::new(orchestrator::Orchestrator::from_playlist(playlist));
    let mut readiness = Vec::new();
    let mut shutdown_requested = false;

    loop {
        if shutdown_requested {
            break;
        }

        events.poll(&mut readiness).context("poll event core")?;

        for event in &readiness {
            match *event {
                Readiness::Io { token, .. } if token == signals_token => {
                    for sig in signals.pending() {
                        match sig {
                            SIGTERM | SIGINT => {
                                tracing::info!(signal = sig, "shutdown requested");
                                shutdown_requested = true;
                            }
                            SIGHUP => {
                                tracing::info!("SIGHUP received, reloading config");
                                if let Some(path) = args.config.as_ref() {
                                    match Config::load(path) {
                                        Ok(_) => tracing::info!("config reloaded"),
                                        Err(e) => tracing::warn!(error = %e, "config reload failed"),
                                    }
                                }
                            }
                            other => tracing::debug!(signal = other, "ignoring signal"),
                        }
                    }
                }
                Readiness::Io { token, readable, .. } if matches!(listener_state, ListenerState::Listening(t) if t == token) => {
                    if readable {
                        accept_new_connections(&listener, &mut events, &mut listener_state, &mut daemon);
                    }
                }
                Readiness::Timer(timer) => {
                    if let ListenerState::Paused { timer: pending } = listener_state {
                        if pending == timer {
                            match control::resume_listening(&listener, &mut events) {
                                Ok(token) => listener_state = ListenerState::Listening(token),
                                Err(e) => tracing::warn!(error = %e, "failed to resume listener"),
                            }
                        }
                    }
                }
                Readiness::Io { token, readable, writable } if token == player_token => {
                    if writable {
                        sync_player_write_interest(&mut player, player_token, &mut events);
                    }
                    if readable
                        && !drain_player_reports(&mut player, player_token, &mut daemon, &mut events)
                    {
                        // Audio-device errors are fatal to the player
                        // process; main restarts the worker and resumes
                        // from the next track.
                        let _ = events.deregister(player.connection_mut().as_raw_fd());
                        let _ = child.kill();
                        let _ = child.wait();

                        match spawn_player(&player_bin, device.as_deref()) {
                            Ok((conn, new_child)) => {
                                worker_restarts += 1;
                                tracing::warn!(restarts = worker_restarts, "player worker died, restarted");
                                player_token = events.register(conn.as_raw_fd(), true, false)?;
                                player = SocketPlayerLink::new(conn);
                                child = new_child;
                                let recovered = daemon.orchestrator.on_track_end(
                                    cadence_proto::message::Outcome::Error,
                                    &mut player,
                                );
                                daemon.broadcast(&recovered);
                                sync_player_write_interest(&mut player, player_token, &mut events);
                                sync_connections_write_interest(&mut daemon, &mut events);
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "unable to restart player worker");
                                std::process::exit(2);
                            }
                        }
                    }
                }
                Readiness::Io { token, readable, writable } => {
                    handle_connection_io(
                        token,
                        readable,
                        writable,
                        &mut daemon,
                        &mut events,
                        &mut player,
                        player_token,
                    );
                }
            }
        }
    }

    shutdown(&mut daemon, &mut player, &mut child, persist_enabled, &snapshot_path, &socket_path);
    Ok(())
}

/// Drain as much of a connection's output buffer as the socket accepts
/// right now, then bring its registered interest in line with whether
/// anything is still queued: writable is only ever requested once
/// `flush` reports it would block, and dropped again the moment the
/// buffer empties out.
fn sync_write_interest(conn: &mut Connection, token: IoToken, events: &mut EventCore) {
    if !conn.has_pending_output() {
        return;
    }
    conn.flush();
    let still_pending = conn.has_pending_output();
    if let Err(e) = events.reregister(conn.as_raw_fd(), token, true, still_pending) {
        tracing::warn!(error = %e, "failed to reregister connection for writability");
    }
}

fn sync_player_write_interest(player: &mut SocketPlayerLink, token: IoToken, events: &mut EventCore) {
    sync_write_interest(player.connection_mut(), token, events);
}

/// After a dispatch may have composed a direct reply or a `MonitorEvent`
/// broadcast on any number of client connections, sweep the table and
/// drain/re-arm writability for whichever of them actually picked up
/// buffered output. Connections with nothing queued are a cheap no-op
/// check, not a flush.
fn sync_connections_write_interest(daemon: &mut Daemon, events: &mut EventCore) {
    for (_, record) in daemon.connections.iter_mut() {
        sync_write_interest(&mut record.conn, record.io_token, events);
    }
}

fn accept_new_connections(
    listener: &std::os::unix::net::UnixListener,
    events: &mut EventCore,
    listener_state: &mut ListenerState,
    daemon: &mut Daemon,
) {
    loop {
        match control::accept_or_pause(listener, events) {
            Ok(AcceptOutcome::Accepted(stream)) => {
                let conn = match Connection::new(stream) {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to wrap accepted connection");
                        continue;
                    }
                };
                let fd = conn.as_raw_fd();
                let io_token = match events.register(fd, true, false) {
                    Ok(token) => token,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to register connection fd");
                        continue;
                    }
                };
                let key = daemon.connections.insert(ConnectionRecord { conn, monitor: false, io_token });
                daemon.tokens.insert(io_token, key);
            }
            Ok(AcceptOutcome::Idle) => break,
            Ok(AcceptOutcome::Paused(timer)) => {
                *listener_state = ListenerState::Paused { timer };
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept error");
                break;
            }
        }
    }
}

fn handle_connection_io(
    token: IoToken,
    readable: bool,
    writable: bool,
    daemon: &mut Daemon,
    events: &mut EventCore,
    player: &mut SocketPlayerLink,
    player_token: IoToken,
) {
    let key = match daemon.tokens.get(token) {
        Some(k) => k,
        None => return,
    };

    if writable {
        if let Some(record) = daemon.connections.get_mut(key) {
            sync_write_interest(&mut record.conn, token, events);
        }
    }

    if readable {
        let mut close = false;
        loop {
            let frame = match daemon.connections.get_mut(key) {
                Some(record) => record.conn.read_one(),
                None => break,
            };
            match frame {
                Ok(Some(frame)) => {
                    let outcome = daemon.dispatch(key, frame, player);
                    // A dispatched command may have composed a direct
                    // reply on this connection, a monitor broadcast on
                    // any number of others, and/or a command to the
                    // player link; drain and re-arm writability for all
                    // three before deciding what to do next.
                    sync_player_write_interest(player, player_token, events);
                    sync_connections_write_interest(daemon, events);
                    match outcome {
                        Ok(DispatchOutcome::Continue) => {}
                        Ok(DispatchOutcome::Close) => {
                            close = true;
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "protocol error, closing connection");
                            close = true;
                            break;
                        }
                    }
                }
                Ok(None) => {
                    if let Some(record) = daemon.connections.get(key) {
                        if record.conn.is_eof() {
                            close = true;
                        }
                    }
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "connection read error, closing");
                    close = true;
                    break;
                }
            }
        }

        if close {
            let _ = events.deregister(
                daemon.connections.get(key).map(|r| r.conn.as_raw_fd()).unwrap_or(-1),
            );
            daemon.close_connection(key);
        }
    }
}

/// Drain every currently buffered frame from the player link. Returns
/// `false` once the link is found to be closed (worker crashed or exited),
/// signaling the caller that the worker needs to be restarted.
fn drain_player_reports(
    player: &mut SocketPlayerLink,
    player_token: IoToken,
    daemon: &mut Daemon,
    events: &mut EventCore,
) -> bool {
    loop {
        match player.connection_mut().read_one() {
            Ok(Some(frame)) => {
                if !matches!(
                    frame.kind,
                    MessageType::TrackStarted | MessageType::PositionUpdate | MessageType::TrackEnded
                ) {
                    tracing::warn!(kind = ?frame.kind, "unexpected frame from player worker");
                    continue;
                }
                let key = cadence_core::ConnKey { index: 0, generation: 0 };
                if let Err(e) = daemon.dispatch(key, frame, player) {
                    tracing::warn!(error = %e, "error handling player report");
                }
                // A player report can itself trigger the orchestrator to
                // start the next track (another command to the player
                // link) and broadcast a MonitorEvent to clients.
                sync_player_write_interest(player, player_token, events);
                sync_connections_write_interest(daemon, events);
            }
            Ok(None) => {
                return !player.connection_mut().is_eof();
            }
            Err(e) => {
                tracing::error!(error = %e, "player link error");
                return false;
            }
        }
    }
}

/// Drain `conn`'s output buffer within `SHUTDOWN_DRAIN`, giving up early
/// once the peer closes or the socket accepts no more right now.
fn drain_with_deadline(conn: &mut Connection) {
    let deadline = std::time::Instant::now() + SHUTDOWN_DRAIN;
    while std::time::Instant::now() < deadline {
        let progress = conn.flush();
        if progress.closed || !progress.would_block {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn shutdown(
    daemon: &mut Daemon,
    player: &mut SocketPlayerLink,
    child: &mut Child,
    persist_enabled: bool,
    snapshot_path: &std::path::Path,
    socket_path: &std::path::Path,
) {
    tracing::info!("shutting down");
    player.connection_mut().compose(MessageType::Stop, 0, None, &[]);
    drain_with_deadline(player.connection_mut());

    for (_, record) in daemon.connections.iter_mut() {
        drain_with_deadline(&mut record.conn);
    }
    // Every record's `UnixStream` closes on drop.
    daemon.connections = Slab::new();

    if persist_enabled {
        if let Err(e) = persist::save(daemon.orchestrator.playlist(), snapshot_path) {
            tracing::warn!(error = %e, "failed to persist playlist snapshot");
        }
    }

    let _ = child.kill();
    let _ = child.wait();

    match std::fs::remove_file(socket_path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(error = %e, "failed to remove control socket file"),
    }
}

fn default_player_bin() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|dir| dir.join("cadence-playerd")))
        .unwrap_or_else(|| PathBuf::from("cadence-playerd"))
}

/// Create a connected socketpair, spawn the player worker with one end
/// inherited as fd 3, and wrap our end in a `Connection`.
fn spawn_player(player_bin: &std::path::Path, device: Option<&str>) -> Result<(Connection, Child)> {
    let mut fds: [RawFd; 2] = [-1, -1];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    if rc != 0 {
        return Err(io::Error::last_os_error()).context("socketpair");
    }
    let (main_fd, worker_fd) = (fds[0], fds[1]);
    // Closed across the worker's exec below; otherwise the forked child
    // would inherit a second, unwanted handle onto our end of the pair.
    unsafe {
        let flags = libc::fcntl(main_fd, libc::F_GETFD);
        libc::fcntl(main_fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
    }

    let mut cmd = Command::new(player_bin);
    if let Some(device) = device {
        cmd.arg("--device").arg(device);
    }
    cmd.arg("--link-fd").arg("3");

    // Safety: between fork and exec only async-signal-safe calls run.
    // dup2 onto fd 3 and clear CLOEXEC so the worker inherits its end;
    // the parent's copy of `worker_fd` is closed right after spawning.
    unsafe {
        cmd.pre_exec(move || {
            if libc::dup2(worker_fd, 3) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = cmd.spawn().context("spawn player worker process")?;
    unsafe {
        libc::close(worker_fd);
    }

    let main_stream = unsafe { UnixStream::from(OwnedFd::from_raw_fd(main_fd)) };
    let conn = Connection::new(main_stream).context("wrap player link")?;
    Ok((conn, child))
}
