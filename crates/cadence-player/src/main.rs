//! `cadence-playerd` — the player worker process (§2, §4.5).
//!
//! Inherits one end of a privileged socketpair at a fixed fd (passed via
//! `--link-fd`), speaks the same framed protocol as the control endpoint,
//! and serves exactly one track at a time: `Play(fd)` hands over a fresh
//! file descriptor, the worker decodes/resamples/plays it in background
//! threads, and reports `TrackStarted`/`PositionUpdate`/`TrackEnded` back
//! over the link. The worker never touches a filesystem path (§4.5, §5,
//! "Privilege").

mod cli;
mod codec;
mod decode;
mod device;
mod playback;
mod queue;
mod resample;

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use cpal::traits::{HostTrait, StreamTrait};
use tracing_subscriber::EnvFilter;

use cadence_core::event_loop::{EventCore, Readiness};
use cadence_proto::message::{self, Outcome, SeekPayload};
use cadence_proto::{Connection, MessageType};

use crate::codec::Codec;

/// Queue depth target, per stage (§4.5 default, matching the decode and
/// resample stages' own defaults).
const BUFFER_SECONDS: f32 = 2.0;
/// Playback callback refill cap, in frames.
const REFILL_MAX_FRAMES: usize = 4096;
/// Resampler chunk size, in frames.
const RESAMPLE_CHUNK_FRAMES: usize = 1024;
/// Position reports fire at least once a second (§4.5); some headroom.
const POSITION_INTERVAL: Duration = Duration::from_millis(500);

fn main() -> Result<()> {
    let args = cli::Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,cadence_playerd=info")))
        .init();

    match run(args) {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::error!("{e:#}");
            std::process::exit(1);
        }
    }
}

/// One currently-playing (or paused) track's background pipeline state.
struct Session {
    /// Signals the decode thread's `should_stop?` predicate (§4.5).
    stop: Arc<AtomicBool>,
    /// Silences the playback callback without tearing down the pipeline.
    paused: Arc<AtomicBool>,
    /// The final queue the playback callback drains; `is_done()` plus an
    /// empty queue means the track has fully finished on its own.
    dstq: Arc<queue::SharedAudio>,
    stream: cpal::Stream,
    played_frames: Arc<AtomicU64>,
    /// Device sample rate this session's stream was negotiated at — the
    /// playback callback advances `played_frames` at this rate, so
    /// dividing by it gives elapsed wall-clock seconds directly.
    device_rate: u32,
    duration_secs: i64,
    /// A duplicate of the original fd `Play` handed over, retained so a
    /// later `Seek` can reopen the same underlying file (§4.4: a playlist
    /// fd is opened once by main and handed over; the worker never reopens
    /// a path itself, but it may re-decode the same fd from a new offset).
    master_fd: OwnedFd,
}

enum StartError {
    /// Decode/probe/container failure — not fatal to the process, just
    /// this track (§7, "Codec errors").
    Track(anyhow::Error),
    /// Device negotiation or stream construction failed — fatal to the
    /// playback session; the worker process exits non-zero (§7, "Audio-
    /// device errors").
    Device(anyhow::Error),
}

fn run(args: cli::Args) -> Result<()> {
    let stream = unsafe { UnixStream::from_raw_fd(args.link_fd) };
    let mut conn = Connection::new(stream).context("wrap privileged link")?;

    let host = cpal::default_host();
    let device = device::pick_device(&host, args.device.as_deref()).context("pick output device")?;

    let mut events = EventCore::new().context("create event core")?;
    let link_token = events.register(conn.as_raw_fd(), true, false)?;
    let mut position_timer = events.arm_timer(POSITION_INTERVAL);

    let mut session: Option<Session> = None;
    let mut readiness = Vec::new();

    loop {
        events.poll(&mut readiness).context("poll event core")?;

        for event in &readiness {
            match *event {
                Readiness::Io { token, readable, writable } if token == link_token => {
                    if writable {
                        conn.flush();
                    }
                    if readable {
                        loop {
                            match conn.read_one() {
                                Ok(Some(frame)) => handle_frame(frame, &mut conn, &device, &mut session),
                                Ok(None) => {
                                    if conn.is_eof() {
                                        tracing::info!("privileged link closed, exiting");
                                        return Ok(());
                                    }
                                    break;
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, "privileged link protocol error, exiting");
                                    return Ok(());
                                }
                            }
                        }
                    }
                }
                Readiness::Timer(id) if id == position_timer => {
                    report_position(&mut conn, session.as_ref());
                    position_timer = events.arm_timer(POSITION_INTERVAL);
                }
                _ => {}
            }
        }

        if let Some(s) = session.as_ref() {
            if s.dstq.is_done() && s.dstq.len_frames() == 0 {
                conn.compose(MessageType::TrackEnded, std::process::id(), None, &Outcome::Finished.encode());
                session = None;
            }
        }

        conn.flush();
    }
}

fn handle_frame(frame: cadence_proto::Frame, conn: &mut Connection, device: &cpal::Device, session: &mut Option<Session>) {
    match frame.kind {
        MessageType::Play => {
            let Some(fd) = frame.fd else {
                tracing::warn!("Play frame carried no fd");
                return;
            };
            start_track(fd, conn, device, session);
        }
        MessageType::Resume => {
            if let Some(s) = session.as_ref() {
                s.paused.store(false, Ordering::Relaxed);
            }
        }
        MessageType::Pause => {
            if let Some(s) = session.as_ref() {
                s.paused.store(true, Ordering::Relaxed);
            }
        }
        MessageType::Stop => {
            stop_current(session, Some(conn));
        }
        MessageType::Seek => match message::SeekPayload::decode(&frame.payload) {
            Ok(req) => do_seek(req, conn, device, session),
            Err(e) => tracing::warn!(error = %e, "malformed Seek payload"),
        },
        other => {
            tracing::warn!(kind = ?other, "unexpected frame on privileged link");
        }
    }
}

/// Tear down the current session, if any. Reports `TrackEnded(Stopped)`
/// when `conn` is given (an explicit `Stop` command); a silent teardown
/// (no report) is used internally when a `Seek` or a fresh `Play`
/// supersedes the session before it naturally ends.
fn stop_current(session: &mut Option<Session>, conn: Option<&mut Connection>) {
    if let Some(s) = session.take() {
        s.stop.store(true, Ordering::Relaxed);
        s.dstq.close();
        let _ = s.stream.pause();
        if let Some(conn) = conn {
            conn.compose(MessageType::TrackEnded, std::process::id(), None, &Outcome::Stopped.encode());
        }
    }
}

fn start_track(fd: OwnedFd, conn: &mut Connection, device: &cpal::Device, session: &mut Option<Session>) {
    // Defensive: normal dispatch always sends Stop before a fresh Play
    // when one track supersedes another (§4.4, §5 ordering guarantee),
    // so `session` should already be `None` here.
    stop_current(session, None);

    let master_fd = match dup_owned_fd(&fd) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(error = %e, "failed to dup track fd");
            report_track_error(conn);
            return;
        }
    };

    let mut file = File::from(fd);
    let codec = match codec::sniff(&mut file) {
        Some(codec) => codec,
        None => {
            tracing::warn!("unrecognized track format");
            report_track_error(conn);
            return;
        }
    };
    if let Err(e) = file.seek(SeekFrom::Start(0)) {
        tracing::warn!(error = %e, "failed to rewind track after sniffing");
        report_track_error(conn);
        return;
    }

    match open_session(file, codec, device, None) {
        Ok((core, duration)) => {
            conn.compose(MessageType::TrackStarted, std::process::id(), None, &message::encode_position(duration));
            *session = Some(Session { master_fd, ..core });
        }
        Err(StartError::Track(e)) => {
            tracing::warn!(error = %e, "track open/decode failed, reporting error");
            report_track_error(conn);
        }
        Err(StartError::Device(e)) => {
            tracing::error!(error = %e, "fatal audio-device error, exiting");
            std::process::exit(1);
        }
    }
}

fn do_seek(req: SeekPayload, conn: &mut Connection, device: &cpal::Device, session: &mut Option<Session>) {
    let Some(current) = session.as_ref() else {
        return;
    };

    let now = position_secs(current);
    let duration = current.duration_secs.max(0);
    let target = if req.percent {
        ((req.value.clamp(0, 100) as f64 / 100.0) * duration as f64) as i64
    } else if req.relative {
        now + req.value
    } else {
        req.value
    }
    .clamp(0, duration.max(0));

    let reopened = match dup_owned_fd(&current.master_fd) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(error = %e, "failed to dup fd for seek");
            return;
        }
    };
    let new_master = match dup_owned_fd(&current.master_fd) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(error = %e, "failed to dup fd for seek");
            return;
        }
    };

    let mut file = File::from(reopened);
    let codec = match codec::sniff(&mut file) {
        Some(codec) => codec,
        None => return,
    };
    if file.seek(SeekFrom::Start(0)).is_err() {
        return;
    }

    // Tear down the old session without reporting TrackEnded: a seek is
    // not a stop as far as the control protocol is concerned (§4.3, Seek).
    stop_current(session, None);

    match open_session(file, codec, device, Some((target.max(0) as u64) * 1000)) {
        Ok((core, _duration)) => {
            *session = Some(Session { master_fd: new_master, ..core });
            conn.compose(MessageType::PositionUpdate, std::process::id(), None, &message::encode_position(target));
        }
        Err(StartError::Track(e)) => {
            tracing::warn!(error = %e, "seek failed to restart decode, reporting error");
            report_track_error(conn);
        }
        Err(StartError::Device(e)) => {
            tracing::error!(error = %e, "fatal audio-device error during seek, exiting");
            std::process::exit(1);
        }
    }
}

/// Build the decode → resample → playback pipeline for an already-sniffed,
/// rewound file and negotiate the output device for its sample rate
/// (§4.5, "negotiates the device").
fn open_session(file: File, codec: Codec, device: &cpal::Device, seek_ms: Option<u64>) -> Result<(Session, i64), StartError> {
    let stop = Arc::new(AtomicBool::new(false));
    let (src_spec, srcq, info) =
        decode::start_streaming_decode(file, codec, BUFFER_SECONDS, seek_ms, stop.clone()).map_err(StartError::Track)?;

    let output_config = device::pick_output_config(device, Some(src_spec.rate)).map_err(StartError::Device)?;
    let mut stream_config: cpal::StreamConfig = output_config.clone().into();
    if let Some(buffer_size) = device::pick_buffer_size(&output_config) {
        stream_config.buffer_size = buffer_size;
    }

    let dstq = resample::start_resampler(
        srcq,
        src_spec,
        stream_config.sample_rate,
        resample::ResampleConfig { chunk_frames: RESAMPLE_CHUNK_FRAMES, buffer_seconds: BUFFER_SECONDS },
    )
    .map_err(StartError::Track)?;

    let paused = Arc::new(AtomicBool::new(false));
    let played_frames = Arc::new(AtomicU64::new(0));

    let stream = playback::build_output_stream(
        device,
        &stream_config,
        output_config.sample_format(),
        &dstq,
        playback::PlaybackConfig {
            refill_max_frames: REFILL_MAX_FRAMES,
            paused: Some(paused.clone()),
            played_frames: Some(played_frames.clone()),
            underrun_events: None,
        },
    )
    .map_err(StartError::Device)?;
    stream.play().map_err(|e| StartError::Device(e.into()))?;

    let duration_secs = info.duration_secs.unwrap_or(0);
    // `master_fd` is a placeholder here; callers always overwrite it via
    // struct-update syntax with the fd they actually want retained.
    let placeholder_master = dup_owned_fd_of_stdin();
    Ok((
        Session {
            stop,
            paused,
            dstq,
            stream,
            played_frames,
            device_rate: stream_config.sample_rate,
            duration_secs,
            master_fd: placeholder_master,
        },
        duration_secs,
    ))
}

/// A cheap, always-available fd to satisfy `Session::master_fd` until the
/// caller's struct-update overwrites it. Never read from.
fn dup_owned_fd_of_stdin() -> OwnedFd {
    unsafe { OwnedFd::from_raw_fd(libc::dup(0)) }
}

fn position_secs(session: &Session) -> i64 {
    let rate = session.device_rate.max(1) as i64;
    session.played_frames.load(Ordering::Relaxed) as i64 / rate
}

fn report_position(conn: &mut Connection, session: Option<&Session>) {
    if let Some(s) = session {
        let position = position_secs(s);
        conn.compose(MessageType::PositionUpdate, std::process::id(), None, &message::encode_position(position));
    }
}

fn report_track_error(conn: &mut Connection) {
    conn.compose(MessageType::TrackEnded, std::process::id(), None, &Outcome::Error.encode());
}

fn dup_owned_fd(fd: &OwnedFd) -> std::io::Result<OwnedFd> {
    let raw = unsafe { libc::dup(fd.as_raw_fd()) };
    if raw < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}
