use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use framegrab::ingest::callback::QueueBackend;
use framegrab::ingest::ring::{BufferRing, Readiness, RingConfig};
use framegrab::ingest::synthetic::{ResourceCounter, SimulatedRingDevice, SyntheticProducer};
use framegrab::{
    CaptureBackend, CaptureError, CaptureSession, DevicePath, FormatRequest, FrameRate,
    PixelFormat, PlaybackConfig, PlaybackController, PlaybackEvent, ReadStatus, Resolution,
    Result, SessionConfig, SessionState,
};

fn ring_session(device: SimulatedRingDevice) -> Result<CaptureSession> {
    let ring = BufferRing::open(
        Box::new(device),
        &FormatRequest::default(),
        RingConfig::default(),
    )?;
    Ok(CaptureSession::with_backend(
        DevicePath::parse("stub://camera"),
        CaptureBackend::Ring(ring),
        SessionConfig::default(),
    ))
}

fn queue_session(producer: SyntheticProducer) -> Result<CaptureSession> {
    let backend = QueueBackend::open(Box::new(producer), &FormatRequest::default(), 4)?;
    Ok(CaptureSession::with_backend(
        DevicePath::parse("stub://display"),
        CaptureBackend::Queue(backend),
        SessionConfig::default(),
    ))
}

#[test]
fn negotiates_first_encoding_at_current_size_and_rate() -> Result<()> {
    let session = CaptureSession::open_path("stub://camera", &FormatRequest::default())?;
    let format = session.format();
    assert_eq!(format.pixel_format, PixelFormat::Yuyv);
    assert_eq!(format.resolution, Resolution::new(640, 480));
    assert_eq!(format.frame_rate, Some(FrameRate::new(30, 1)));
    session.close()
}

#[test]
fn explicit_request_is_honoured() -> Result<()> {
    let request = FormatRequest::default()
        .with_resolution(1280, 720)
        .with_frame_rate(FrameRate::new(10, 1));
    let session = CaptureSession::open_path("stub://camera", &request)?;
    assert_eq!(session.format().resolution, Resolution::new(1280, 720));
    assert_eq!(session.format().frame_rate, Some(FrameRate::new(10, 1)));
    session.close()
}

#[test]
fn unsupported_encoding_fails_negotiation() {
    let request = FormatRequest::default().with_pixel_format(PixelFormat::H264);
    let err = CaptureSession::open_path("stub://camera", &request).unwrap_err();
    assert!(matches!(err, CaptureError::FormatNegotiation(_)));
}

#[test]
fn start_then_stop_leaks_nothing() -> Result<()> {
    let counter = ResourceCounter::default();
    let device = SimulatedRingDevice::webcam("stub://camera").with_counter(&counter);
    let mut session = ring_session(device)?;
    session.start_capture()?;
    session.stop_capture()?;
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(counter.queued(), 0);
    assert!(!counter.streaming());
    session.close()?;
    assert!(counter.is_idle());
    assert!(counter.released());

    let counter = ResourceCounter::default();
    let producer = SyntheticProducer::display("stub://display").with_counter(&counter);
    let mut session = queue_session(producer)?;
    session.start_capture()?;
    session.stop_capture()?;
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(counter.producers(), 0);
    session.close()?;
    assert!(counter.is_idle());
    Ok(())
}

#[test]
fn start_and_stop_are_idempotent() -> Result<()> {
    let counter = ResourceCounter::default();
    let device = SimulatedRingDevice::webcam("stub://camera").with_counter(&counter);
    let mut session = ring_session(device)?;
    session.start_capture()?;
    session.start_capture()?;
    assert_eq!(counter.stream_ons(), 1);
    assert_eq!(session.state(), SessionState::Capturing);
    session.stop_capture()?;
    session.stop_capture()?;
    assert_eq!(counter.stream_offs(), 1);
    assert_eq!(session.state(), SessionState::Idle);
    Ok(())
}

#[test]
fn poll_timeout_is_an_error_not_no_frame() -> Result<()> {
    let mut session = ring_session(SimulatedRingDevice::webcam("stub://camera").stalled())?;
    session.start_capture()?;
    let err = session.try_read_frame().unwrap_err();
    assert!(matches!(err, CaptureError::PollTimeout(_)));
    assert!(!session.is_healthy());
    Ok(())
}

#[test]
fn interrupted_wait_is_no_frame_yet() -> Result<()> {
    let device =
        SimulatedRingDevice::webcam("stub://camera").with_readiness([Readiness::Interrupted]);
    let mut session = ring_session(device)?;
    session.start_capture()?;
    assert!(matches!(session.try_read_frame()?, ReadStatus::NoFrameYet));
    assert!(matches!(session.try_read_frame()?, ReadStatus::Frame(_)));
    Ok(())
}

#[test]
fn frames_have_fixed_size_lengths() -> Result<()> {
    for path in ["stub://camera", "stub://display", "stub://camera?source=media"] {
        let mut session = CaptureSession::open_path(path, &FormatRequest::default())?;
        session.start_capture()?;
        let frame = session.read_frame()?;
        let expected = frame.format.frame_size(frame.width, frame.height);
        assert_eq!(Some(frame.len()), expected, "{}", path);
        session.close()?;
    }
    Ok(())
}

#[test]
fn frame_sequences_increase() -> Result<()> {
    let mut session =
        CaptureSession::open_path("stub://display?fps=200", &FormatRequest::default())?;
    session.start_capture()?;
    let first = session.read_frame()?;
    let second = session.read_frame()?;
    assert!(second.sequence > first.sequence);
    Ok(())
}

#[test]
fn pause_silences_notifications() -> Result<()> {
    let session =
        CaptureSession::open_path("stub://display?fps=200", &FormatRequest::default())?;
    let notified = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&notified);
    let mut controller = PlaybackController::new(session, PlaybackConfig::default(), move |event| {
        if let PlaybackEvent::Frame(_) = event {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    controller.play()?;
    controller.pause()?;
    let after_pause = notified.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(notified.load(Ordering::SeqCst), after_pause);

    // Frames flow again after a second play.
    controller.play()?;
    let deadline = Instant::now() + Duration::from_secs(5);
    while notified.load(Ordering::SeqCst) == after_pause {
        assert!(Instant::now() < deadline, "no frames after resuming");
        std::thread::sleep(Duration::from_millis(5));
    }
    controller.pause()?;
    let settled = notified.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(notified.load(Ordering::SeqCst), settled);
    Ok(())
}

#[test]
fn play_and_pause_are_idempotent() -> Result<()> {
    let counter = ResourceCounter::default();
    let producer = SyntheticProducer::display("stub://display").with_counter(&counter);
    let session = queue_session(producer)?;
    let (mut controller, _events) =
        PlaybackController::with_channel(session, PlaybackConfig::default());

    controller.pause()?;
    controller.play()?;
    controller.play()?;
    assert!(controller.is_playing());
    assert_eq!(counter.producers(), 1);

    controller.pause()?;
    controller.pause()?;
    assert!(!controller.is_playing());

    controller.stop_capture()?;
    assert_eq!(counter.producers(), 0);
    let session = controller.into_session()?;
    assert_eq!(session.state(), SessionState::Idle);
    Ok(())
}

#[test]
fn playback_reports_end_of_stream() -> Result<()> {
    let session = queue_session(SyntheticProducer::display("stub://display").with_frame_limit(2))?;
    let (mut controller, events) =
        PlaybackController::with_channel(session, PlaybackConfig::default());
    controller.play()?;

    let mut frames = 0;
    loop {
        match events.recv_timeout(Duration::from_secs(5)) {
            Ok(PlaybackEvent::Frame(_)) => frames += 1,
            Ok(PlaybackEvent::EndOfStream) => break,
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(frames, 2);

    let deadline = Instant::now() + Duration::from_secs(5);
    while controller.is_playing() {
        assert!(Instant::now() < deadline, "loop did not stop");
        std::thread::sleep(Duration::from_millis(5));
    }
    controller.pause()?;
    Ok(())
}
