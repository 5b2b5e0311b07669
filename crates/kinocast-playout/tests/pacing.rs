//! Deterministic pacing scenarios driven by the steppable clock, plus a
//! real-time happy path on the system clock.

use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kinocast_buffer::{frame_ring, Frame, RingProducer};
use kinocast_core::config::UnderflowPolicy;
use kinocast_playout::sink::encoder::{null_packet, EncoderConfig, TS_PACKET_SIZE, TS_SYNC_BYTE};
use kinocast_playout::sink::{PacingSink, SinkConfig};
use kinocast_playout::transport::{Endpoint, TransportWriter};
use kinocast_timing::{ManualClock, MasterClock, SystemClock};

fn sink_config(fps: f64) -> SinkConfig {
    SinkConfig {
        target_fps: fps,
        early_soft_wait_us: 5_000,
        wait_fudge_us: 500,
        max_late_tolerance_us: 50_000,
        same_timebase_threshold_us: 1_000_000,
        min_sleep_us: 100,
        max_output_queue: 64,
        output_queue_high_water: 32,
        underflow_policy: UnderflowPolicy::Skip,
        encoder: EncoderConfig {
            width: 16,
            height: 16,
            target_fps: fps,
            bitrate_kbps: 200,
            gop_size: 30,
        },
    }
}

fn test_frame(pts_us: i64) -> Frame {
    Frame {
        pts_us,
        dts_us: pts_us,
        duration_s: 1.0 / 30.0,
        source_uri: Arc::from("pacing-test"),
        width: 16,
        height: 16,
        data: vec![64u8; Frame::yuv420_len(16, 16)],
    }
}

fn free_port() -> u16 {
    let probe = TcpListener::bind(("127.0.0.1", 0)).expect("failed to bind probe");
    let port = probe.local_addr().expect("probe addr").port();
    drop(probe);
    port
}

struct Fixture {
    sink: PacingSink,
    producer: RingProducer,
    transport: Arc<TransportWriter>,
    port: u16,
}

fn start_fixture(clock: Arc<dyn MasterClock>, fps: f64) -> Fixture {
    let (producer, consumer) = frame_ring(60);
    let port = free_port();
    let transport = TransportWriter::start(
        Endpoint::Tcp {
            bind_host: "127.0.0.1".to_string(),
            port,
        },
        700,
    )
    .expect("failed to start transport");
    let sink = PacingSink::start(
        700,
        sink_config(fps),
        consumer,
        clock,
        Arc::clone(&transport),
    )
    .expect("failed to start sink");
    Fixture {
        sink,
        producer,
        transport,
        port,
    }
}

fn wait_until<F: Fn() -> bool>(what: &str, predicate: F) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !predicate() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn on_time_frames_are_emitted_in_order() {
    let clock = Arc::new(ManualClock::new(2_000_000));
    let mut fixture = start_fixture(clock.clone(), 30.0);

    fixture
        .producer
        .try_push(test_frame(0))
        .expect("push failed");
    wait_until("first emission", || fixture.sink.stats().frames_sent == 1);

    fixture
        .producer
        .try_push(test_frame(33_333))
        .expect("push failed");
    // The second frame is ahead of its deadline; the sink must hold it.
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(fixture.sink.stats().frames_sent, 1);

    clock.advance_us(33_333);
    wait_until("second emission", || fixture.sink.stats().frames_sent == 2);
    assert_eq!(fixture.sink.stats().late_frame_drops, 0);
    fixture.sink.stop();
}

#[test]
fn stale_first_frame_is_dropped_without_binding() {
    let clock = Arc::new(ManualClock::new(100_000));
    let mut fixture = start_fixture(clock.clone(), 30.0);

    // station_now − pts = 100 ms: inside the stale window, so the sink must
    // drop it as late and keep waiting for an anchorable frame.
    fixture
        .producer
        .try_push(test_frame(0))
        .expect("push failed");
    wait_until("stale drop", || fixture.sink.stats().late_frame_drops == 1);
    assert_eq!(fixture.sink.stats().frames_sent, 0);

    // A frame at the current station time anchors and is emitted.
    fixture
        .producer
        .try_push(test_frame(100_000))
        .expect("push failed");
    wait_until("anchored emission", || fixture.sink.stats().frames_sent == 1);
    assert_eq!(fixture.sink.stats().late_frame_drops, 1);
    fixture.sink.stop();
}

#[test]
fn early_first_frame_waits_instead_of_dropping() {
    let clock = Arc::new(ManualClock::new(0));
    clock.set_us(8_000);
    let mut fixture = start_fixture(clock.clone(), 30.0);

    // station_now − pts = −2 ms: early, so no drop and no premature bind.
    fixture
        .producer
        .try_push(test_frame(10_000))
        .expect("push failed");
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(fixture.sink.stats().frames_sent, 0);
    assert_eq!(fixture.sink.stats().frames_dropped, 0);

    clock.set_us(10_000);
    wait_until("delayed emission", || fixture.sink.stats().frames_sent == 1);
    assert_eq!(fixture.sink.stats().frames_dropped, 0);
    fixture.sink.stop();
}

#[test]
fn frames_beyond_tolerance_are_dropped() {
    let clock = Arc::new(ManualClock::new(2_000_000));
    let mut fixture = start_fixture(clock.clone(), 30.0);

    fixture
        .producer
        .try_push(test_frame(0))
        .expect("push failed");
    wait_until("anchor emission", || fixture.sink.stats().frames_sent == 1);

    // Jump the clock far past the next deadline.
    clock.advance_us(200_000);
    fixture
        .producer
        .try_push(test_frame(33_333))
        .expect("push failed");
    wait_until("late drop", || fixture.sink.stats().late_frame_drops == 1);
    assert_eq!(fixture.sink.stats().frames_sent, 1);
    fixture.sink.stop();
}

#[test]
fn connected_consumer_receives_aligned_stream_with_final_pad() {
    let clock = Arc::new(ManualClock::new(2_000_000));
    let mut fixture = start_fixture(clock.clone(), 30.0);

    let mut consumer =
        TcpStream::connect(("127.0.0.1", fixture.port)).expect("failed to connect consumer");
    // Let the sink notice the consumer before frames arrive.
    wait_until("consumer attach", || fixture.transport.is_connected());

    for index in 0..5i64 {
        fixture
            .producer
            .try_push(test_frame(index * 33_333))
            .expect("push failed");
        clock.set_us(2_000_000 + index * 33_333);
        wait_until("emission", || {
            fixture.sink.stats().frames_sent == (index + 1) as u64
        });
    }
    fixture.sink.stop();

    let mut received = Vec::new();
    consumer
        .read_to_end(&mut received)
        .expect("failed to read stream");
    assert!(!received.is_empty(), "consumer received nothing");
    assert_eq!(received.len() % TS_PACKET_SIZE, 0, "stream not packet-aligned");
    for packet in received.chunks(TS_PACKET_SIZE) {
        assert_eq!(packet[0], TS_SYNC_BYTE, "lost packet alignment");
    }
    assert_eq!(
        &received[received.len() - TS_PACKET_SIZE..],
        null_packet().as_slice(),
        "stream did not end with the closing null packet"
    );
}

#[test]
fn unwatched_channel_still_paces_without_encoding() {
    let clock = Arc::new(ManualClock::new(2_000_000));
    let mut fixture = start_fixture(clock.clone(), 30.0);

    for index in 0..3i64 {
        fixture
            .producer
            .try_push(test_frame(index * 33_333))
            .expect("push failed");
        clock.set_us(2_000_000 + index * 33_333);
        wait_until("emission", || {
            fixture.sink.stats().frames_sent == (index + 1) as u64
        });
    }
    // No consumer: everything was paced, nothing was encoded.
    assert_eq!(fixture.sink.stats().frames_sent, 3);
    assert_eq!(fixture.sink.stats().network_errors, 0);
    fixture.sink.stop();
}

#[test]
fn realtime_happy_path_delivers_every_frame() {
    const FPS: f64 = 50.0;
    const FRAMES: i64 = 30;
    let clock = Arc::new(SystemClock::new(0, 0));
    let mut fixture = start_fixture(clock, FPS);

    let period_us = (1_000_000.0 / FPS) as i64;
    for index in 0..FRAMES {
        fixture
            .producer
            .try_push(test_frame(index * period_us))
            .expect("push failed");
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while fixture.sink.stats().frames_sent < FRAMES as u64 {
        assert!(Instant::now() < deadline, "playout did not finish in time");
        std::thread::sleep(Duration::from_millis(10));
    }
    let stats = fixture.sink.stats();
    assert_eq!(stats.frames_sent, FRAMES as u64);
    assert_eq!(stats.late_frame_drops, 0);
    fixture.sink.stop();
}

#[test]
fn freeze_policy_synthesizes_frames_during_starvation() {
    let clock = Arc::new(ManualClock::new(2_000_000));
    let (producer, consumer) = frame_ring(60);
    let mut producer = producer;
    let port = free_port();
    let transport = TransportWriter::start(
        Endpoint::Tcp {
            bind_host: "127.0.0.1".to_string(),
            port,
        },
        701,
    )
    .expect("failed to start transport");
    let mut config = sink_config(30.0);
    config.underflow_policy = UnderflowPolicy::Freeze;
    let sink = PacingSink::start(
        701,
        config,
        consumer,
        clock.clone(),
        Arc::clone(&transport),
    )
    .expect("failed to start sink");

    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("failed to connect consumer");
    wait_until("consumer attach", || transport.is_connected());

    producer.try_push(test_frame(0)).expect("push failed");
    wait_until("first emission", || sink.stats().frames_sent == 1);

    // Starve the ring past the next cadence point: the sink should fill the
    // gap with a frozen repeat.
    clock.advance_us(40_000);
    wait_until("freeze correction", || sink.stats().corrections >= 1);

    sink.stop();
    let mut drained = Vec::new();
    stream.read_to_end(&mut drained).expect("failed to read stream");
    assert_eq!(drained.len() % TS_PACKET_SIZE, 0);
}
