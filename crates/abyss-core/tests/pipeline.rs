//! End-to-end pipeline: ring → aggregator → frames, across real threads.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use abyss_core::aggregate::{Aggregator, HealthStats};
use abyss_core::{PacketHeader, PacketRing, SnifferConfig, TelemetryFrame};

fn tcp_packet(src_ip: u32, dst_ip: u32, src_port: u16, dst_port: u16) -> PacketHeader {
    let mut pkt = PacketHeader::new(1500, 1500, Instant::now());
    pkt.ip_version = 4;
    pkt.src_ip = src_ip;
    pkt.dst_ip = dst_ip;
    pkt.src_port = src_port;
    pkt.dst_port = dst_port;
    pkt.protocol = 6;
    pkt
}

#[test]
fn aggregator_emits_frames_from_ring_traffic() {
    let ring = Arc::new(PacketRing::new());
    let health = Arc::new(HealthStats::new());
    health.update(3, 0.25);

    let mut aggregator = Aggregator::new(SnifferConfig::default(), Arc::clone(&ring), health);
    let frames: Arc<Mutex<Vec<TelemetryFrame>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&frames);
    aggregator.on_frame(move |frame| sink.lock().expect("frame sink").push(frame.clone()));

    let handle = aggregator.stop_handle();
    let consumer = thread::spawn(move || aggregator.run());

    // Feed a steady HTTPS flow for a handful of windows.
    let deadline = Instant::now() + Duration::from_millis(200);
    while Instant::now() < deadline {
        ring.push(tcp_packet(
            u32::from_be_bytes([1, 1, 1, 1]),
            u32::from_be_bytes([2, 2, 2, 2]),
            50_000,
            443,
        ));
        thread::sleep(Duration::from_millis(2));
    }
    // Let the consumer drain the tail before stopping.
    thread::sleep(Duration::from_millis(50));

    handle.stop();
    consumer.join().expect("aggregator thread");

    let frames = frames.lock().expect("frame sink");
    assert!(
        frames.len() >= 5,
        "expected several ~60 Hz frames, got {}",
        frames.len()
    );

    for frame in frames.iter() {
        assert_eq!(frame.schema, 1);
        assert!(!frame.t.is_nan() && !frame.t.is_infinite());
        assert!((0.0..=1.0).contains(&frame.net.packet_loss));
        assert!((0.0..=1.0).contains(&frame.net.error_rate));
        assert!(!frame.net.latency_ms.is_nan());
        assert!(frame.top_flows.len() <= 8);
        assert!(frame.proto.heavy_streams <= frame.net.active_flows);
        assert_eq!(frame.health.capture_drop, 3);
        assert_eq!(frame.health.queue_fill, 0.25);
    }

    // At least one busy window must have seen the flow.
    let busy = frames
        .iter()
        .find(|frame| !frame.top_flows.is_empty())
        .expect("some window saw traffic");
    assert_eq!(busy.net.active_flows, 1);
    assert_eq!(busy.proto.https_flows, 1);
    assert_eq!(busy.top_flows[0].key, "1.1.1.1:2.2.2.2:443");
    assert_eq!(busy.top_flows[0].dir, "down");

    // Frames survive the JSON round trip.
    let json = busy.to_json();
    let back: TelemetryFrame = serde_json::from_str(&json).expect("frame parses back");
    assert_eq!(back.net.active_flows, busy.net.active_flows);
    assert_eq!(back.top_flows, busy.top_flows);
}

#[test]
fn stop_is_clean_and_idempotent() {
    let ring = Arc::new(PacketRing::new());
    let mut aggregator = Aggregator::new(
        SnifferConfig::default(),
        Arc::clone(&ring),
        Arc::new(HealthStats::new()),
    );
    let handle = aggregator.stop_handle();

    let consumer = thread::spawn(move || aggregator.run());
    thread::sleep(Duration::from_millis(30));
    assert!(handle.is_running());

    handle.stop();
    handle.stop();
    consumer.join().expect("aggregator thread");
    assert!(!handle.is_running());
}
