// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end tests: a real listener on loopback, devices played by plain
//! `TcpStream`s, registry and sink kept in memory.

use sensor_ingest::protocol::{GuardMessage, Info, Readout, Sample, SensorSamples};
use sensor_ingest::registry::{DeviceSeed, MeasurementSeed};
use sensor_ingest::{
    DeviceFamily, IngestConfig, IngestServer, MeasurementRun, MemoryRegistry, MemorySink,
    Precision, RunningServer, SensorParams,
};
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

fn test_config() -> IngestConfig {
    let mut config = IngestConfig::default();
    config.server.bind_address = Ipv4Addr::LOCALHOST.into();
    config.server.port = 0;
    config.server.read_timeout_ms = 50;
    config.server.params_poll_interval_ms = 50;
    config.stats_interval_secs = 0;
    config
}

fn start(registry: &Arc<MemoryRegistry>, sink: &Arc<MemorySink>) -> RunningServer {
    start_with(test_config(), registry, sink)
}

fn start_with(
    config: IngestConfig,
    registry: &Arc<MemoryRegistry>,
    sink: &Arc<MemorySink>,
) -> RunningServer {
    IngestServer::bind(config, registry.clone(), sink.clone())
        .unwrap()
        .spawn()
        .unwrap()
}

fn connect(server: &RunningServer) -> TcpStream {
    let stream = TcpStream::connect(server.local_addr()).unwrap();
    stream.set_read_timeout(Some(WAIT)).unwrap();
    stream
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn read_exactly(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).unwrap();
    buf
}

fn assert_closed_by_server(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    match stream.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("unexpected {} bytes from server", n),
        Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {}
        Err(e) => panic!("connection still open: {}", e),
    }
}

fn announce(stream: &mut TcpStream, name: &str, sensor_count: u8, offset: u64) {
    let info = Info::new(name, sensor_count, offset).encode().unwrap();
    stream.write_all(&info).unwrap();
}

#[test]
fn test_sensor_node_negotiates_then_streams() {
    let registry = Arc::new(MemoryRegistry::new());
    let sink = Arc::new(MemorySink::new());
    let server = start(&registry, &sink);

    let mut node = connect(&server);
    announce(&mut node, "node1", 2, 1000);

    // Registered on first contact, unconfigured until the control center acts.
    assert!(wait_for(|| registry.device_id("node1").is_some()));
    let id = registry.device_id("node1").unwrap();
    assert_eq!(registry.sensor_count(id), Some(2));
    assert!(wait_for(|| registry.is_connected(id) == Some(true)));

    registry
        .set_sensor_params(
            id,
            &[
                SensorParams::new(100, 10, "temp"),
                SensorParams::new(200, 5, "hum"),
            ],
        )
        .unwrap();
    registry
        .start_measurement(id, MeasurementRun::new("project-a", 7))
        .unwrap();

    let params = read_exactly(&mut node, 10);
    assert_eq!(params, vec![100, 0, 0, 0, 10, 200, 0, 0, 0, 5]);

    let samples: Vec<Sample> = (0..10u32)
        .map(|i| Sample::new(i * 100, f64::from(i) * 0.5))
        .collect();
    let mut stream_bytes = SensorSamples::new(0, samples).encode_frame();
    stream_bytes.extend(SensorSamples::new(1, vec![Sample::new(5, 42.0); 5]).encode_frame());

    // Split mid-sample so the session has to keep a tail between reads.
    let (first, second) = stream_bytes.split_at(57);
    node.write_all(first).unwrap();
    node.flush().unwrap();
    thread::sleep(Duration::from_millis(80));
    node.write_all(second).unwrap();

    assert!(wait_for(|| sink.point_count() == 15));
    let batches = sink.batches();
    assert!(batches.iter().all(|b| b.run_name == "project-a"));

    let points = sink.points();
    let temp: Vec<_> = points.iter().filter(|p| p.sensor == "temp").collect();
    assert_eq!(temp.len(), 10);
    assert_eq!(temp[0].timestamp, 1000);
    assert_eq!(temp[9].timestamp, 1900);
    assert_eq!(temp[3].value, 1.5);
    assert!(points.iter().all(|p| p.run_id == 7
        && p.device == "node1"
        && p.precision == Precision::Milliseconds));
    assert_eq!(points.iter().filter(|p| p.sensor == "hum").count(), 5);

    drop(node);
    assert!(wait_for(|| registry.is_connected(id) == Some(false)));
    assert!(wait_for(|| server.sessions().is_empty()));
    server.shutdown().unwrap();
}

#[test]
fn test_parameter_change_restarts_session() {
    let registry = Arc::new(MemoryRegistry::new());
    let sink = Arc::new(MemorySink::new());
    let id = registry.seed_device("node2", DeviceFamily::SensorNode, &[SensorParams::new(100, 2, "a")]);
    let server = start(&registry, &sink);

    let mut node = connect(&server);
    announce(&mut node, "node2", 1, 0);
    assert_eq!(read_exactly(&mut node, 5), vec![100, 0, 0, 0, 2]);

    registry
        .set_sensor_params(id, &[SensorParams::new(50, 2, "a")])
        .unwrap();
    assert_closed_by_server(&mut node);
    assert!(wait_for(|| server.metrics().snapshot().param_restarts == 1));

    // The node reconnects and picks up the new contract.
    let mut node = connect(&server);
    announce(&mut node, "node2", 1, 0);
    assert_eq!(read_exactly(&mut node, 5), vec![50, 0, 0, 0, 2]);

    server.shutdown().unwrap();
}

#[test]
fn test_reconnect_preempts_stale_session() {
    let registry = Arc::new(MemoryRegistry::new());
    let sink = Arc::new(MemorySink::new());
    let id = registry.seed_device("node3", DeviceFamily::SensorNode, &[SensorParams::new(100, 1, "x")]);
    registry
        .start_measurement(id, MeasurementRun::new("run", 1))
        .unwrap();
    let server = start(&registry, &sink);

    let mut stale = connect(&server);
    announce(&mut stale, "node3", 1, 0);
    read_exactly(&mut stale, 5);

    let mut fresh = connect(&server);
    announce(&mut fresh, "node3", 1, 0);
    read_exactly(&mut fresh, 5);

    assert_closed_by_server(&mut stale);
    assert_eq!(server.metrics().snapshot().preemptions, 1);
    // The stale session must not mark the device disconnected.
    assert_eq!(registry.is_connected(id), Some(true));
    assert_eq!(server.sessions().names(), vec!["node3".to_string()]);

    let batch = SensorSamples::new(0, vec![Sample::new(10, 3.0)]).encode_frame();
    fresh.write_all(&batch).unwrap();
    assert!(wait_for(|| sink.point_count() == 1));

    drop(fresh);
    assert!(wait_for(|| registry.is_connected(id) == Some(false)));
    server.shutdown().unwrap();
}

#[test]
fn test_fbguard_registers_new_sensor_once() {
    let registry = Arc::new(MemoryRegistry::from_seeds(&[DeviceSeed {
        name: "dev1".into(),
        family: DeviceFamily::FbGuard,
        sensors: Vec::new(),
        measurements: vec![MeasurementSeed {
            name: "bridge".into(),
            id: 3,
        }],
    }]));
    let sink = Arc::new(MemorySink::new());
    let server = start(&registry, &sink);
    let id = registry.device_id("dev1").unwrap();

    let first = GuardMessage::build(
        "dev1",
        "s1",
        0,
        vec![
            Readout::new(1_700_000_000, 250_000, 1.5),
            Readout::new(1_700_000_000, 500_000, 2.5),
        ],
    )
    .unwrap();
    let second = GuardMessage::build("dev1", "s1", 1, vec![Readout::new(1_700_000_001, 0, 3.5)]).unwrap();

    let mut bytes = first.encode();
    assert_eq!(bytes.len(), 80 + 2 * 24 + 4);
    bytes.extend(second.encode());

    let mut guard = connect(&server);
    // Identification has to wait for the whole first message.
    guard.write_all(&bytes[..50]).unwrap();
    guard.flush().unwrap();
    thread::sleep(Duration::from_millis(80));
    guard.write_all(&bytes[50..]).unwrap();

    assert!(wait_for(|| sink.point_count() == 3));
    assert_eq!(registry.sensor_count(id), Some(1));

    let points = sink.points();
    assert_eq!(points[0].timestamp, 1_700_000_000_250_000);
    assert_eq!(points[0].precision, Precision::Microseconds);
    assert_eq!(points[0].timestamp_ns(), 1_700_000_000_250_000_000);
    assert!(points.iter().all(|p| p.sensor == "s1" && p.run_id == 3 && p.device == "dev1"));
    assert!(sink.batches().iter().all(|b| b.run_name == "bridge"));
    assert!(wait_for(|| registry.is_connected(id) == Some(true)));

    drop(guard);
    assert!(wait_for(|| registry.is_connected(id) == Some(false)));
    server.shutdown().unwrap();
}

#[test]
fn test_samples_dropped_without_running_measurement() {
    let registry = Arc::new(MemoryRegistry::new());
    let sink = Arc::new(MemorySink::new());
    registry.seed_device("node4", DeviceFamily::SensorNode, &[SensorParams::new(10, 2, "p")]);
    let server = start(&registry, &sink);

    let mut node = connect(&server);
    announce(&mut node, "node4", 1, 0);
    read_exactly(&mut node, 5);

    let batch = SensorSamples::new(0, vec![Sample::new(1, 1.0), Sample::new(2, 2.0)]).encode_frame();
    node.write_all(&batch).unwrap();

    assert!(wait_for(|| server.metrics().snapshot().samples_dropped == 2));
    assert_eq!(sink.point_count(), 0);
    server.shutdown().unwrap();
}

#[test]
fn test_sensor_count_mismatch_closes_connection() {
    let registry = Arc::new(MemoryRegistry::new());
    let sink = Arc::new(MemorySink::new());
    registry.seed_device(
        "node5",
        DeviceFamily::SensorNode,
        &[SensorParams::new(10, 2, "a"), SensorParams::new(10, 2, "b")],
    );
    let server = start(&registry, &sink);

    let mut node = connect(&server);
    announce(&mut node, "node5", 3, 0);
    assert_closed_by_server(&mut node);
    assert!(server.sessions().is_empty());
    server.shutdown().unwrap();
}

#[test]
fn test_unknown_sensor_id_ends_session() {
    let registry = Arc::new(MemoryRegistry::new());
    let sink = Arc::new(MemorySink::new());
    registry.seed_device("node6", DeviceFamily::SensorNode, &[SensorParams::new(10, 1, "a")]);
    let server = start(&registry, &sink);

    let mut node = connect(&server);
    announce(&mut node, "node6", 1, 0);
    read_exactly(&mut node, 5);

    let batch = SensorSamples::new(4, vec![Sample::new(1, 1.0)]).encode_frame();
    node.write_all(&batch).unwrap();
    assert_closed_by_server(&mut node);
    assert!(wait_for(|| server.metrics().snapshot().protocol_errors == 1));
    server.shutdown().unwrap();
}

#[test]
fn test_shutdown_closes_sessions_and_resets_state() {
    let registry = Arc::new(MemoryRegistry::new());
    let sink = Arc::new(MemorySink::new());
    let id = registry.seed_device("node7", DeviceFamily::SensorNode, &[SensorParams::new(10, 1, "a")]);
    let server = start(&registry, &sink);

    let mut node = connect(&server);
    announce(&mut node, "node7", 1, 0);
    read_exactly(&mut node, 5);
    assert_eq!(registry.is_connected(id), Some(true));

    server.shutdown().unwrap();
    assert_closed_by_server(&mut node);
    assert_eq!(registry.is_connected(id), Some(false));
}

#[test]
fn test_sink_failure_ends_session() {
    let registry = Arc::new(MemoryRegistry::new());
    let sink = Arc::new(MemorySink::new());
    let id = registry.seed_device("node8", DeviceFamily::SensorNode, &[SensorParams::new(10, 1, "a")]);
    registry
        .start_measurement(id, MeasurementRun::new("run", 1))
        .unwrap();
    sink.fail_writes(Some("store unreachable"));
    let server = start(&registry, &sink);

    let mut node = connect(&server);
    announce(&mut node, "node8", 1, 0);
    read_exactly(&mut node, 5);

    let batch = SensorSamples::new(0, vec![Sample::new(1, 1.0)]).encode_frame();
    node.write_all(&batch).unwrap();
    assert_closed_by_server(&mut node);
    assert_eq!(server.metrics().snapshot().sink_errors, 1);
    assert_eq!(registry.is_connected(id), Some(false));
    server.shutdown().unwrap();
}

#[test]
fn test_silent_node_times_out() {
    let registry = Arc::new(MemoryRegistry::new());
    let sink = Arc::new(MemorySink::new());
    let id = registry.seed_device("node9", DeviceFamily::SensorNode, &[SensorParams::new(10, 1, "a")]);
    let mut config = test_config();
    config.server.idle_timeout_secs = 1;
    let server = start_with(config, &registry, &sink);

    let mut node = connect(&server);
    announce(&mut node, "node9", 1, 0);
    read_exactly(&mut node, 5);
    assert!(wait_for(|| registry.is_connected(id) == Some(true)));

    let silent = Instant::now();
    assert_closed_by_server(&mut node);
    assert!(silent.elapsed() >= Duration::from_millis(500));
    assert!(wait_for(|| registry.is_connected(id) == Some(false)));
    assert!(wait_for(|| server.sessions().is_empty()));
    server.shutdown().unwrap();
}

#[test]
fn test_node_timestamps_across_clock_wrap() {
    const OFFSET: u64 = 1_000_000;
    const SPAN: u64 = 1 << 32;

    let registry = Arc::new(MemoryRegistry::new());
    let sink = Arc::new(MemorySink::new());
    let id = registry.seed_device(
        "node10",
        DeviceFamily::SensorNode,
        &[SensorParams::new(50, 2, "fast"), SensorParams::new(1000, 2, "slow")],
    );
    registry
        .start_measurement(id, MeasurementRun::new("run", 1))
        .unwrap();
    let server = start(&registry, &sink);

    let mut node = connect(&server);
    announce(&mut node, "node10", 2, OFFSET);
    read_exactly(&mut node, 10);

    let max = u32::MAX;
    let mut bytes = SensorSamples::new(0, vec![Sample::new(max - 100, 1.0), Sample::new(max - 50, 2.0)])
        .encode_frame();
    bytes.extend(SensorSamples::new(0, vec![Sample::new(50, 3.0), Sample::new(100, 4.0)]).encode_frame());
    // The slow sensor's batch started before the fast sensor wrapped.
    bytes.extend(
        SensorSamples::new(1, vec![Sample::new(max - 3_000, 5.0), Sample::new(max - 2_000, 6.0)])
            .encode_frame(),
    );
    node.write_all(&bytes).unwrap();

    assert!(wait_for(|| sink.point_count() == 6));
    let points = sink.points();
    let timestamps = |sensor: &str| -> Vec<u64> {
        points
            .iter()
            .filter(|p| p.sensor == sensor)
            .map(|p| p.timestamp)
            .collect()
    };
    let max = u64::from(max);
    assert_eq!(
        timestamps("fast"),
        vec![
            OFFSET + max - 100,
            OFFSET + max - 50,
            OFFSET + SPAN + 50,
            OFFSET + SPAN + 100
        ]
    );
    assert_eq!(
        timestamps("slow"),
        vec![OFFSET + max - 3_000, OFFSET + max - 2_000]
    );
    server.shutdown().unwrap();
}
