use std::io::Write;
use std::time::Duration;

use ferry_collectd::RawValue;
use ferry_collectd::testutils::PacketBuilder;
use ferry_config::Config;
use ferry_server::{ServerError, Supervisor, SupervisorState};
use ferry_system::Controller;
use similar_asserts::assert_eq;
use tempfile::NamedTempFile;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, UdpSocket};

const LOAD_LINES: &str = "\
web01.load.shortterm 0.5 1700000000
web01.load.midterm 1 1700000000
web01.load.longterm 1.5 1700000000
";

fn types_db() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        "load shortterm:GAUGE:0:5000, midterm:GAUGE:0:5000, longterm:GAUGE:0:5000"
    )
    .unwrap();
    file
}

fn config(types_db: &NamedTempFile, sinks: &str) -> Config {
    let yaml = format!(
        "\
collectd:
  host: 127.0.0.1
  port: 0
  types_db:
    - {}
supervisor:
  poll_interval_ms: 50
  shutdown_grace_period: 1
sinks:
{sinks}",
        types_db.path().display()
    );

    Config::from_yaml_str(&yaml).unwrap()
}

/// Returns a port on which nothing accepts connections.
async fn refused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn load_packet() -> Vec<u8> {
    PacketBuilder::new()
        .host("web01")
        .time(1_700_000_000)
        .interval(10)
        .plugin("load")
        .type_name("load")
        .values(&[
            RawValue::Gauge(0.5),
            RawValue::Gauge(1.0),
            RawValue::Gauge(1.5),
        ])
        .build()
}

async fn send_packet(supervisor: &Supervisor) {
    let addr = supervisor.collectd_addr().unwrap();
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(&load_packet(), addr).await.unwrap();
}

#[tokio::test]
async fn test_collectd_to_carbon() {
    ferry_log::init_test!();

    let carbon = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = carbon.local_addr().unwrap().port();

    let types = types_db();
    let sinks = format!("  - name: carbon\n    port: {port}\n    batch_size: 1\n");
    let config = config(&types, &sinks);

    let controller = Controller::new(Duration::from_secs(1));
    let supervisor = Supervisor::start(&config, controller.shutdown_handle())
        .await
        .unwrap();
    assert_eq!(*supervisor.state().borrow(), SupervisorState::Running);
    assert!(supervisor.statsd_addr().is_none());

    send_packet(&supervisor).await;
    let task = tokio::spawn(supervisor.run());

    let (mut conn, _) = carbon.accept().await.unwrap();
    let mut buf = vec![0; LOAD_LINES.len()];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(std::str::from_utf8(&buf).unwrap(), LOAD_LINES);

    controller.shutdown(None);
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stalled_sink_blocks_fan_out() {
    ferry_log::init_test!();

    let stalled = refused_port().await;
    let carbon = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = carbon.local_addr().unwrap().port();

    let types = types_db();
    let sinks = format!(
        "  - name: stalled
    port: {stalled}
    reconnect_delay: 60
    channel_capacity: 1
  - name: carbon
    port: {port}
    batch_size: 1
"
    );
    let config = config(&types, &sinks);

    let controller = Controller::new(Duration::from_secs(1));
    let supervisor = Supervisor::start(&config, controller.shutdown_handle())
        .await
        .unwrap();

    send_packet(&supervisor).await;
    let _task = tokio::spawn(supervisor.run());

    // the first point fits into the stalled sink's channel, the second one blocks the supervisor
    let (mut conn, _) = carbon.accept().await.unwrap();
    let first = "web01.load.shortterm 0.5 1700000000\n";
    let mut buf = vec![0; first.len()];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(std::str::from_utf8(&buf).unwrap(), first);

    let mut more = [0; 64];
    let read = tokio::time::timeout(Duration::from_millis(300), conn.read(&mut more)).await;
    assert!(read.is_err(), "carbon received points past a stalled sink");
}

#[tokio::test]
async fn test_shutdown_flushes_sinks() {
    ferry_log::init_test!();

    let carbon = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = carbon.local_addr().unwrap().port();

    let types = types_db();
    let sinks = format!(
        "  - name: carbon\n    port: {port}\n    batch_size: 100\n    flush_interval: 3600\n"
    );
    let config = config(&types, &sinks);

    let controller = Controller::new(Duration::from_secs(1));
    let supervisor = Supervisor::start(&config, controller.shutdown_handle())
        .await
        .unwrap();
    let state = supervisor.state();

    send_packet(&supervisor).await;
    let task = tokio::spawn(supervisor.run());

    tokio::time::sleep(Duration::from_millis(200)).await;
    controller.shutdown(None);
    task.await.unwrap().unwrap();
    assert_eq!(*state.borrow(), SupervisorState::Stopped);

    // the partial batch is written before the connection is closed
    let (mut conn, _) = carbon.accept().await.unwrap();
    let mut received = String::new();
    conn.read_to_string(&mut received).await.unwrap();
    assert_eq!(received, LOAD_LINES);
}

#[tokio::test]
async fn test_shutdown_with_stalled_sink() {
    ferry_log::init_test!();

    let stalled = refused_port().await;
    let carbon = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = carbon.local_addr().unwrap().port();

    let types = types_db();
    let sinks = format!(
        "  - name: stalled
    port: {stalled}
    reconnect_delay: 60
    channel_capacity: 1
  - name: carbon
    port: {port}
    batch_size: 1
"
    );
    let config = config(&types, &sinks);

    let controller = Controller::new(Duration::from_secs(1));
    let supervisor = Supervisor::start(&config, controller.shutdown_handle())
        .await
        .unwrap();
    let state = supervisor.state();

    send_packet(&supervisor).await;
    let task = tokio::spawn(supervisor.run());

    let (mut conn, _) = carbon.accept().await.unwrap();
    let first = "web01.load.shortterm 0.5 1700000000\n";
    let mut buf = vec![0; first.len()];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(std::str::from_utf8(&buf).unwrap(), first);

    // fan-out is blocked on the stalled sink at this point
    controller.shutdown(None);
    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("shutdown was blocked by a stalled sink");

    result.unwrap().unwrap();
    assert_eq!(*state.borrow(), SupervisorState::Stopped);
}

#[tokio::test]
async fn test_shutdown_flushes_every_sink() {
    ferry_log::init_test!();

    let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let second = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let first_port = first.local_addr().unwrap().port();
    let second_port = second.local_addr().unwrap().port();

    let types = types_db();
    let sinks = format!(
        "  - name: first
    port: {first_port}
    batch_size: 100
    flush_interval: 3600
  - name: second
    port: {second_port}
    batch_size: 100
    flush_interval: 3600
"
    );
    let config = config(&types, &sinks);

    let controller = Controller::new(Duration::from_secs(1));
    let supervisor = Supervisor::start(&config, controller.shutdown_handle())
        .await
        .unwrap();
    let state = supervisor.state();
    let collectd = supervisor.collectd_addr().unwrap();

    send_packet(&supervisor).await;
    let task = tokio::spawn(supervisor.run());

    tokio::time::sleep(Duration::from_millis(200)).await;
    controller.shutdown(None);
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(*state.borrow(), SupervisorState::Stopped);

    // packets arriving after the shutdown are not delivered anywhere
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(&load_packet(), collectd).await.unwrap();

    for listener in [first, second] {
        let (mut conn, _) = listener.accept().await.unwrap();
        let mut received = String::new();
        conn.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, LOAD_LINES);
    }
}

#[tokio::test]
async fn test_dead_sink_stops_pipeline() {
    ferry_log::init_test!();

    let port = refused_port().await;
    let types = types_db();
    let sinks = format!(
        "  - name: dead\n    port: {port}\n    reconnect_delay: 0\n    max_reconnects: 0\n"
    );
    let config = config(&types, &sinks);

    let controller = Controller::new(Duration::from_secs(1));
    let supervisor = Supervisor::start(&config, controller.shutdown_handle())
        .await
        .unwrap();
    let state = supervisor.state();

    let result = tokio::time::timeout(Duration::from_secs(5), supervisor.run())
        .await
        .unwrap();

    assert!(matches!(result, Err(ServerError::ChildDied(ref name)) if name == "sink dead"));
    assert_eq!(*state.borrow(), SupervisorState::Stopped);
}

#[tokio::test]
async fn test_bind_failure_spawns_nothing() {
    ferry_log::init_test!();

    let taken = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = taken.local_addr().unwrap().port();

    let types = types_db();
    let yaml = format!(
        "\
collectd:
  host: 127.0.0.1
  port: {port}
  types_db:
    - {}
",
        types.path().display()
    );
    let config = Config::from_yaml_str(&yaml).unwrap();

    let controller = Controller::new(Duration::from_secs(1));
    let result = Supervisor::start(&config, controller.shutdown_handle()).await;

    assert!(matches!(
        result,
        Err(ServerError::Bind {
            listener: "collectd",
            ..
        })
    ));
}
