//! End-to-end scenarios over real TCP connections.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use logline::{Config, LogServer};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

const IO_DEADLINE: Duration = Duration::from_secs(5);

struct TestClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
    greeting: String,
}

impl TestClient {
    async fn connect(addr: std::net::SocketAddr) -> TestClient {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read, write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        let greeting = timeout(IO_DEADLINE, lines.next_line())
            .await
            .expect("greeting in time")
            .expect("greeting read")
            .expect("greeting line");
        assert!(greeting.starts_with("OK:CONNECTED:"), "got {greeting}");
        TestClient {
            lines,
            write,
            greeting,
        }
    }

    async fn send(&mut self, line: &str) -> String {
        self.write
            .write_all(format!("{line}\n").as_bytes())
            .await
            .expect("send line");
        timeout(IO_DEADLINE, self.lines.next_line())
            .await
            .expect("reply in time")
            .expect("reply read")
            .expect("reply line")
    }

    /// Reads one more line, returning `None` when the server closed.
    async fn read_eof(&mut self) -> Option<String> {
        timeout(IO_DEADLINE, self.lines.next_line())
            .await
            .expect("eof in time")
            .expect("eof read")
    }
}

async fn start_server(
    storage_dir: &std::path::Path,
    buffer_size: usize,
    thread_pool_size: usize,
) -> LogServer {
    let config = Arc::new(Config {
        port: 0,
        buffer_size,
        thread_pool_size,
        storage_directory: storage_dir.to_path_buf(),
        max_clients: 10,
        ..Config::default()
    });
    LogServer::start(config).await.expect("server start")
}

fn todays_file(dir: &std::path::Path, application: &str) -> std::path::PathBuf {
    let date = chrono::Local::now().format("%Y-%m-%d");
    dir.join(format!("{application}_{date}.log"))
}

#[tokio::test]
async fn e2e_single_client_records_reach_the_daily_file_in_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = start_server(dir.path(), 5, 1).await;
    let addr = server.local_addr();

    let mut client = TestClient::connect(addr).await;
    for i in 1..=5 {
        let reply = client.send(&format!("INFO|A|h|m{i}|k=v")).await;
        assert!(reply.starts_with("OK:QUEUED:"), "got {reply}");
    }
    drop(client);

    // shutdown drains the buffer and flushes the final batch
    server.shutdown().await;

    let contents = std::fs::read_to_string(todays_file(dir.path(), "A")).expect("A file");
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 5);
    for (i, line) in lines.iter().enumerate() {
        assert!(
            line.contains(&format!("- m{}", i + 1)),
            "line {i} out of order: {line}"
        );
        assert!(line.contains("INFO [A] [h]"));
    }
}

#[tokio::test]
async fn e2e_control_commands() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = start_server(dir.path(), 16, 1).await;
    let mut client = TestClient::connect(server.local_addr()).await;

    assert_eq!(client.send("CMD:PING").await, "OK:PONG");
    assert_eq!(
        client.send("CMD:UNKNOWN").await,
        "ERROR:UNKNOWN_COMMAND:UNKNOWN"
    );
    assert_eq!(
        client.send("CMD:HELP").await,
        "OK:COMMANDS:PING,STATS,BUFFER_STATS,DISCONNECT,HELP"
    );

    let stats = client.send("CMD:STATS").await;
    assert!(stats.starts_with("OK:STATS:Messages:"), "got {stats}");

    let buffer_stats = client.send("CMD:BUFFER_STATS").await;
    assert!(
        buffer_stats.starts_with("OK:BUFFER_STATS:Buffer Stats - Size: 0/16"),
        "got {buffer_stats}"
    );
    assert!(buffer_stats.ends_with("BackPressure: false"));

    server.shutdown().await;
}

#[tokio::test]
async fn e2e_disconnect_command_closes_the_connection() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = start_server(dir.path(), 16, 1).await;
    let mut client = TestClient::connect(server.local_addr()).await;

    assert_eq!(client.send("CMD:DISCONNECT").await, "OK:DISCONNECTING");
    assert_eq!(client.read_eof().await, None);

    server.shutdown().await;
}

#[tokio::test]
async fn e2e_invalid_lines() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = start_server(dir.path(), 16, 1).await;
    let mut client = TestClient::connect(server.local_addr()).await;

    assert_eq!(client.send("").await, "ERROR:EMPTY_MESSAGE");

    let oversized = "x".repeat(11_000);
    assert_eq!(client.send(&oversized).await, "ERROR:INVALID_MESSAGE_FORMAT");

    // the connection survives both rejections
    assert_eq!(client.send("CMD:PING").await, "OK:PONG");

    server.shutdown().await;
}

#[tokio::test]
async fn e2e_metadata_heavy_record_keeps_pipeline_keys() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = start_server(dir.path(), 16, 1).await;
    let mut client = TestClient::connect(server.local_addr()).await;

    // a client maxing out the META field must not starve the keys the
    // pipeline attaches on the way to disk
    let meta: Vec<String> = (0..100).map(|i| format!("k{i:03}=v{i}")).collect();
    let reply = client
        .send(&format!("ERROR|meta-heavy|h1|request error|{}", meta.join(",")))
        .await;
    assert!(reply.starts_with("OK:QUEUED:"), "got {reply}");
    drop(client);

    server.shutdown().await;

    let contents =
        std::fs::read_to_string(todays_file(dir.path(), "meta-heavy")).expect("meta-heavy file");
    let line = contents.lines().next().expect("stored line");
    for key in [
        "raw_length=",
        "parsed_at=",
        "client_ip=",
        "server_time=",
        "client_id=",
        "category=error",
        "processor_thread=",
        "processed_at=",
        "severity=high",
    ] {
        assert!(line.contains(key), "stored line missing {key}: {line}");
    }
}

#[tokio::test]
async fn e2e_concurrent_clients_no_loss_no_duplicates() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = start_server(dir.path(), 100, 2).await;
    let addr = server.local_addr();

    let mut tasks = Vec::new();
    for app in ["appA", "appB", "appC"] {
        tasks.push(tokio::spawn(async move {
            let mut client = TestClient::connect(addr).await;
            let mut ids = Vec::new();
            for i in 0..20 {
                let reply = client.send(&format!("INFO|{app}|host|m{i:02}|")).await;
                let id = reply
                    .strip_prefix("OK:QUEUED:")
                    .unwrap_or_else(|| panic!("unexpected reply {reply}"))
                    .to_string();
                ids.push(id);
            }
            assert_eq!(client.send("CMD:DISCONNECT").await, "OK:DISCONNECTING");
            ids
        }));
    }

    let mut all_ids = Vec::new();
    for task in tasks {
        all_ids.extend(task.await.expect("client task"));
    }
    assert_eq!(all_ids.len(), 60);
    let unique: HashSet<&String> = all_ids.iter().collect();
    assert_eq!(unique.len(), 60, "duplicate record ids assigned");

    server.shutdown().await;

    let mut total_lines = 0;
    for app in ["appA", "appB", "appC"] {
        let contents = std::fs::read_to_string(todays_file(dir.path(), app))
            .unwrap_or_else(|_| panic!("missing file for {app}"));
        let lines: Vec<&str> = contents.lines().collect();
        total_lines += lines.len();
        assert_eq!(lines.len(), 20, "{app} lost records");

        // every record sent by this client landed exactly once
        let stored: HashSet<u32> = lines.iter().map(|line| sequence_of(line)).collect();
        assert_eq!(stored, (0..20).collect::<HashSet<u32>>(), "{app} records mangled");
    }
    assert_eq!(total_lines, 60);
}

#[tokio::test]
async fn e2e_concurrent_clients_fifo_per_client() {
    // a single worker serialises the batches, so per-client order is
    // observable on disk
    let dir = tempfile::tempdir().expect("tempdir");
    let server = start_server(dir.path(), 100, 1).await;
    let addr = server.local_addr();

    let mut tasks = Vec::new();
    for app in ["fifoA", "fifoB"] {
        tasks.push(tokio::spawn(async move {
            let mut client = TestClient::connect(addr).await;
            for i in 0..20 {
                let reply = client.send(&format!("INFO|{app}|host|m{i:02}|")).await;
                assert!(reply.starts_with("OK:QUEUED:"), "got {reply}");
            }
        }));
    }
    for task in tasks {
        task.await.expect("client task");
    }

    server.shutdown().await;

    for app in ["fifoA", "fifoB"] {
        let contents = std::fs::read_to_string(todays_file(dir.path(), app))
            .unwrap_or_else(|_| panic!("missing file for {app}"));
        let sequences: Vec<u32> = contents.lines().map(sequence_of).collect();
        assert_eq!(sequences.len(), 20);
        assert!(
            sequences.windows(2).all(|w| w[0] < w[1]),
            "{app} out of order: {sequences:?}"
        );
    }
}

fn sequence_of(line: &str) -> u32 {
    line.split("- m")
        .nth(1)
        .and_then(|rest| rest.get(..2))
        .unwrap_or_else(|| panic!("malformed line: {line}"))
        .parse()
        .expect("sequence number")
}

#[tokio::test]
async fn e2e_greeting_carries_client_id() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = start_server(dir.path(), 16, 1).await;
    let client = TestClient::connect(server.local_addr()).await;

    // OK:CONNECTED:<ip>:<port>-<epoch-ms>
    let id = client.greeting.strip_prefix("OK:CONNECTED:").expect("prefix");
    let (endpoint, epoch) = id.rsplit_once('-').expect("separator");
    assert!(endpoint.contains(':'), "got {endpoint}");
    assert!(epoch.parse::<u64>().is_ok(), "got {epoch}");

    server.shutdown().await;
}
