use std::net::{TcpListener, TcpStream};
use std::process::Command;
use std::thread;
use std::time::Duration;

use tempfile::TempDir;

use sqlite_rx::{ClientConfig, ClientError, Params, SQLiteClient, ServerConfig, ServerProcess, Value};

const SERVER_BIN: &str = env!("CARGO_BIN_EXE_sqlite-server");

fn free_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    format!("tcp://{}", listener.local_addr().unwrap())
}

fn client(address: &str, retries: u32) -> SQLiteClient {
    let config = ClientConfig::new(address)
        .request_timeout(Duration::from_millis(1000))
        .retries(retries);
    SQLiteClient::connect(config).unwrap()
}

#[tokio::test]
async fn test_spawned_server_serves_queries() {
    let dir = TempDir::new().unwrap();
    let database = dir.path().join("process.db");
    let address = free_address();

    let config = ServerConfig::new(&address, database.to_str().unwrap());
    let mut process = ServerProcess::spawn(SERVER_BIN, &config).unwrap();
    process.wait_until_ready(Duration::from_secs(10)).unwrap();
    assert!(process.is_running());

    let mut client = client(&address, 3);
    let result = client
        .execute_script("CREATE TABLE kv (k TEXT PRIMARY KEY, v BLOB);")
        .await
        .unwrap();
    assert!(result.is_ok());

    let result = client
        .execute(
            "INSERT INTO kv VALUES (?, ?)",
            vec![Value::from("blob"), Value::Blob(vec![0, 1, 2, 255])],
        )
        .await
        .unwrap();
    assert_eq!(result.rowcount, Some(1));

    let result = client.execute("SELECT v FROM kv", Params::default()).await.unwrap();
    assert_eq!(result.items, vec![vec![Value::Blob(vec![0, 1, 2, 255])]]);

    process.stop().unwrap();
    assert!(!process.is_running());
}

#[tokio::test]
async fn test_killed_server_leaves_clients_with_a_connection_error() {
    let address = free_address();
    let config = ServerConfig::new(&address, ":memory:");
    let mut process = ServerProcess::spawn(SERVER_BIN, &config).unwrap();
    process.wait_until_ready(Duration::from_secs(10)).unwrap();

    let mut client = client(&address, 2);
    assert!(client.execute("SELECT 1", Params::default()).await.unwrap().is_ok());

    process.stop().unwrap();

    // Resend on the half-closed socket reads EOF, then the reconnect is refused
    match client.execute("SELECT 1", Params::default()).await {
        Err(ClientError::Connection { attempts, .. }) => assert_eq!(attempts, 2),
        other => panic!("expected a connection error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_independent_processes_do_not_share_state() {
    let first = free_address();
    let second = free_address();
    let _a = {
        let mut p = ServerProcess::spawn(SERVER_BIN, &ServerConfig::new(&first, ":memory:")).unwrap();
        p.wait_until_ready(Duration::from_secs(10)).unwrap();
        p
    };
    let _b = {
        let mut p = ServerProcess::spawn(SERVER_BIN, &ServerConfig::new(&second, ":memory:")).unwrap();
        p.wait_until_ready(Duration::from_secs(10)).unwrap();
        p
    };

    let mut a = client(&first, 3);
    let mut b = client(&second, 3);
    a.execute("CREATE TABLE only_here (x INTEGER)", Params::default())
        .await
        .unwrap();

    let result = b.execute("SELECT * FROM only_here", Params::default()).await.unwrap();
    assert_eq!(result.error.unwrap().kind, "sqlite.OperationalError");
}

#[test]
fn test_bad_configuration_exits_the_process() {
    let config = ServerConfig::new(free_address(), ":memory:").authentication(true);
    let mut process = ServerProcess::spawn(SERVER_BIN, &config).unwrap();
    assert!(process.wait_until_ready(Duration::from_secs(10)).is_err());
    assert!(!process.is_running());
}

#[cfg(unix)]
fn signal(process: &ServerProcess, name: &str) {
    let status = Command::new("kill")
        .arg(format!("-{name}"))
        .arg(process.id().to_string())
        .status()
        .unwrap();
    assert!(status.success());
}

#[cfg(unix)]
#[test]
fn test_termination_signals_stop_the_server_cleanly() {
    for name in ["TERM", "INT"] {
        let dir = TempDir::new().unwrap();
        let address = free_address();
        let config = ServerConfig::new(&address, dir.path().join("main.db").to_str().unwrap())
            .backup(dir.path().join("backup.db"), Duration::from_secs(600));
        let mut process = ServerProcess::spawn(SERVER_BIN, &config).unwrap();
        process.wait_until_ready(Duration::from_secs(10)).unwrap();
        thread::sleep(Duration::from_millis(200));

        signal(&process, name);
        let status = process
            .wait_for_exit(Duration::from_secs(5))
            .unwrap()
            .unwrap_or_else(|| panic!("server still running after SIG{name}"));
        assert_eq!(status.code(), Some(0), "SIG{name}");
        assert!(!process.is_running());

        let authority = address.trim_start_matches("tcp://");
        assert!(TcpStream::connect(authority).is_err(), "SIG{name}");
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_client_sees_a_connection_error_after_sigterm() {
    let address = free_address();
    let mut process = ServerProcess::spawn(SERVER_BIN, &ServerConfig::new(&address, ":memory:")).unwrap();
    process.wait_until_ready(Duration::from_secs(10)).unwrap();
    thread::sleep(Duration::from_millis(200));

    signal(&process, "TERM");
    assert!(process.wait_for_exit(Duration::from_secs(5)).unwrap().is_some());

    let mut client = client(&address, 2);
    let err = client.execute("SELECT 1", Params::default()).await.unwrap_err();
    assert!(matches!(err, ClientError::Connection { attempts: 2, .. }));
}
