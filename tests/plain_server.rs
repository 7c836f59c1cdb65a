use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use sqlite_rx::{
    ClientConfig, ClientFactory, ExecuteOptions, Params, SQLiteClient, SQLiteServer, ServerConfig,
    ServerError, Value,
};

// Start an in-process server on an ephemeral port
async fn start_server(
    config: ServerConfig,
) -> (String, oneshot::Sender<()>, JoinHandle<Result<(), ServerError>>) {
    let bound = SQLiteServer::new(config).unwrap().bind().await.unwrap();
    let address = format!("tcp://{}", bound.local_addr());
    let (stop, stopped) = oneshot::channel::<()>();
    let handle = tokio::spawn(bound.run(async move {
        let _ = stopped.await;
    }));
    (address, stop, handle)
}

fn client(address: &str) -> SQLiteClient {
    SQLiteClient::connect(ClientConfig::new(address).request_timeout(Duration::from_secs(5))).unwrap()
}

fn purchases() -> Vec<Vec<Value>> {
    let rows = [
        ("2006-03-28", "BUY", "IBM", 1000.0, 45.0),
        ("2006-04-05", "BUY", "MSFT", 1000.0, 72.0),
        ("2006-04-06", "SELL", "XOM", 500.0, 53.0),
    ];
    rows.iter()
        .cycle()
        .take(27)
        .map(|(date, trans, symbol, qty, price)| {
            vec![
                Value::from(*date),
                Value::from(*trans),
                Value::from(*symbol),
                Value::from(*qty),
                Value::from(*price),
            ]
        })
        .collect()
}

const CREATE_STOCKS: &str =
    "CREATE TABLE stocks (date text, trans text, symbol text, qty real, price real)";

#[tokio::test]
async fn test_table_creation_and_batch_insert() {
    let (address, stop, server) = start_server(ServerConfig::new("tcp://127.0.0.1:0", ":memory:")).await;
    let mut client = client(&address);

    // Create a table
    let result = client.execute(CREATE_STOCKS, Params::default()).await.unwrap();
    assert!(result.error.is_none());
    assert!(result.items.is_empty());
    assert_eq!(result.rowcount, None);

    // Insert 27 rows in one request
    let result = client
        .execute_many("INSERT INTO stocks VALUES (?,?,?,?,?)", purchases())
        .await
        .unwrap();
    assert!(result.error.is_none());
    assert!(result.items.is_empty());
    assert_eq!(result.rowcount, Some(27));

    // Read them back
    let result = client
        .execute("SELECT * FROM stocks WHERE symbol = ?", vec![Value::from("IBM")])
        .await
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(result.items.len(), 9);
    assert_eq!(result.items[0][4], Value::Real(45.0));

    stop.send(()).unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_missing_table_is_reported_not_raised() {
    let (address, stop, server) = start_server(ServerConfig::new("tcp://127.0.0.1:0", ":memory:")).await;
    let mut client = client(&address);

    let result = client.execute("SELECT * FROM IDOLS", Params::default()).await.unwrap();
    assert!(result.items.is_empty());
    let error = result.error.unwrap();
    assert_eq!(error.kind, "sqlite.OperationalError");
    assert!(error.message.ends_with("no such table: IDOLS"));

    // The loop keeps serving after a failed statement
    let result = client.execute("SELECT 42", Params::default()).await.unwrap();
    assert_eq!(result.items, vec![vec![Value::Integer(42)]]);

    stop.send(()).unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_update_and_script() {
    let (address, stop, server) = start_server(ServerConfig::new("tcp://127.0.0.1:0", ":memory:")).await;
    let mut client = client(&address);

    let script = "CREATE TABLE users(id INTEGER PRIMARY KEY, name TEXT, age INTEGER);
                  INSERT INTO users(name, age) VALUES ('ada', 36);
                  INSERT INTO users(name, age) VALUES ('alan', 41);
                  INSERT INTO users(name, age) VALUES ('grace', 85);";
    let result = client.execute_script(script).await.unwrap();
    assert!(result.is_ok());
    assert!(result.items.is_empty());

    let result = client
        .execute(
            "UPDATE users SET age = age + 1 WHERE age < ?",
            vec![Value::Integer(50)],
        )
        .await
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(result.rowcount, Some(2));
    assert_eq!(result.lastrowid, Some(3));

    let result = client
        .execute("SELECT name, age FROM users ORDER BY id", Params::default())
        .await
        .unwrap();
    assert_eq!(
        result.items,
        vec![
            vec![Value::from("ada"), Value::Integer(37)],
            vec![Value::from("alan"), Value::Integer(42)],
            vec![Value::from("grace"), Value::Integer(85)],
        ]
    );

    stop.send(()).unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_default_policy_denies_drop() {
    let (address, stop, server) = start_server(ServerConfig::new("tcp://127.0.0.1:0", ":memory:")).await;
    let mut client = client(&address);

    client.execute(CREATE_STOCKS, Params::default()).await.unwrap();
    let result = client.execute("DROP TABLE stocks", Params::default()).await.unwrap();
    let error = result.error.unwrap();
    assert_eq!(error.kind, "sqlite.DatabaseError");
    assert!(error.message.contains("not authorized"));

    // Still there
    let result = client.execute("SELECT * FROM stocks", Params::default()).await.unwrap();
    assert!(result.is_ok());
    assert!(result.items.is_empty());

    // Function calls are not in the default policy either
    let result = client.execute("SELECT COUNT(*) FROM stocks", Params::default()).await.unwrap();
    assert_eq!(result.error.unwrap().kind, "sqlite.DatabaseError");

    stop.send(()).unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_concurrent_workers_each_own_a_client() {
    let (address, stop, server) = start_server(ServerConfig::new("tcp://127.0.0.1:0", ":memory:")).await;
    let factory = ClientFactory::new(ClientConfig::new(&address)).unwrap();

    let mut setup = factory.client();
    setup
        .execute("CREATE TABLE hits (worker INTEGER, n INTEGER)", Params::default())
        .await
        .unwrap();

    let mut workers = Vec::new();
    for worker in 0..4i64 {
        let mut client = factory.client();
        workers.push(tokio::spawn(async move {
            for n in 0..10i64 {
                let result = client
                    .execute(
                        "INSERT INTO hits VALUES (?, ?)",
                        vec![Value::Integer(worker), Value::Integer(n)],
                    )
                    .await
                    .unwrap();
                assert_eq!(result.rowcount, Some(1));
            }
        }));
    }
    for worker in workers {
        worker.await.unwrap();
    }

    let result = setup.execute("SELECT worker, n FROM hits", Params::default()).await.unwrap();
    assert_eq!(result.items.len(), 40);

    stop.send(()).unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_execute_many_requires_batch_params() {
    let (address, stop, server) = start_server(ServerConfig::new("tcp://127.0.0.1:0", ":memory:")).await;
    let mut client = client(&address);

    client.execute(CREATE_STOCKS, Params::default()).await.unwrap();
    let result = client
        .execute_with(
            "INSERT INTO stocks VALUES (?,?,?,?,?)",
            vec![Value::from("2006-03-28")],
            ExecuteOptions::default().many(),
        )
        .await
        .unwrap();
    assert_eq!(result.error.unwrap().kind, "sqlite.ProgrammingError");

    stop.send(()).unwrap();
    server.await.unwrap().unwrap();
}
