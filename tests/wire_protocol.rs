use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

use libreserve::engine::Engine;
use libreserve::store::LibraryStore;
use libreserve::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server(store: LibraryStore) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let engine = Arc::new(Engine::new(Arc::new(store)));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("library")
        .user("librarian");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

/// Text rows from a simple query.
async fn rows(client: &Client, sql: &str) -> Vec<Vec<String>> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(
                (0..row.len())
                    .map(|i| row.get(i).unwrap_or_default().to_string())
                    .collect(),
            ),
            _ => None,
        })
        .collect()
}

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.code().map(|c| c.code().to_string()).unwrap_or_default()
}

const TORONTO: &str = "INSERT INTO books (isbn, library, price, lat, lng) VALUES ('978-0131103627', 'Toronto Reference', 59.99, 43.6532, -79.3832)";
const HAMILTON: &str = "INSERT INTO books (isbn, library, price, lat, lng) VALUES ('978-0262033848', 'Hamilton Central', 89.5, 43.2557, -79.8711)";

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn catalog_round_trip() {
    let addr = start_test_server(LibraryStore::in_memory()).await;
    let client = connect(addr).await;

    client.batch_execute(TORONTO).await.unwrap();
    client.batch_execute(HAMILTON).await.unwrap();

    let books = rows(&client, "SELECT * FROM books").await;
    assert_eq!(books.len(), 2);
    assert_eq!(books[0][0], "978-0131103627");
    assert_eq!(books[0][1], "Toronto Reference");
    assert_eq!(books[0][2].parse::<f64>().unwrap(), 59.99);
    assert_eq!(books[0][3].parse::<f64>().unwrap(), 43.6532);

    let one = rows(&client, "SELECT * FROM books WHERE isbn = '978-0262033848'").await;
    assert_eq!(one.len(), 1);
    assert_eq!(one[0][1], "Hamilton Central");

    client
        .batch_execute("DELETE FROM books WHERE isbn = '978-0262033848'")
        .await
        .unwrap();
    assert_eq!(
        sqlstate(&client, "SELECT * FROM books WHERE isbn = '978-0262033848'").await,
        "P0002"
    );
    assert_eq!(
        sqlstate(&client, "DELETE FROM books WHERE isbn = '978-0262033848'").await,
        "P0002"
    );
}

#[tokio::test]
async fn errors_carry_sqlstate() {
    let addr = start_test_server(LibraryStore::in_memory()).await;
    let client = connect(addr).await;
    client.batch_execute(TORONTO).await.unwrap();

    assert_eq!(sqlstate(&client, TORONTO).await, "23505");
    assert_eq!(
        sqlstate(&client, "INSERT INTO books (isbn, lat) VALUES ('x', 1)").await,
        "22023"
    );
    assert_eq!(sqlstate(&client, "SELECT * FROM nowhere").await, "42601");
    assert_eq!(
        sqlstate(&client, "DELETE FROM checkouts WHERE isbn = '978-0131103627'").await,
        "55000"
    );
    let err = client
        .simple_query(r#"INSERT INTO reservations (isbn, start, "end") VALUES ('978-0131103627', '', '2024-01-01T10:00:00Z')"#)
        .await
        .unwrap_err();
    let db = err.as_db_error().unwrap();
    assert_eq!(db.code().code(), "22023");
    assert_eq!(db.message(), "empty time range not supported");
}

#[tokio::test]
async fn reserve_checkout_return_flow() {
    let addr = start_test_server(LibraryStore::in_memory()).await;
    let client = connect(addr).await;
    client.batch_execute(TORONTO).await.unwrap();

    let created = rows(
        &client,
        r#"INSERT INTO reservations (isbn, start, "end") VALUES ('978-0131103627', '2024-01-01T10:00:00Z', '2024-01-01T11:00:00Z')"#,
    )
    .await;
    assert_eq!(created.len(), 1);
    let id = Ulid::from_string(&created[0][0]).unwrap();
    assert_eq!(created[0][2], "2024-01-01T10:00:00.000Z");
    assert_eq!(created[0][3], "2024-01-01T11:00:00.000Z");

    // Overlap is rejected with the exclusion-violation code.
    assert_eq!(
        sqlstate(
            &client,
            r#"INSERT INTO reservations (isbn, start, "end") VALUES ('978-0131103627', '2024-01-01T10:30:00Z', '2024-01-01T12:00:00Z')"#,
        )
        .await,
        "23P01"
    );
    // Touching is fine.
    client
        .batch_execute(r#"INSERT INTO reservations (isbn, start, "end") VALUES ('978-0131103627', '2024-01-01T11:00:00Z', '2024-01-01T12:00:00Z')"#)
        .await
        .unwrap();

    let listed = rows(&client, "SELECT * FROM reservations WHERE isbn = '978-0131103627'").await;
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0][0], id.to_string());

    // Non-matching window: not found.
    assert_eq!(
        sqlstate(
            &client,
            r#"INSERT INTO checkouts (isbn, start, "end") VALUES ('978-0131103627', '2024-01-01T10:00:00Z', '2024-01-01T10:30:00Z')"#,
        )
        .await,
        "P0002"
    );

    client
        .batch_execute(&format!("INSERT INTO checkouts (reservation_id) VALUES ('{id}')"))
        .await
        .unwrap();
    assert_eq!(
        sqlstate(
            &client,
            r#"INSERT INTO checkouts (isbn, start, "end") VALUES ('978-0131103627', '2024-01-01T10:00:00Z', '2024-01-01T11:00:00Z')"#,
        )
        .await,
        "23505"
    );
    assert_eq!(
        sqlstate(&client, "DELETE FROM books WHERE isbn = '978-0131103627'").await,
        "55000"
    );

    client
        .batch_execute("DELETE FROM checkouts WHERE isbn = '978-0131103627'")
        .await
        .unwrap();
    assert_eq!(
        sqlstate(&client, "DELETE FROM checkouts WHERE isbn = '978-0131103627'").await,
        "55000"
    );
}

#[tokio::test]
async fn search_excludes_reserved_books() {
    let addr = start_test_server(LibraryStore::in_memory()).await;
    let client = connect(addr).await;
    client.batch_execute(TORONTO).await.unwrap();
    client.batch_execute(HAMILTON).await.unwrap();

    let search = |start: &str, end: &str| {
        format!(
            r#"SELECT * FROM search WHERE lat = 43.6532 AND lng = -79.3832 AND radius_km = 100 AND start >= '{start}' AND "end" <= '{end}'"#
        )
    };

    let hits = rows(&client, &search("2024-01-01T10:00:00Z", "2024-01-01T11:00:00Z")).await;
    let isbns: Vec<&str> = hits.iter().map(|r| r[0].as_str()).collect();
    assert_eq!(isbns, vec!["978-0131103627", "978-0262033848"]);

    client
        .batch_execute(r#"INSERT INTO reservations (isbn, start, "end") VALUES ('978-0131103627', '2024-01-01T09:00:00Z', '2024-01-01T10:30:00Z')"#)
        .await
        .unwrap();

    let hits = rows(&client, &search("2024-01-01T10:00:00Z", "2024-01-01T11:00:00Z")).await;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0][0], "978-0262033848");

    let hits = rows(&client, &search("2024-01-01T10:30:00Z", "2024-01-01T11:00:00Z")).await;
    assert_eq!(hits.len(), 2);

    assert_eq!(
        sqlstate(
            &client,
            "SELECT * FROM search WHERE lat = 43.6532 AND lng = -79.3832 AND radius_km = 100"
        )
        .await,
        "22023"
    );
}

#[tokio::test]
async fn extended_protocol_with_parameters() {
    let addr = start_test_server(LibraryStore::in_memory()).await;
    let client = connect(addr).await;
    client.batch_execute(TORONTO).await.unwrap();

    let created = client
        .query(
            r#"INSERT INTO reservations (isbn, start, "end") VALUES ($1, $2, $3)"#,
            &[&"978-0131103627", &"2024-01-01T10:00:00Z", &"2024-01-01T11:00:00Z"],
        )
        .await
        .unwrap();
    assert_eq!(created.len(), 1);
    let id: String = created[0].get("id");
    assert!(Ulid::from_string(&id).is_ok());

    let listed = client
        .query("SELECT * FROM reservations WHERE isbn = $1", &[&"978-0131103627"])
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    let start: String = listed[0].get("start");
    assert_eq!(start, "2024-01-01T10:00:00.000Z");

    let books = client
        .query("SELECT * FROM books WHERE isbn = $1", &[&"978-0131103627"])
        .await
        .unwrap();
    let price: f64 = books[0].get("price");
    assert_eq!(price, 59.99);

    // No space between table and column list; the echoed row is still described.
    let created = client
        .query(
            r#"INSERT INTO reservations(isbn,start,"end") VALUES ($1,$2,$3)"#,
            &[&"978-0131103627", &"2024-01-02T10:00:00Z", &"2024-01-02T11:00:00Z"],
        )
        .await
        .unwrap();
    assert_eq!(created.len(), 1);
    let isbn: String = created[0].get("isbn");
    assert_eq!(isbn, "978-0131103627");

    // A bound value that looks like a placeholder is stored verbatim.
    client
        .execute(
            "INSERT INTO books (isbn, library, price, lat, lng) VALUES ($1, $2, 1, 0, 0)",
            &[&"978-1", &"Branch $1"],
        )
        .await
        .unwrap();
    let books = client
        .query("SELECT * FROM books WHERE isbn = $1", &[&"978-1"])
        .await
        .unwrap();
    let library: String = books[0].get("library");
    assert_eq!(library, "Branch $1");

    let err = client
        .query("SELECT * FROM books WHERE isbn = $1", &[&"nope"])
        .await
        .unwrap_err();
    assert_eq!(err.code().map(|c| c.code()), Some("P0002"));
}

#[tokio::test]
async fn state_survives_server_restart() {
    let dir = std::env::temp_dir().join(format!("libreserve_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("library.wal");

    {
        let addr = start_test_server(LibraryStore::open(&path).unwrap()).await;
        let client = connect(addr).await;
        client.batch_execute(TORONTO).await.unwrap();
        client
            .batch_execute(r#"INSERT INTO reservations (isbn, start, "end") VALUES ('978-0131103627', '2024-01-01T10:00:00Z', '2024-01-01T11:00:00Z')"#)
            .await
            .unwrap();
    }

    let addr = start_test_server(LibraryStore::open(&path).unwrap()).await;
    let client = connect(addr).await;
    assert_eq!(rows(&client, "SELECT * FROM books").await.len(), 1);
    assert_eq!(
        sqlstate(
            &client,
            r#"INSERT INTO reservations (isbn, start, "end") VALUES ('978-0131103627', '2024-01-01T10:00:00Z', '2024-01-01T11:00:00Z')"#,
        )
        .await,
        "23P01"
    );
}
