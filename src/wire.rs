use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::copy::CopyHandler;
use pgwire::api::auth::StartupHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::engine::{EngineError, ErrorKind, LibraryEngine};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command};
use crate::window::format_timestamp;

pub struct LibraryHandler {
    engine: Arc<LibraryEngine>,
    query_parser: Arc<LibraryQueryParser>,
}

impl LibraryHandler {
    pub fn new(engine: Arc<LibraryEngine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(LibraryQueryParser),
        }
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, query: &str, format: &Format) -> PgWireResult<Response> {
        let cmd = match sql::parse_sql(query) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(QUERIES_TOTAL, "command" => "unparsed", "status" => "error")
                    .increment(1);
                return Err(sql_err(e));
            }
        };
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command, format: &Format) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::ListBooks => {
                let books = engine.list_catalog().await.map_err(engine_err)?;
                Ok(books_response(books, format))
            }
            Command::GetBook { isbn } => {
                let book = engine.get_book(&isbn).await.map_err(engine_err)?;
                Ok(books_response(vec![book], format))
            }
            Command::InsertBook { draft } => {
                engine.add_book(draft).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteBook { isbn } => {
                engine.delete_book(&isbn).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertReservation { isbn, start, end } => {
                let reservation = engine.reserve(&isbn, &start, &end).await.map_err(engine_err)?;
                // Echo the new row so the client learns the reservation id.
                Ok(reservations_response(vec![reservation], format))
            }
            Command::ListReservations { isbn } => {
                let reservations = engine.list_reservations(&isbn).await.map_err(engine_err)?;
                Ok(reservations_response(reservations, format))
            }
            Command::InsertCheckout { isbn, start, end } => {
                engine.checkout(&isbn, &start, &end).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::CheckoutReservation { id } => {
                engine.checkout_reservation(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteCheckout { isbn } => {
                engine.return_book(&isbn).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::Search { lat, lng, radius_km, start, end } => {
                let books = engine
                    .search(GeoPoint::new(lat, lng), radius_km, &start, &end)
                    .await
                    .map_err(engine_err)?;
                Ok(books_response(books, format))
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn schema(columns: &[(&str, Type)], format: &Format) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(i, (name, ty))| {
            FieldInfo::new(name.to_string(), None, None, ty.clone(), format.format_for(i))
        })
        .collect()
}

fn books_schema(format: &Format) -> Vec<FieldInfo> {
    schema(
        &[
            ("isbn", Type::VARCHAR),
            ("library", Type::VARCHAR),
            ("price", Type::FLOAT8),
            ("lat", Type::FLOAT8),
            ("lng", Type::FLOAT8),
        ],
        format,
    )
}

/// Window bounds are rendered as RFC 3339 UTC text.
fn reservations_schema(format: &Format) -> Vec<FieldInfo> {
    schema(
        &[
            ("id", Type::VARCHAR),
            ("isbn", Type::VARCHAR),
            ("start", Type::VARCHAR),
            ("end", Type::VARCHAR),
        ],
        format,
    )
}

fn books_response(books: Vec<Book>, format: &Format) -> Response {
    let schema = Arc::new(books_schema(format));
    let rows: Vec<PgWireResult<_>> = books
        .into_iter()
        .map(|book| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&book.isbn)?;
            encoder.encode_field(&book.library)?;
            encoder.encode_field(&book.price)?;
            encoder.encode_field(&book.position.lat)?;
            encoder.encode_field(&book.position.lng)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn reservations_response(reservations: Vec<Reservation>, format: &Format) -> Response {
    let schema = Arc::new(reservations_schema(format));
    let rows: Vec<PgWireResult<_>> = reservations
        .into_iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.isbn)?;
            encoder.encode_field(&format_timestamp(r.span.start))?;
            encoder.encode_field(&format_timestamp(r.span.end))?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Row description for a statement, judged from its target table. Used when
/// describing prepared statements whose parameters are not bound yet.
fn result_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    let mut words = upper
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty());
    let verb = words.next().unwrap_or_default();
    let table = words
        .skip_while(|w| *w != "FROM" && *w != "INTO")
        .nth(1)
        .unwrap_or_default();
    match (verb, table) {
        ("SELECT", "RESERVATIONS") | ("INSERT", "RESERVATIONS") => reservations_schema(format),
        ("SELECT", "BOOKS") | ("SELECT", "SEARCH") => books_schema(format),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for LibraryHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query, &Format::UnifiedText).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct LibraryQueryParser;

#[async_trait]
impl QueryParser for LibraryQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt, column_format.unwrap_or(&Format::UnifiedText)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for LibraryHandler {
    type Statement = String;
    type QueryParser = LibraryQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        self.run(&sql, &portal.result_column_format).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement, &Format::UnifiedText),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
            &target.result_column_format,
        )))
    }
}

/// Byte ranges and indexes of `$N` placeholders outside quoted literals and
/// quoted identifiers.
fn placeholders(sql: &str) -> Vec<(usize, usize, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"') => {
                // A doubled quote closes and reopens, which lands in the same place.
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
                i += 1;
            }
            b'$' => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    found.push((start, i, n));
                }
            }
            _ => i += 1,
        }
    }
    found
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, _, n)| n).max().unwrap_or(0)
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text
/// format) in one left-to-right pass. Bound values are never rescanned.
fn substitute_params<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (start, end, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|idx| params.get(idx)) else {
            continue;
        };
        out.push_str(&sql[copied..start]);
        match param {
            Some(value) => {
                let text = String::from_utf8_lossy(value.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        copied = end;
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct LibraryFactory {
    handler: Arc<LibraryHandler>,
    noop: Arc<NoopHandler>,
}

impl LibraryFactory {
    pub fn new(engine: Arc<LibraryEngine>) -> Self {
        Self {
            handler: Arc::new(LibraryHandler::new(engine)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for LibraryFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.noop.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<LibraryEngine>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(LibraryFactory::new(engine));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE for an engine error. Conflicts name the violated constraint.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e.kind() {
        ErrorKind::InvalidArgument => "22023",
        ErrorKind::NotFound => "P0002",
        ErrorKind::Conflict => match e {
            EngineError::DuplicateBook(_) | EngineError::AlreadyCheckedOut { .. } => "23505",
            EngineError::Overlap { .. } => "23P01",
            _ => "55000",
        },
        ErrorKind::StoreError => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn text_schema(sql: &str) -> Vec<FieldInfo> {
        result_schema(sql, &Format::UnifiedText)
    }

    fn names(schema: &[FieldInfo]) -> Vec<String> {
        schema.iter().map(|f| f.name().to_string()).collect()
    }

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM books"), 0);
        assert_eq!(count_params("SELECT * FROM books WHERE isbn = $1"), 1);
        assert_eq!(
            count_params(r#"INSERT INTO reservations (isbn, start, "end") VALUES ($1, $3, $2)"#),
            3
        );
        assert_eq!(count_params("SELECT '$' FROM books"), 0);
    }

    #[test]
    fn substitute_params_quotes_and_orders() {
        let params: Vec<Option<Vec<u8>>> = (1..=10)
            .map(|i| Some(format!("v{i}").into_bytes()))
            .collect();
        let sql = substitute_params("SELECT $1, $10", &params);
        assert_eq!(sql, "SELECT 'v1', 'v10'");

        let params: Vec<Option<&[u8]>> = vec![Some(&b"O'Reilly"[..]), None];
        assert_eq!(substitute_params("$1 $2", &params), "'O''Reilly' NULL");
    }

    #[test]
    fn bound_values_are_not_rescanned() {
        let params: Vec<Option<&[u8]>> = vec![Some(&b"978"[..]), Some(&b"Branch $1"[..])];
        let sql = substitute_params("INSERT INTO books (isbn, library) VALUES ($1, $2)", &params);
        assert_eq!(sql, "INSERT INTO books (isbn, library) VALUES ('978', 'Branch $1')");
        assert_eq!(
            sql::parse_sql(&sql).unwrap(),
            Command::InsertBook {
                draft: BookDraft {
                    isbn: "978".into(),
                    library: "Branch $1".into(),
                    price: 0.0,
                    lat: None,
                    lng: None,
                },
            }
        );

        let params: Vec<Option<&[u8]>> = vec![Some(&b"$2"[..]), Some(&b"x"[..])];
        assert_eq!(substitute_params("$1 $2", &params), "'$2' 'x'");
    }

    #[test]
    fn placeholders_inside_quotes_are_literal_text() {
        let params: Vec<Option<&[u8]>> = vec![Some(&b"a"[..])];
        assert_eq!(
            substitute_params("SELECT * FROM books WHERE isbn = '$1' AND \"$1\" = $1", &params),
            "SELECT * FROM books WHERE isbn = '$1' AND \"$1\" = 'a'"
        );
        assert_eq!(
            substitute_params("SELECT 'it''s $1', $1", &params),
            "SELECT 'it''s $1', 'a'"
        );
        assert_eq!(count_params("SELECT '$5' FROM books WHERE isbn = $1"), 1);
        // Unbound indexes are left as written.
        assert_eq!(substitute_params("$1 $3", &params), "'a' $3");
    }

    #[test]
    fn result_schema_by_table() {
        assert_eq!(
            names(&text_schema("SELECT * FROM books")),
            vec!["isbn", "library", "price", "lat", "lng"]
        );
        assert_eq!(names(&text_schema("select * from search where lat = $1")).len(), 5);
        assert_eq!(
            names(&text_schema("SELECT * FROM reservations WHERE isbn = $1")),
            vec!["id", "isbn", "start", "end"]
        );
        assert_eq!(
            names(&text_schema(r#"INSERT INTO reservations (isbn, start, "end") VALUES ($1, $2, $3)"#)),
            vec!["id", "isbn", "start", "end"]
        );
        assert_eq!(
            names(&text_schema(r#"INSERT INTO reservations(isbn, start, "end") VALUES ($1,$2,$3)"#)),
            vec!["id", "isbn", "start", "end"]
        );
        assert_eq!(names(&text_schema(r#"SELECT * FROM "books";"#)).len(), 5);
        assert!(text_schema("INSERT INTO books (isbn) VALUES ($1)").is_empty());
        assert!(text_schema("DELETE FROM checkouts WHERE isbn = $1").is_empty());
        // Table name inside a literal is not the target.
        assert_eq!(
            names(&text_schema("SELECT * FROM books WHERE isbn = 'reservations'")).len(),
            5
        );
    }

    #[test]
    fn sqlstate_by_kind() {
        let span = Span::new(0, 1);
        assert_eq!(sqlstate(&EngineError::MissingField("isbn")), "22023");
        assert_eq!(sqlstate(&EngineError::BookNotFound("a".into())), "P0002");
        assert_eq!(sqlstate(&EngineError::DuplicateBook("a".into())), "23505");
        assert_eq!(
            sqlstate(&EngineError::Overlap { isbn: "a".into(), existing: Ulid::new(), span }),
            "23P01"
        );
        assert_eq!(sqlstate(&EngineError::NotCheckedOut("a".into())), "55000");
        assert_eq!(sqlstate(&EngineError::WalError("disk".into())), "58030");
    }
}
