use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::BookDraft;

/// Parsed command from SQL input.
///
/// Timestamps stay as the client sent them; the engine owns window parsing so
/// a missing bound and a malformed one are reported the same way on every
/// path.
#[derive(Debug, PartialEq)]
pub enum Command {
    ListBooks,
    GetBook {
        isbn: String,
    },
    InsertBook {
        draft: BookDraft,
    },
    DeleteBook {
        isbn: String,
    },
    InsertReservation {
        isbn: String,
        start: String,
        end: String,
    },
    ListReservations {
        isbn: String,
    },
    InsertCheckout {
        isbn: String,
        start: String,
        end: String,
    },
    CheckoutReservation {
        id: Ulid,
    },
    DeleteCheckout {
        isbn: String,
    },
    Search {
        lat: f64,
        lng: f64,
        radius_km: f64,
        start: String,
        end: String,
    },
}

const BOOK_COLUMNS: &[&str] = &["isbn", "library", "price", "lat", "lng"];
const WINDOW_COLUMNS: &[&str] = &["isbn", "start", "end"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "books" => {
            let row = InsertRow::new(insert, "books", BOOK_COLUMNS)?;
            let draft = BookDraft {
                isbn: row.string("isbn")?,
                library: row.string("library")?,
                price: row.opt_f64("price")?.unwrap_or(0.0),
                lat: row.opt_f64("lat")?,
                lng: row.opt_f64("lng")?,
            };
            Ok(Command::InsertBook { draft })
        }
        "reservations" => {
            let row = InsertRow::new(insert, "reservations", WINDOW_COLUMNS)?;
            Ok(Command::InsertReservation {
                isbn: row.string("isbn")?,
                start: row.string("start")?,
                end: row.string("end")?,
            })
        }
        "checkouts" => {
            let row = InsertRow::new(insert, "checkouts", WINDOW_COLUMNS)?;
            if let Some(expr) = row.get("reservation_id") {
                return Ok(Command::CheckoutReservation { id: parse_ulid_expr(expr)? });
            }
            Ok(Command::InsertCheckout {
                isbn: row.string("isbn")?,
                start: row.string("start")?,
                end: row.string("end")?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;

    match table.as_str() {
        "books" => Ok(Command::DeleteBook { isbn: extract_where_isbn(&delete.selection)? }),
        "checkouts" => Ok(Command::DeleteCheckout { isbn: extract_where_isbn(&delete.selection)? }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "books" => Ok(match filters.isbn {
            Some(isbn) => Command::GetBook { isbn },
            None => Command::ListBooks,
        }),
        "reservations" => Ok(Command::ListReservations {
            isbn: filters.isbn.ok_or(SqlError::MissingFilter("isbn"))?,
        }),
        "search" => Ok(Command::Search {
            lat: filters.lat.ok_or(SqlError::MissingFilter("lat"))?,
            lng: filters.lng.ok_or(SqlError::MissingFilter("lng"))?,
            radius_km: filters.radius_km.ok_or(SqlError::MissingFilter("radius_km"))?,
            start: filters.start.unwrap_or_default(),
            end: filters.end.unwrap_or_default(),
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Default)]
struct Filters {
    isbn: Option<String>,
    lat: Option<f64>,
    lng: Option<f64>,
    radius_km: Option<f64>,
    start: Option<String>,
    end: Option<String>,
}

/// Only conjunctions of the recognised column predicates are accepted;
/// anything else would silently widen the result.
fn extract_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    let (left, op, right) = match expr {
        Expr::Nested(inner) => return extract_filters(inner, filters),
        Expr::BinaryOp { left, op, right } => (left, op, right),
        other => return Err(SqlError::Unsupported(format!("WHERE predicate: {other}"))),
    };
    let column = expr_column_name(left);
    match (op, column.as_deref()) {
        (ast::BinaryOperator::And, _) => {
            extract_filters(left, filters)?;
            extract_filters(right, filters)?;
        }
        (ast::BinaryOperator::Eq, Some("isbn")) => filters.isbn = Some(parse_string_expr(right)?),
        (ast::BinaryOperator::Eq, Some("lat")) => filters.lat = Some(parse_f64_expr(right)?),
        (ast::BinaryOperator::Eq, Some("lng")) => filters.lng = Some(parse_f64_expr(right)?),
        (ast::BinaryOperator::Eq, Some("radius_km")) => {
            filters.radius_km = Some(parse_f64_expr(right)?)
        }
        (ast::BinaryOperator::GtEq, Some("start")) => {
            filters.start = Some(parse_string_expr(right)?)
        }
        (ast::BinaryOperator::LtEq, Some("end")) => filters.end = Some(parse_string_expr(right)?),
        _ => return Err(SqlError::Unsupported(format!("WHERE predicate: {expr}"))),
    }
    Ok(())
}

// ── Insert rows ───────────────────────────────────────────────

/// First VALUES row of an INSERT, addressable by column name. Without an
/// explicit column list, values bind positionally to the table's defaults.
struct InsertRow {
    columns: Vec<String>,
    values: Vec<Expr>,
}

impl InsertRow {
    fn new(
        insert: &ast::Insert,
        table: &'static str,
        defaults: &[&str],
    ) -> Result<Self, SqlError> {
        let values = extract_insert_values(insert)?;
        let columns: Vec<String> = if insert.columns.is_empty() {
            if values.len() > defaults.len() {
                return Err(SqlError::WrongArity(table, defaults.len(), values.len()));
            }
            defaults.iter().map(|c| c.to_string()).collect()
        } else {
            if insert.columns.len() != values.len() {
                return Err(SqlError::WrongArity(table, insert.columns.len(), values.len()));
            }
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        Ok(Self { columns, values })
    }

    fn get(&self, column: &str) -> Option<&Expr> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    /// Absent or NULL reads as empty; the engine decides whether that is allowed.
    fn string(&self, column: &str) -> Result<String, SqlError> {
        match self.get(column) {
            Some(expr) => parse_string_expr(expr),
            None => Ok(String::new()),
        }
    }

    fn opt_f64(&self, column: &str) -> Result<Option<f64>, SqlError> {
        match self.get(column) {
            Some(expr) if !is_null(expr) => parse_f64_expr(expr).map(Some),
            _ => Ok(None),
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_isbn(selection: &Option<Expr>) -> Result<String, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("isbn"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("isbn") => parse_string_expr(right),
        _ => Err(SqlError::MissingFilter("isbn")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

/// Keys and timestamps. Bare numbers are accepted for keys like ISBN-13s.
fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(Value::Null) => Ok(String::new()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_f64_expr(expr: &Expr) -> Result<f64, SqlError> {
    if let Expr::UnaryOp { op, expr: inner } = expr {
        return match op {
            ast::UnaryOperator::Minus => Ok(-parse_f64_expr(inner)?),
            ast::UnaryOperator::Plus => parse_f64_expr(inner),
            _ => Err(SqlError::Parse(format!("unexpected operator {op}"))),
        };
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad number {s:?}: {e}"))),
        Some(other) => Err(SqlError::Parse(format!("expected number, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string_expr(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad reservation id {s:?}: {e}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

    #[test]
    fn parse_select_books() {
        assert_eq!(parse_sql("SELECT * FROM books").unwrap(), Command::ListBooks);
        assert_eq!(
            parse_sql("SELECT * FROM books WHERE isbn = '978-0131103627'").unwrap(),
            Command::GetBook { isbn: "978-0131103627".into() }
        );
    }

    #[test]
    fn parse_insert_book() {
        let sql = "INSERT INTO books (isbn, library, price, lat, lng) VALUES ('978-0131103627', 'Central', 59.99, 43.6532, -79.3832)";
        match parse_sql(sql).unwrap() {
            Command::InsertBook { draft } => {
                assert_eq!(draft.isbn, "978-0131103627");
                assert_eq!(draft.library, "Central");
                assert_eq!(draft.price, 59.99);
                assert_eq!(draft.lat, Some(43.6532));
                assert_eq!(draft.lng, Some(-79.3832));
            }
            cmd => panic!("expected InsertBook, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_book_column_order_and_nulls() {
        let sql = "INSERT INTO books (lng, isbn, lat) VALUES (10.5, 9780131103627, NULL)";
        match parse_sql(sql).unwrap() {
            Command::InsertBook { draft } => {
                assert_eq!(draft.isbn, "9780131103627");
                assert_eq!(draft.library, "");
                assert_eq!(draft.price, 0.0);
                assert_eq!(draft.lat, None);
                assert_eq!(draft.lng, Some(10.5));
            }
            cmd => panic!("expected InsertBook, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_book_positional() {
        let sql = "INSERT INTO books VALUES ('a', 'Branch', '4.5', -1, 2)";
        match parse_sql(sql).unwrap() {
            Command::InsertBook { draft } => {
                assert_eq!(draft.price, 4.5);
                assert_eq!(draft.lat, Some(-1.0));
            }
            cmd => panic!("expected InsertBook, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_arity_mismatch() {
        let sql = "INSERT INTO books (isbn, library) VALUES ('a')";
        assert!(matches!(parse_sql(sql), Err(SqlError::WrongArity("books", 2, 1))));
        let sql = "INSERT INTO reservations VALUES ('a', 'b', 'c', 'd')";
        assert!(matches!(parse_sql(sql), Err(SqlError::WrongArity("reservations", 3, 4))));
    }

    #[test]
    fn parse_delete_book() {
        assert_eq!(
            parse_sql("DELETE FROM books WHERE isbn = 'a'").unwrap(),
            Command::DeleteBook { isbn: "a".into() }
        );
        assert!(matches!(
            parse_sql("DELETE FROM books WHERE library = 'a'"),
            Err(SqlError::MissingFilter("isbn"))
        ));
        assert!(matches!(parse_sql("DELETE FROM books"), Err(SqlError::MissingFilter("isbn"))));
    }

    #[test]
    fn parse_insert_reservation() {
        let sql = r#"INSERT INTO reservations (isbn, start, "end") VALUES ('a', '2024-01-01T10:00:00Z', '2024-01-01T11:00:00Z')"#;
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::InsertReservation {
                isbn: "a".into(),
                start: "2024-01-01T10:00:00Z".into(),
                end: "2024-01-01T11:00:00Z".into(),
            }
        );
    }

    #[test]
    fn parse_insert_reservation_missing_bound_is_empty() {
        let sql = "INSERT INTO reservations (isbn, start) VALUES ('a', '2024-01-01T10:00:00Z')";
        match parse_sql(sql).unwrap() {
            Command::InsertReservation { end, .. } => assert_eq!(end, ""),
            cmd => panic!("expected InsertReservation, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_select_reservations_requires_isbn() {
        assert_eq!(
            parse_sql("SELECT * FROM reservations WHERE isbn = 'a'").unwrap(),
            Command::ListReservations { isbn: "a".into() }
        );
        assert!(matches!(
            parse_sql("SELECT * FROM reservations"),
            Err(SqlError::MissingFilter("isbn"))
        ));
    }

    #[test]
    fn parse_checkouts() {
        let sql = r#"INSERT INTO checkouts (isbn, start, "end") VALUES ('a', '2024-01-01T10:00:00Z', '2024-01-01T11:00:00Z')"#;
        assert!(matches!(parse_sql(sql).unwrap(), Command::InsertCheckout { .. }));

        let sql = format!("INSERT INTO checkouts (reservation_id) VALUES ('{ID}')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::CheckoutReservation { id: Ulid::from_string(ID).unwrap() }
        );

        let sql = "INSERT INTO checkouts (reservation_id) VALUES ('nope')";
        assert!(matches!(parse_sql(sql), Err(SqlError::Parse(_))));

        assert_eq!(
            parse_sql("DELETE FROM checkouts WHERE isbn = 'a'").unwrap(),
            Command::DeleteCheckout { isbn: "a".into() }
        );
    }

    #[test]
    fn parse_search() {
        let sql = r#"SELECT * FROM search WHERE lat = 43.65 AND lng = -79.38 AND radius_km = 5 AND start >= '2024-01-01T10:00:00Z' AND "end" <= '2024-01-01T11:00:00Z'"#;
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::Search {
                lat: 43.65,
                lng: -79.38,
                radius_km: 5.0,
                start: "2024-01-01T10:00:00Z".into(),
                end: "2024-01-01T11:00:00Z".into(),
            }
        );
    }

    #[test]
    fn parse_search_without_window() {
        let sql = "SELECT * FROM search WHERE lat = 0 AND lng = 0 AND radius_km = 1";
        match parse_sql(sql).unwrap() {
            Command::Search { start, end, .. } => {
                assert!(start.is_empty());
                assert!(end.is_empty());
            }
            cmd => panic!("expected Search, got {cmd:?}"),
        }
        assert!(matches!(
            parse_sql("SELECT * FROM search WHERE lat = 0 AND lng = 0"),
            Err(SqlError::MissingFilter("radius_km"))
        ));
    }

    #[test]
    fn unhandled_where_predicates_rejected() {
        for sql in [
            "SELECT * FROM books WHERE isbn = 'a' OR isbn = 'b'",
            "SELECT * FROM books WHERE library = 'Central'",
            "SELECT * FROM books WHERE isbn LIKE 'a%'",
            "SELECT * FROM books WHERE isbn IN ('a', 'b')",
            r#"SELECT * FROM search WHERE lat = 0 AND lng = 0 AND radius_km = 1 AND "end" > '2024-01-01T10:00:00Z'"#,
        ] {
            assert!(matches!(parse_sql(sql), Err(SqlError::Unsupported(_))), "{sql}");
        }
        // Parentheses around a supported conjunction are fine.
        assert_eq!(
            parse_sql("SELECT * FROM books WHERE (isbn = 'a')").unwrap(),
            Command::GetBook { isbn: "a".into() }
        );
    }

    #[test]
    fn parse_unknown_table_errors() {
        assert!(matches!(
            parse_sql("INSERT INTO foobar (id) VALUES ('x')"),
            Err(SqlError::UnknownTable(_))
        ));
        assert!(matches!(
            parse_sql("SELECT * FROM availability"),
            Err(SqlError::UnknownTable(_))
        ));
    }

    #[test]
    fn parse_multi_row_insert_rejected() {
        let sql = "INSERT INTO books (isbn) VALUES ('a'), ('b')";
        assert!(matches!(parse_sql(sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
