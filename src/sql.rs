use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::TemplateDraft;
use crate::model::*;

/// Parsed command from one protocol line.
///
/// Every engine operation maps onto an INSERT, DELETE or SELECT against a
/// virtual table; nothing here is a real relational store.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertPark {
        id: Ulid,
        name: String,
        schedule: ParkSchedule,
    },
    SelectParks {
        id: Option<Ulid>,
    },
    /// Creates the template, or replaces it when the id already exists.
    InsertTemplate {
        id: Ulid,
        draft: TemplateDraft,
    },
    DeleteTemplate {
        id: Ulid,
    },
    SelectTemplates {
        park_id: Ulid,
        active_on: Option<NaiveDate>,
    },
    InsertPrice {
        pricing_id: Ulid,
        amount: Money,
    },
    DeletePrice {
        pricing_id: Ulid,
    },
    SelectHours {
        park_id: Ulid,
        date: NaiveDate,
    },
    Materialize {
        park_id: Ulid,
        date: NaiveDate,
    },
    SelectSlots {
        park_id: Ulid,
        date: NaiveDate,
    },
    SelectInstances {
        park_id: Ulid,
        date: NaiveDate,
    },
    SelectAvailability {
        instance_id: Ulid,
    },
    // Quantities stay signed until the engine validates them.
    Reserve {
        instance_id: Ulid,
        quantity: i64,
    },
    Release {
        instance_id: Ulid,
        quantity: i64,
    },
    InsertLine {
        id: Ulid,
        cart_id: Ulid,
        instance_id: Ulid,
        pricing_id: Ulid,
        quantity: i64,
    },
    ResizeLine {
        line_id: Ulid,
        quantity: i64,
    },
    DeleteLine {
        line_id: Ulid,
    },
    SelectLines {
        cart_id: Option<Ulid>,
        line_id: Option<Ulid>,
    },
    ConfirmLine {
        line_id: Ulid,
    },
    Checkout {
        cart_id: Ulid,
    },
    CancelLine {
        line_id: Ulid,
    },
    UseLine {
        line_id: Ulid,
    },
    AbandonCart {
        cart_id: Ulid,
    },
    ExpireHolds,
}

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

fn arity(table: &'static str, values: &[Expr], expected: usize) -> Result<(), SqlError> {
    if values.len() < expected {
        return Err(SqlError::WrongArity(table, expected, values.len()));
    }
    Ok(())
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "parks" => {
            arity("parks", &values, 3)?;
            let schedule = serde_json::from_str(&parse_string(&values[2])?)
                .map_err(|e| SqlError::Parse(format!("bad schedule: {e}")))?;
            Ok(Command::InsertPark {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                schedule,
            })
        }
        "templates" => {
            arity("templates", &values, 8)?;
            let draft = TemplateDraft {
                park_id: parse_ulid(&values[1])?,
                start_time: parse_string(&values[2])?,
                end_time: parse_string(&values[3])?,
                days_of_week: parse_weekday_list(&values[4])?,
                valid_from: parse_date_expr(&values[5])?,
                valid_until: parse_date_or_null(&values[6])?,
                ticket_limit: parse_u32(&values[7])?,
                price_adjustment: values.get(8).map(parse_i64).transpose()?.unwrap_or(0),
                pricing_ids: values.get(9).map(parse_ulid_list).transpose()?.unwrap_or_default(),
            };
            Ok(Command::InsertTemplate {
                id: parse_ulid(&values[0])?,
                draft,
            })
        }
        "prices" => {
            arity("prices", &values, 2)?;
            Ok(Command::InsertPrice {
                pricing_id: parse_ulid(&values[0])?,
                amount: parse_i64(&values[1])?,
            })
        }
        "materializations" => {
            arity("materializations", &values, 2)?;
            Ok(Command::Materialize {
                park_id: parse_ulid(&values[0])?,
                date: parse_date_expr(&values[1])?,
            })
        }
        "reservations" => {
            arity("reservations", &values, 2)?;
            Ok(Command::Reserve {
                instance_id: parse_ulid(&values[0])?,
                quantity: parse_i64(&values[1])?,
            })
        }
        "releases" => {
            arity("releases", &values, 2)?;
            Ok(Command::Release {
                instance_id: parse_ulid(&values[0])?,
                quantity: parse_i64(&values[1])?,
            })
        }
        "cart_lines" => {
            arity("cart_lines", &values, 5)?;
            Ok(Command::InsertLine {
                id: parse_ulid(&values[0])?,
                cart_id: parse_ulid(&values[1])?,
                instance_id: parse_ulid(&values[2])?,
                pricing_id: parse_ulid(&values[3])?,
                quantity: parse_i64(&values[4])?,
            })
        }
        "resizes" => {
            arity("resizes", &values, 2)?;
            Ok(Command::ResizeLine {
                line_id: parse_ulid(&values[0])?,
                quantity: parse_i64(&values[1])?,
            })
        }
        "confirmations" => {
            arity("confirmations", &values, 1)?;
            Ok(Command::ConfirmLine {
                line_id: parse_ulid(&values[0])?,
            })
        }
        "checkouts" => {
            arity("checkouts", &values, 1)?;
            Ok(Command::Checkout {
                cart_id: parse_ulid(&values[0])?,
            })
        }
        "cancellations" => {
            arity("cancellations", &values, 1)?;
            Ok(Command::CancelLine {
                line_id: parse_ulid(&values[0])?,
            })
        }
        "usages" => {
            arity("usages", &values, 1)?;
            Ok(Command::UseLine {
                line_id: parse_ulid(&values[0])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table == "expired_holds" {
        return Ok(Command::ExpireHolds);
    }
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "templates" => Ok(Command::DeleteTemplate { id }),
        "prices" => Ok(Command::DeletePrice { pricing_id: id }),
        "cart_lines" => Ok(Command::DeleteLine { line_id: id }),
        "carts" => Ok(Command::AbandonCart { cart_id: id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `col = value` pairs from a WHERE clause joined by AND.
struct Filters(Vec<(String, Expr)>);

impl Filters {
    fn collect(selection: Option<&Expr>) -> Self {
        let mut pairs = Vec::new();
        if let Some(expr) = selection {
            collect_eq(expr, &mut pairs);
        }
        Filters(pairs)
    }

    fn get(&self, column: &str) -> Option<&Expr> {
        self.0.iter().find(|(c, _)| c == column).map(|(_, e)| e)
    }

    fn ulid(&self, column: &'static str) -> Result<Option<Ulid>, SqlError> {
        self.get(column).map(parse_ulid).transpose()
    }

    fn date(&self, column: &'static str) -> Result<Option<NaiveDate>, SqlError> {
        self.get(column).map(parse_date_expr).transpose()
    }

    fn require_ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        self.ulid(column)?.ok_or(SqlError::MissingFilter(column))
    }

    fn require_date(&self, column: &'static str) -> Result<NaiveDate, SqlError> {
        self.date(column)?.ok_or(SqlError::MissingFilter(column))
    }
}

fn collect_eq(expr: &Expr, pairs: &mut Vec<(String, Expr)>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq(left, pairs);
            collect_eq(right, pairs);
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if let Some(col) = expr_column_name(left) {
                pairs.push((col, right.as_ref().clone()));
            }
        }
        Expr::Nested(inner) => collect_eq(inner, pairs),
        _ => {}
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = Filters::collect(select.selection.as_ref());

    match table.as_str() {
        "parks" => Ok(Command::SelectParks {
            id: filters.ulid("id")?,
        }),
        "templates" => Ok(Command::SelectTemplates {
            park_id: filters.require_ulid("park_id")?,
            active_on: filters.date("day")?,
        }),
        "hours" => Ok(Command::SelectHours {
            park_id: filters.require_ulid("park_id")?,
            date: filters.require_date("day")?,
        }),
        "slots" => Ok(Command::SelectSlots {
            park_id: filters.require_ulid("park_id")?,
            date: filters.require_date("day")?,
        }),
        "instances" => Ok(Command::SelectInstances {
            park_id: filters.require_ulid("park_id")?,
            date: filters.require_date("day")?,
        }),
        "availability" => Ok(Command::SelectAvailability {
            instance_id: filters.require_ulid("instance_id")?,
        }),
        "cart_lines" => {
            let cart_id = filters.ulid("cart_id")?;
            let line_id = filters.ulid("id")?;
            if cart_id.is_none() && line_id.is_none() {
                return Err(SqlError::MissingFilter("cart_id"));
            }
            Ok(Command::SelectLines { cart_id, line_id })
        }
        _ => Err(SqlError::UnknownTable(table)),
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

/// First VALUES row. Multi-row inserts are not part of the protocol.
fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row.clone()),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("multi-row VALUES".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    Filters::collect(selection.as_ref()).require_ulid("id")
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

/// Comma-separated ULIDs in one string; empty string means none.
fn parse_ulid_list(expr: &Expr) -> Result<Vec<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(Vec::new());
    }
    parse_string(expr)?
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}"))))
        .collect()
}

/// Comma-separated weekday numbers, 0 = Sunday.
fn parse_weekday_list(expr: &Expr) -> Result<Vec<u8>, SqlError> {
    parse_string(expr)?
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u8>().map_err(|_| SqlError::Parse(format!("bad weekday number: {s:?}"))))
        .collect()
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    parse_date(&parse_string(expr)?).map_err(|e| SqlError::Parse(e.to_string()))
}

fn parse_date_or_null(expr: &Expr) -> Result<Option<NaiveDate>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_date_expr(expr).map(Some)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty command")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
