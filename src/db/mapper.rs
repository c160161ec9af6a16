//! Conversion of fetched rows and cells into caller types.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::marker::PhantomData;

use super::row::{CellValue, Row};
use crate::error::CastError;

/// Materialized result of one plan invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    Rows(Vec<Row>),
    Row(Row),
    Scalar(CellValue),
    /// Zero rows where the query allows it.
    Null,
}

impl QueryValue {
    pub fn kind(&self) -> String {
        match self {
            QueryValue::Rows(rows) => format!("sequence of {} rows", rows.len()),
            QueryValue::Row(_) => "row".to_string(),
            QueryValue::Scalar(cell) => cell.kind().to_string(),
            QueryValue::Null => "null".to_string(),
        }
    }

    pub fn into_rows(self) -> Result<Vec<Row>, CastError> {
        match self {
            QueryValue::Rows(rows) => Ok(rows),
            other => Err(CastError::new::<Vec<Row>>(other.kind())),
        }
    }

    /// Map a single-row result into an entity type.
    pub fn into_entity<T: FromRow>(self) -> Result<T, CastError> {
        match self {
            QueryValue::Row(row) => T::from_row(&row),
            other => Err(CastError::new::<T>(other.kind())),
        }
    }

    /// Like [`Self::into_entity`], with zero rows mapped to `None`.
    pub fn into_optional<T: FromRow>(self) -> Result<Option<T>, CastError> {
        match self {
            QueryValue::Null => Ok(None),
            other => other.into_entity().map(Some),
        }
    }
}

/// Conversion from one cell.
pub trait FromCell: Sized {
    fn from_cell(cell: &CellValue) -> Result<Self, CastError>;
}

/// Conversion from a whole row, typically by column name.
pub trait FromRow: Sized {
    fn from_row(row: &Row) -> Result<Self, CastError>;
}

impl FromRow for Row {
    fn from_row(row: &Row) -> Result<Self, CastError> {
        Ok(row.clone())
    }
}

impl Row {
    /// Typed column lookup by name.
    pub fn get_as<T: FromCell>(&self, name: &str) -> Result<T, CastError> {
        match self.get_by_name(name) {
            Some(cell) => T::from_cell(cell),
            None => Err(CastError::new::<T>(format!("missing column `{}`", name))),
        }
    }
}

impl<T: FromCell> FromCell for Option<T> {
    fn from_cell(cell: &CellValue) -> Result<Self, CastError> {
        match cell {
            CellValue::Null => Ok(None),
            other => T::from_cell(other).map(Some),
        }
    }
}

impl FromCell for CellValue {
    fn from_cell(cell: &CellValue) -> Result<Self, CastError> {
        Ok(cell.clone())
    }
}

impl FromCell for bool {
    fn from_cell(cell: &CellValue) -> Result<Self, CastError> {
        match cell {
            CellValue::Bool(b) => Ok(*b),
            other => Err(CastError::new::<Self>(other.kind())),
        }
    }
}

impl FromCell for i16 {
    fn from_cell(cell: &CellValue) -> Result<Self, CastError> {
        match cell {
            CellValue::Int16(i) => Ok(*i),
            other => Err(CastError::new::<Self>(other.kind())),
        }
    }
}

impl FromCell for i32 {
    fn from_cell(cell: &CellValue) -> Result<Self, CastError> {
        match cell {
            CellValue::Int16(i) => Ok(*i as i32),
            CellValue::Int32(i) => Ok(*i),
            other => Err(CastError::new::<Self>(other.kind())),
        }
    }
}

impl FromCell for i64 {
    fn from_cell(cell: &CellValue) -> Result<Self, CastError> {
        match cell {
            CellValue::Int16(i) => Ok(*i as i64),
            CellValue::Int32(i) => Ok(*i as i64),
            CellValue::Int64(i) => Ok(*i),
            other => Err(CastError::new::<Self>(other.kind())),
        }
    }
}

impl FromCell for f64 {
    fn from_cell(cell: &CellValue) -> Result<Self, CastError> {
        match cell {
            CellValue::Float32(f) => Ok(*f as f64),
            CellValue::Float64(f) => Ok(*f),
            CellValue::Int16(i) => Ok(*i as f64),
            CellValue::Int32(i) => Ok(*i as f64),
            CellValue::Int64(i) => Ok(*i as f64),
            other => Err(CastError::new::<Self>(other.kind())),
        }
    }
}

impl FromCell for String {
    fn from_cell(cell: &CellValue) -> Result<Self, CastError> {
        match cell {
            CellValue::Text(s) => Ok(s.clone()),
            other => Err(CastError::new::<Self>(other.kind())),
        }
    }
}

impl FromCell for Vec<u8> {
    fn from_cell(cell: &CellValue) -> Result<Self, CastError> {
        match cell {
            CellValue::Bytes(b) => Ok(b.clone()),
            other => Err(CastError::new::<Self>(other.kind())),
        }
    }
}

impl FromCell for NaiveDate {
    fn from_cell(cell: &CellValue) -> Result<Self, CastError> {
        match cell {
            CellValue::Date(d) => Ok(*d),
            other => Err(CastError::new::<Self>(other.kind())),
        }
    }
}

impl FromCell for NaiveDateTime {
    fn from_cell(cell: &CellValue) -> Result<Self, CastError> {
        match cell {
            CellValue::DateTime(dt) => Ok(*dt),
            other => Err(CastError::new::<Self>(other.kind())),
        }
    }
}

impl FromCell for DateTime<Utc> {
    fn from_cell(cell: &CellValue) -> Result<Self, CastError> {
        match cell {
            CellValue::TimestampTz(dt) => Ok(*dt),
            CellValue::DateTime(dt) => Ok(dt.and_utc()),
            other => Err(CastError::new::<Self>(other.kind())),
        }
    }
}

impl FromCell for serde_json::Value {
    fn from_cell(cell: &CellValue) -> Result<Self, CastError> {
        match cell {
            CellValue::Json(j) => Ok(j.clone()),
            other => Err(CastError::new::<Self>(other.kind())),
        }
    }
}

/// Options passed to a mapper for every row of one execution.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MapContext {
    /// Materialized values are not handed to a change tracker.
    pub no_tracking: bool,
}

pub trait RowMapper<T>: Send + Sync {
    fn map(&self, row: Row, ctx: &MapContext) -> Result<T, CastError>;
}

type Initializer<T> = Box<dyn Fn(&mut T, &MapContext) + Send + Sync>;

/// Maps rows through [`FromRow`], then runs an optional initializer on each
/// value.
pub struct DefaultRowMapper<T> {
    initializer: Option<Initializer<T>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for DefaultRowMapper<T> {
    fn default() -> Self {
        Self {
            initializer: None,
            _marker: PhantomData,
        }
    }
}

impl<T> DefaultRowMapper<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initializer(
        mut self,
        initializer: impl Fn(&mut T, &MapContext) + Send + Sync + 'static,
    ) -> Self {
        self.initializer = Some(Box::new(initializer));
        self
    }
}

impl<T: FromRow> RowMapper<T> for DefaultRowMapper<T> {
    fn map(&self, row: Row, ctx: &MapContext) -> Result<T, CastError> {
        let mut value = T::from_row(&row)?;
        if let Some(init) = &self.initializer {
            init(&mut value, ctx);
        }
        Ok(value)
    }
}

/// Conversion of a whole [`QueryValue`] into the type an `execute` caller
/// asked for.
pub trait FromQueryValue: Sized {
    fn from_query_value(value: QueryValue) -> Result<Self, CastError>;
}

impl FromQueryValue for QueryValue {
    fn from_query_value(value: QueryValue) -> Result<Self, CastError> {
        Ok(value)
    }
}

impl<T: FromRow> FromQueryValue for Vec<T> {
    fn from_query_value(value: QueryValue) -> Result<Self, CastError> {
        match value {
            QueryValue::Rows(rows) => rows.iter().map(T::from_row).collect(),
            other => Err(CastError::new::<Self>(other.kind())),
        }
    }
}

impl FromQueryValue for Row {
    fn from_query_value(value: QueryValue) -> Result<Self, CastError> {
        value.into_entity()
    }
}

impl FromQueryValue for Option<Row> {
    fn from_query_value(value: QueryValue) -> Result<Self, CastError> {
        value.into_optional()
    }
}

fn scalar_cell<T>(value: QueryValue) -> Result<CellValue, CastError> {
    match value {
        QueryValue::Scalar(cell) => Ok(cell),
        QueryValue::Null => Ok(CellValue::Null),
        QueryValue::Row(row) if row.len() == 1 => Ok(row.into_values().remove(0)),
        other => Err(CastError::new::<T>(other.kind())),
    }
}

macro_rules! scalar_query_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl FromQueryValue for $ty {
                fn from_query_value(value: QueryValue) -> Result<Self, CastError> {
                    let cell = scalar_cell::<Self>(value)?;
                    <$ty as FromCell>::from_cell(&cell)
                }
            }

            impl FromQueryValue for Option<$ty> {
                fn from_query_value(value: QueryValue) -> Result<Self, CastError> {
                    let cell = scalar_cell::<Self>(value)?;
                    <Option<$ty> as FromCell>::from_cell(&cell)
                }
            }
        )*
    };
}

scalar_query_value!(
    bool,
    i16,
    i32,
    i64,
    f64,
    String,
    NaiveDate,
    NaiveDateTime,
    DateTime<Utc>,
    serde_json::Value,
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::row::ColumnInfo;
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    struct Customer {
        id: i32,
        name: String,
        email: Option<String>,
        loaded: bool,
    }

    impl FromRow for Customer {
        fn from_row(row: &Row) -> Result<Self, CastError> {
            Ok(Customer {
                id: row.get_as("id")?,
                name: row.get_as("name")?,
                email: row.get_as("email")?,
                loaded: false,
            })
        }
    }

    fn row(id: i32, name: &str, email: Option<&str>) -> Row {
        let columns: Arc<[ColumnInfo]> = vec![
            ColumnInfo::new("id", "int4"),
            ColumnInfo::new("name", "text"),
            ColumnInfo::new("email", "text"),
        ]
        .into();
        Row::new(
            columns,
            vec![
                CellValue::Int32(id),
                CellValue::Text(name.into()),
                email
                    .map(|e| CellValue::Text(e.into()))
                    .unwrap_or(CellValue::Null),
            ],
        )
    }

    #[test]
    fn test_from_row_with_nullable_column() {
        let customer = Customer::from_row(&row(1, "Ann", None)).unwrap();
        assert_eq!(customer.email, None);
        let customer = Customer::from_row(&row(2, "Bo", Some("bo@x.io"))).unwrap();
        assert_eq!(customer.email.as_deref(), Some("bo@x.io"));
    }

    #[test]
    fn test_default_mapper_runs_initializer() {
        let mapper = DefaultRowMapper::<Customer>::new().with_initializer(|c, ctx| {
            c.loaded = ctx.no_tracking;
        });
        let ctx = MapContext { no_tracking: true };
        let customer = mapper.map(row(1, "Ann", None), &ctx).unwrap();
        assert!(customer.loaded);
    }

    #[test]
    fn test_vec_from_rows() {
        let value = QueryValue::Rows(vec![row(1, "Ann", None), row(2, "Bo", None)]);
        let customers = Vec::<Customer>::from_query_value(value).unwrap();
        assert_eq!(customers.len(), 2);
        assert_eq!(customers[1].name, "Bo");
    }

    #[test]
    fn test_scalar_conversions() {
        assert_eq!(i64::from_query_value(QueryValue::Scalar(CellValue::Int64(3))).unwrap(), 3);
        assert_eq!(i64::from_query_value(QueryValue::Scalar(CellValue::Int32(3))).unwrap(), 3);
        assert_eq!(
            Option::<f64>::from_query_value(QueryValue::Null).unwrap(),
            None
        );
        assert!(bool::from_query_value(QueryValue::Scalar(CellValue::Bool(true))).unwrap());
    }

    #[test]
    fn test_cast_error_names_both_types() {
        let err = i64::from_query_value(QueryValue::Scalar(CellValue::Text("x".into())))
            .unwrap_err();
        assert_eq!(err.expected, "i64");
        assert_eq!(err.actual, "text");

        let err = Vec::<Row>::from_query_value(QueryValue::Scalar(CellValue::Int64(1)))
            .unwrap_err();
        assert!(err.expected.contains("Vec"));
        assert_eq!(err.actual, "int8");
    }

    #[test]
    fn test_optional_entity() {
        assert_eq!(QueryValue::Null.into_optional::<Customer>().unwrap(), None);
        let found = QueryValue::Row(row(5, "Cy", None))
            .into_optional::<Customer>()
            .unwrap();
        assert_eq!(found.map(|c| c.id), Some(5));
    }

    #[test]
    fn test_missing_column_is_cast_error() {
        let err = row(1, "Ann", None).get_as::<i32>("age").unwrap_err();
        assert!(err.actual.contains("age"));
    }
}
