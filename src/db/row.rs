use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use std::sync::Arc;
use tokio_postgres::types::Type;

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    pub type_name: String,
}

impl ColumnInfo {
    pub fn new(name: &str, type_name: &str) -> Self {
        Self {
            name: name.to_string(),
            type_name: type_name.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Json(serde_json::Value),
    Unknown(String),
}

impl CellValue {
    pub fn display(&self) -> String {
        match self {
            CellValue::Null => "NULL".to_string(),
            CellValue::Bool(b) => b.to_string(),
            CellValue::Int16(i) => i.to_string(),
            CellValue::Int32(i) => i.to_string(),
            CellValue::Int64(i) => i.to_string(),
            CellValue::Float32(f) => f.to_string(),
            CellValue::Float64(f) => f.to_string(),
            CellValue::Text(s) => s.clone(),
            CellValue::Bytes(b) => format!("[{} bytes]", b.len()),
            CellValue::Date(d) => d.to_string(),
            CellValue::Time(t) => t.to_string(),
            CellValue::DateTime(dt) => dt.to_string(),
            CellValue::TimestampTz(dt) => dt.to_string(),
            CellValue::Json(j) => j.to_string(),
            CellValue::Unknown(s) => s.clone(),
        }
    }

    /// Kind name used in cast errors.
    pub fn kind(&self) -> &'static str {
        match self {
            CellValue::Null => "null",
            CellValue::Bool(_) => "bool",
            CellValue::Int16(_) => "int2",
            CellValue::Int32(_) => "int4",
            CellValue::Int64(_) => "int8",
            CellValue::Float32(_) => "float4",
            CellValue::Float64(_) => "float8",
            CellValue::Text(_) => "text",
            CellValue::Bytes(_) => "bytea",
            CellValue::Date(_) => "date",
            CellValue::Time(_) => "time",
            CellValue::DateTime(_) => "timestamp",
            CellValue::TimestampTz(_) => "timestamptz",
            CellValue::Json(_) => "json",
            CellValue::Unknown(_) => "unknown",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }
}

/// One fetched row. Column metadata is shared by every row of a result.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[ColumnInfo]>,
    values: Vec<CellValue>,
}

impl Row {
    pub fn new(columns: Arc<[ColumnInfo]>, values: Vec<CellValue>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    pub fn values(&self) -> &[CellValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<CellValue> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&CellValue> {
        self.values.get(idx)
    }

    /// Column lookup by name, ignoring ASCII case.
    pub fn get_by_name(&self, name: &str) -> Option<&CellValue> {
        let idx = self
            .columns
            .iter()
            .position(|c| c.name == name)
            .or_else(|| self.columns.iter().position(|c| c.name.eq_ignore_ascii_case(name)))?;
        self.values.get(idx)
    }

    pub(crate) fn from_pg(row: &tokio_postgres::Row, columns: &Arc<[ColumnInfo]>) -> Self {
        let values = row
            .columns()
            .iter()
            .enumerate()
            .map(|(i, col)| extract_value(row, i, col.type_()))
            .collect();
        Self::new(columns.clone(), values)
    }

    pub(crate) fn pg_columns(row: &tokio_postgres::Row) -> Arc<[ColumnInfo]> {
        row.columns()
            .iter()
            .map(|col| ColumnInfo::new(col.name(), col.type_().name()))
            .collect()
    }
}

fn extract_value(row: &tokio_postgres::Row, idx: usize, pg_type: &Type) -> CellValue {
    match *pg_type {
        Type::BOOL => row
            .try_get::<_, Option<bool>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Bool)
            .unwrap_or(CellValue::Null),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Int16)
            .unwrap_or(CellValue::Null),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Int32)
            .unwrap_or(CellValue::Null),
        Type::INT8 => row
            .try_get::<_, Option<i64>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Int64)
            .unwrap_or(CellValue::Null),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Float32)
            .unwrap_or(CellValue::Null),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Float64)
            .unwrap_or(CellValue::Null),
        Type::TEXT | Type::VARCHAR | Type::NAME | Type::CHAR | Type::BPCHAR => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Text)
            .unwrap_or(CellValue::Null),
        Type::BYTEA => row
            .try_get::<_, Option<Vec<u8>>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Bytes)
            .unwrap_or(CellValue::Null),
        Type::DATE => row
            .try_get::<_, Option<NaiveDate>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Date)
            .unwrap_or(CellValue::Null),
        Type::TIME => row
            .try_get::<_, Option<NaiveTime>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Time)
            .unwrap_or(CellValue::Null),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)
            .ok()
            .flatten()
            .map(CellValue::DateTime)
            .unwrap_or(CellValue::Null),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)
            .ok()
            .flatten()
            .map(CellValue::TimestampTz)
            .unwrap_or(CellValue::Null),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Json)
            .unwrap_or(CellValue::Null),
        _ => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Text)
            .unwrap_or_else(|| CellValue::Unknown(pg_type.name().to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn customer_row() -> Row {
        let columns: Arc<[ColumnInfo]> = vec![
            ColumnInfo::new("id", "int4"),
            ColumnInfo::new("Name", "text"),
        ]
        .into();
        Row::new(columns, vec![CellValue::Int32(7), CellValue::Text("Ann".into())])
    }

    #[test]
    fn test_get_by_name_ignores_case() {
        let row = customer_row();
        assert_eq!(row.get_by_name("name"), Some(&CellValue::Text("Ann".into())));
        assert_eq!(row.get_by_name("ID"), Some(&CellValue::Int32(7)));
        assert_eq!(row.get_by_name("email"), None);
    }

    #[test]
    fn test_rows_share_columns() {
        let a = customer_row();
        let b = Row::new(a.columns.clone(), vec![CellValue::Int32(8), CellValue::Null]);
        assert!(Arc::ptr_eq(&a.columns, &b.columns));
        assert_eq!(b.len(), 2);
    }

    #[test]
    fn test_display() {
        assert_eq!(CellValue::Null.display(), "NULL");
        assert_eq!(CellValue::Bool(true).display(), "true");
        assert_eq!(CellValue::Int64(9_999_999).display(), "9999999");
        assert_eq!(CellValue::Bytes(vec![1, 2, 3]).display(), "[3 bytes]");
        let json = CellValue::Json(serde_json::json!({"key": "value"})).display();
        assert!(json.contains("key"));
    }

    #[test]
    fn test_kind() {
        assert_eq!(CellValue::Int32(1).kind(), "int4");
        assert_eq!(CellValue::Text(String::new()).kind(), "text");
        assert!(CellValue::Null.is_null());
    }
}
