use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use postgres_native_tls::MakeTlsConnector;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, NoTls};

use super::error::ExecutionError;
use super::row::{ColumnInfo, Row};
use crate::expr::Value;

/// Command text plus positional parameter values (`$1`, `$2`, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub text: String,
    pub parameters: Vec<Value>,
}

impl Command {
    pub fn new(text: impl Into<String>, parameters: Vec<Value>) -> Self {
        Self {
            text: text.into(),
            parameters,
        }
    }
}

/// Live connection a plan executes against. The caller owns it for the
/// duration of each call.
#[async_trait]
pub trait DataConnection: Send + Sync {
    /// Blocking execution, used by synchronous plans.
    fn query(&self, command: &Command) -> Result<Vec<Row>, ExecutionError>;

    async fn query_async(&self, command: &Command) -> Result<Vec<Row>, ExecutionError>;

    /// Rows are fetched as the returned stream is polled.
    async fn query_stream<'a>(
        &'a self,
        command: Command,
    ) -> Result<BoxStream<'a, Result<Row, ExecutionError>>, ExecutionError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    #[serde(default)]
    pub ssl_mode: SslMode,
    /// Skip certificate verification in `Require` mode.
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// PEM file with the CA certificate to trust.
    #[serde(default)]
    pub ca_cert_path: Option<String>,
}

/// SSL/TLS connection modes, matching PostgreSQL's `sslmode`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub enum SslMode {
    #[default]
    Disable,
    Require,
    VerifyFull,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: String::from("localhost"),
            port: 5432,
            database: String::from("postgres"),
            username: String::from("postgres"),
            password: String::new(),
            ssl_mode: SslMode::default(),
            accept_invalid_certs: false,
            ca_cert_path: None,
        }
    }
}

impl ConnectOptions {
    pub fn connection_string(&self) -> String {
        let sslmode = match self.ssl_mode {
            SslMode::Disable => "disable",
            SslMode::Require => "require",
            SslMode::VerifyFull => "verify-full",
        };
        format!(
            "host={} port={} dbname={} user={} password={} sslmode={} connect_timeout=10",
            quote_conn_value(&self.host),
            self.port,
            quote_conn_value(&self.database),
            quote_conn_value(&self.username),
            quote_conn_value(&self.password),
            sslmode
        )
    }

    pub fn display_string(&self) -> String {
        format!(
            "{}@{}:{}/{}",
            self.username, self.host, self.port, self.database
        )
    }
}

/// [`DataConnection`] over a tokio-postgres client.
pub struct PgConnection {
    client: Client,
}

impl PgConnection {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect and spawn the connection driver task.
    pub async fn connect(options: &ConnectOptions) -> Result<Self> {
        let conn_string = options.connection_string();
        let timeout = Duration::from_secs(15);

        let client = match options.ssl_mode {
            SslMode::Disable => {
                let (client, connection) =
                    tokio::time::timeout(timeout, tokio_postgres::connect(&conn_string, NoTls))
                        .await
                        .map_err(|_| anyhow::anyhow!("Connection timed out after 15s"))?
                        .context("Failed to connect to PostgreSQL")?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        tracing::error!(error = %e, "connection error");
                    }
                });
                client
            }
            SslMode::Require | SslMode::VerifyFull => {
                let tls = build_tls_connector(options)?;
                let (client, connection) =
                    tokio::time::timeout(timeout, tokio_postgres::connect(&conn_string, tls))
                        .await
                        .map_err(|_| anyhow::anyhow!("Connection timed out after 15s"))?
                        .context("Failed to connect to PostgreSQL over TLS")?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        tracing::error!(error = %e, "connection error");
                    }
                });
                client
            }
        };

        tracing::info!(server = %options.display_string(), "connected");
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl DataConnection for PgConnection {
    fn query(&self, command: &Command) -> Result<Vec<Row>, ExecutionError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            ExecutionError::Connection("blocking query requires a tokio runtime".to_string())
        })?;
        if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::CurrentThread {
            return Err(ExecutionError::Connection(
                "blocking query requires a multi-threaded tokio runtime".to_string(),
            ));
        }
        tokio::task::block_in_place(|| handle.block_on(self.query_async(command)))
    }

    async fn query_async(&self, command: &Command) -> Result<Vec<Row>, ExecutionError> {
        let stmt = self
            .client
            .prepare(&command.text)
            .await
            .map_err(|e| ExecutionError::from_pg_error(&e, &command.text))?;
        let params = bind_parameters(&command.parameters, stmt.params())?;
        let refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();
        let rows = self
            .client
            .query(&stmt, &refs)
            .await
            .map_err(|e| ExecutionError::from_pg_error(&e, &command.text))?;

        let Some(first) = rows.first() else {
            return Ok(Vec::new());
        };
        let columns = Row::pg_columns(first);
        Ok(rows.iter().map(|r| Row::from_pg(r, &columns)).collect())
    }

    async fn query_stream<'a>(
        &'a self,
        command: Command,
    ) -> Result<BoxStream<'a, Result<Row, ExecutionError>>, ExecutionError> {
        let stmt = self
            .client
            .prepare(&command.text)
            .await
            .map_err(|e| ExecutionError::from_pg_error(&e, &command.text))?;
        let params = bind_parameters(&command.parameters, stmt.params())?;
        let rows = self
            .client
            .query_raw(&stmt, params.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)))
            .await
            .map_err(|e| ExecutionError::from_pg_error(&e, &command.text))?;

        let text = command.text;
        let mut columns: Option<Arc<[ColumnInfo]>> = None;
        Ok(rows
            .map(move |row| {
                let row = row.map_err(|e| ExecutionError::from_pg_error(&e, &text))?;
                let cols = columns.get_or_insert_with(|| Row::pg_columns(&row));
                Ok(Row::from_pg(&row, cols))
            })
            .boxed())
    }
}

type SqlParam = Box<dyn ToSql + Sync + Send>;

/// Convert values to the parameter types the server inferred for the
/// prepared statement, so NULLs are typed and integers get the right width.
fn bind_parameters(values: &[Value], types: &[Type]) -> Result<Vec<SqlParam>, ExecutionError> {
    if values.len() != types.len() {
        return Err(ExecutionError::Command(format!(
            "statement expects {} parameters, got {}",
            types.len(),
            values.len()
        )));
    }
    values
        .iter()
        .zip(types)
        .enumerate()
        .map(|(i, (value, ty))| to_sql_param(i + 1, value, ty))
        .collect()
}

fn to_sql_param(index: usize, value: &Value, ty: &Type) -> Result<SqlParam, ExecutionError> {
    let mismatch = || ExecutionError::Parameter {
        index,
        value: value.to_string(),
        pg_type: ty.name().to_string(),
    };

    let param: SqlParam = match value {
        Value::Null => match *ty {
            Type::BOOL => Box::new(None::<bool>),
            Type::INT2 => Box::new(None::<i16>),
            Type::INT4 => Box::new(None::<i32>),
            Type::INT8 => Box::new(None::<i64>),
            Type::FLOAT4 => Box::new(None::<f32>),
            Type::FLOAT8 => Box::new(None::<f64>),
            Type::DATE => Box::new(None::<NaiveDate>),
            Type::TIMESTAMP => Box::new(None::<NaiveDateTime>),
            Type::TIMESTAMPTZ => Box::new(None::<DateTime<Utc>>),
            Type::JSON | Type::JSONB => Box::new(None::<serde_json::Value>),
            _ => Box::new(None::<String>),
        },
        Value::Bool(b) => match *ty {
            Type::BOOL => Box::new(*b),
            _ => return Err(mismatch()),
        },
        Value::Int(i) => match *ty {
            Type::INT2 => Box::new(i16::try_from(*i).map_err(|_| mismatch())?),
            Type::INT4 => Box::new(i32::try_from(*i).map_err(|_| mismatch())?),
            Type::INT8 => Box::new(*i),
            Type::FLOAT4 => Box::new(*i as f32),
            Type::FLOAT8 => Box::new(*i as f64),
            Type::TEXT | Type::VARCHAR => Box::new(i.to_string()),
            _ => return Err(mismatch()),
        },
        Value::Float(f) => match *ty {
            Type::FLOAT4 => Box::new(*f as f32),
            Type::FLOAT8 => Box::new(*f),
            _ => return Err(mismatch()),
        },
        Value::Text(s) => match *ty {
            Type::TEXT | Type::VARCHAR | Type::NAME | Type::BPCHAR | Type::CHAR => {
                Box::new(s.clone())
            }
            Type::DATE => Box::new(s.parse::<NaiveDate>().map_err(|_| mismatch())?),
            Type::TIMESTAMP => Box::new(s.parse::<NaiveDateTime>().map_err(|_| mismatch())?),
            Type::TIMESTAMPTZ => Box::new(s.parse::<DateTime<Utc>>().map_err(|_| mismatch())?),
            Type::JSON | Type::JSONB => Box::new(
                serde_json::from_str::<serde_json::Value>(s).map_err(|_| mismatch())?,
            ),
            _ => return Err(mismatch()),
        },
    };
    Ok(param)
}

/// Build a TLS connector. `VerifyFull` always verifies; `Require` skips
/// verification only when `accept_invalid_certs` is set.
fn build_tls_connector(options: &ConnectOptions) -> Result<MakeTlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();

    if options.accept_invalid_certs && options.ssl_mode == SslMode::Require {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    } else if let Some(ca_path) = &options.ca_cert_path {
        let pem = std::fs::read(ca_path)
            .with_context(|| format!("Failed to read CA certificate file: {}", ca_path))?;
        let cert = native_tls::Certificate::from_pem(&pem).context("Failed to parse certificate")?;
        builder.add_root_certificate(cert);
    }

    let connector = builder.build().context("Failed to build TLS connector")?;
    Ok(MakeTlsConnector::new(connector))
}

/// Quote a value for use in a libpq key=value connection string.
/// Wraps in single quotes and escapes backslashes and single quotes.
fn quote_conn_value(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}
