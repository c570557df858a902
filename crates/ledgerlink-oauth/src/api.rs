//! Accounting API operations forwarded with a connection's credentials.
//!
//! [`AccountingApi`] lists the operations callers use. [`ApiClient`]
//! implements them over HTTP against `{base}/v3/company/{realm}/...`, using
//! whatever access token the owning [`Connection`](crate::Connection)
//! currently holds.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::NaiveDate;
use ledgerlink_store::Token;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api_log::{ApiCallLogger, ApiCallRecord};
use crate::error::ApiError;

/// Result type for API calls.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

// ============================================================================
// AccountingApi
// ============================================================================

/// Operations available on a connected company.
#[async_trait]
pub trait AccountingApi: Send + Sync {
    /// Company profile of the connected realm.
    async fn company_info(&self) -> ApiResult<Value>;

    /// Run a query statement (`select * from Customer where ...`).
    async fn query(&self, statement: &str) -> ApiResult<Value>;

    /// Read one entity by id.
    async fn read(&self, entity: &str, id: &str) -> ApiResult<Value>;

    /// Create an entity.
    async fn create(&self, entity: &str, body: &Value) -> ApiResult<Value>;

    /// Sparse or full update of an entity; `body` carries `Id` and `SyncToken`.
    async fn update(&self, entity: &str, body: &Value) -> ApiResult<Value>;

    /// Create an invoice.
    async fn create_invoice(&self, invoice: &Invoice) -> ApiResult<Value> {
        let body = serde_json::to_value(invoice)?;
        self.create("invoice", &body).await
    }

    /// Customers matching an optional `where` clause.
    async fn query_customers(&self, filter: Option<&str>) -> ApiResult<Vec<Value>> {
        let statement = match filter {
            Some(filter) => format!("select * from Customer where {}", filter),
            None => "select * from Customer".to_string(),
        };
        let response = self.query(&statement).await?;
        Ok(response
            .pointer("/QueryResponse/Customer")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }
}

// ============================================================================
// Invoice
// ============================================================================

/// Reference to another entity by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Reference {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            name: None,
        }
    }
}

/// A sales line on an invoice.
#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceLine {
    pub amount: f64,
    pub description: Option<String>,
    pub item: Reference,
    pub quantity: Option<f64>,
}

/// Minimal invoice payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Invoice {
    pub customer_ref: Reference,
    #[serde(rename = "Line")]
    pub lines: Vec<InvoiceLine>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
}

impl Invoice {
    pub fn new(customer: Reference) -> Self {
        Self {
            customer_ref: customer,
            lines: Vec::new(),
            doc_number: None,
            due_date: None,
        }
    }

    pub fn with_line(mut self, line: InvoiceLine) -> Self {
        self.lines.push(line);
        self
    }
}

impl Serialize for InvoiceLine {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        #[serde(rename_all = "PascalCase")]
        struct Detail<'a> {
            item_ref: &'a Reference,
            #[serde(skip_serializing_if = "Option::is_none")]
            qty: Option<f64>,
        }

        #[derive(Serialize)]
        #[serde(rename_all = "PascalCase")]
        struct Line<'a> {
            amount: f64,
            #[serde(skip_serializing_if = "Option::is_none")]
            description: Option<&'a str>,
            detail_type: &'static str,
            sales_item_line_detail: Detail<'a>,
        }

        Line {
            amount: self.amount,
            description: self.description.as_deref(),
            detail_type: "SalesItemLineDetail",
            sales_item_line_detail: Detail {
                item_ref: &self.item,
                qty: self.quantity,
            },
        }
        .serialize(serializer)
    }
}

// ============================================================================
// ApiClient
// ============================================================================

/// Fault payload returned by the API on errors.
#[derive(Debug, Deserialize)]
struct FaultResponse {
    #[serde(rename = "Fault")]
    fault: Fault,
}

#[derive(Debug, Deserialize)]
struct Fault {
    #[serde(rename = "Error", default)]
    errors: Vec<FaultError>,
}

#[derive(Debug, Deserialize)]
struct FaultError {
    #[serde(rename = "Message", default)]
    message: String,
    #[serde(rename = "Detail", default)]
    detail: Option<String>,
}

/// HTTP implementation of [`AccountingApi`] bound to one connection.
pub struct ApiClient {
    http: reqwest::Client,
    connection: String,
    base_url: String,
    realm_id: Option<String>,
    access_token: String,
    minor_version: Option<u32>,
    timeout: Duration,
    log: Option<Arc<ApiCallLogger>>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("connection", &self.connection)
            .field("base_url", &self.base_url)
            .field("realm_id", &self.realm_id)
            .field("minor_version", &self.minor_version)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    /// Create a client for `connection` using the credentials in `token`.
    pub fn new(
        http: reqwest::Client,
        connection: impl Into<String>,
        base_url: impl Into<String>,
        token: &Token,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            connection: connection.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            realm_id: token.realm_id.clone(),
            access_token: token.access_token.clone(),
            minor_version: None,
            timeout,
            log: None,
        }
    }

    /// Send `minorversion` with every request.
    pub fn with_minor_version(mut self, minor_version: Option<u32>) -> Self {
        self.minor_version = minor_version;
        self
    }

    /// Record every call to `logger`.
    pub fn with_logger(mut self, logger: Arc<ApiCallLogger>) -> Self {
        self.log = Some(logger);
        self
    }

    /// Swap in the credentials of a newly issued token.
    pub fn update_credentials(&mut self, token: &Token) {
        self.access_token = token.access_token.clone();
        if token.realm_id.is_some() {
            self.realm_id = token.realm_id.clone();
        }
    }

    pub fn realm_id(&self) -> Option<&str> {
        self.realm_id.as_deref()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> ApiResult<Value> {
        let realm = self
            .realm_id
            .as_deref()
            .ok_or_else(|| ApiError::MissingRealm(self.connection.clone()))?;
        let path = path.trim_start_matches('/');
        let url = format!("{}/v3/company/{}/{}", self.base_url, realm, path);

        let mut params: Vec<(&str, String)> = query.to_vec();
        if let Some(minor_version) = self.minor_version {
            params.push(("minorversion", minor_version.to_string()));
        }

        let mut request = self
            .http
            .request(method.clone(), &url)
            .bearer_auth(&self.access_token)
            .header(reqwest::header::ACCEPT, "application/json")
            .query(&params)
            .timeout(self.timeout);
        if let Some(body) = body {
            request = request.json(body);
        }

        let started = Instant::now();
        let result = execute(request).await;
        let elapsed = started.elapsed();

        tracing::debug!(
            connection = %self.connection,
            method = %method,
            path,
            elapsed_ms = elapsed.as_millis() as u64,
            ok = result.is_ok(),
            "API call"
        );
        self.record(&method, path, &result, elapsed);

        result.map(|(_, value)| value)
    }

    fn record(
        &self,
        method: &Method,
        path: &str,
        result: &ApiResult<(u16, Value)>,
        elapsed: Duration,
    ) {
        let Some(log) = &self.log else {
            return;
        };

        let mut record = ApiCallRecord::new(
            self.connection.clone(),
            self.realm_id.clone(),
            method.as_str(),
            path,
        );
        record.duration_ms = elapsed.as_millis() as u64;
        match result {
            Ok((status, _)) => record.status = Some(*status),
            Err(e) => {
                record.status = e.status();
                record.error = Some(e.to_string());
            }
        }

        if let Err(e) = log.log(&record) {
            tracing::warn!(connection = %self.connection, error = %e, "Failed to write API call log");
        }
    }
}

async fn execute(request: reqwest::RequestBuilder) -> ApiResult<(u16, Value)> {
    let response = request.send().await?;
    let status = response.status().as_u16();

    if response.status().is_success() {
        return Ok((status, response.json().await?));
    }

    let text = response.text().await.unwrap_or_default();
    if status == 401 {
        return Err(ApiError::Unauthorized(if text.is_empty() {
            "access token rejected".to_string()
        } else {
            text
        }));
    }

    let message = serde_json::from_str::<FaultResponse>(&text)
        .ok()
        .and_then(|f| f.fault.errors.into_iter().next())
        .map(|e| match e.detail {
            Some(detail) if !detail.is_empty() => format!("{}: {}", e.message, detail),
            _ => e.message,
        })
        .unwrap_or_else(|| {
            if text.is_empty() {
                format!("HTTP {}", status)
            } else {
                text
            }
        });

    Err(ApiError::Fault { status, message })
}

#[async_trait]
impl AccountingApi for ApiClient {
    async fn company_info(&self) -> ApiResult<Value> {
        let realm = self
            .realm_id
            .clone()
            .ok_or_else(|| ApiError::MissingRealm(self.connection.clone()))?;
        self.send(Method::GET, &format!("companyinfo/{}", realm), &[], None)
            .await
    }

    async fn query(&self, statement: &str) -> ApiResult<Value> {
        self.send(Method::GET, "query", &[("query", statement.to_string())], None)
            .await
    }

    async fn read(&self, entity: &str, id: &str) -> ApiResult<Value> {
        self.send(
            Method::GET,
            &format!("{}/{}", entity.to_ascii_lowercase(), urlencoding::encode(id)),
            &[],
            None,
        )
        .await
    }

    async fn create(&self, entity: &str, body: &Value) -> ApiResult<Value> {
        self.send(Method::POST, &entity.to_ascii_lowercase(), &[], Some(body))
            .await
    }

    async fn update(&self, entity: &str, body: &Value) -> ApiResult<Value> {
        self.send(
            Method::POST,
            &entity.to_ascii_lowercase(),
            &[("operation", "update".to_string())],
            Some(body),
        )
        .await
    }
}
