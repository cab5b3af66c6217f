//! PostgREST client for the Bloom record store
//!
//! A small query builder over the Supabase REST endpoint (`/rest/v1/<table>`)
//! covering what the materials tracker needs:
//!
//! - `select` with equality and set-membership filters
//! - single-column ordering and row limits
//! - `insert` returning the stored representation
//! - `update` / `delete` scoped by filters

use log::debug;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use url::Url;

/// PostgREST APIエラーの詳細情報
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PostgrestApiErrorDetails {
    pub code: Option<String>,
    pub message: Option<String>,
    pub details: Option<String>,
    pub hint: Option<String>,
}

impl fmt::Display for PostgrestApiErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(code) = &self.code {
            parts.push(format!("Code: {}", code));
        }
        if let Some(message) = &self.message {
            parts.push(format!("Message: {}", message));
        }
        if let Some(details) = &self.details {
            parts.push(format!("Details: {}", details));
        }
        if let Some(hint) = &self.hint {
            parts.push(format!("Hint: {}", hint));
        }
        write!(f, "{}", parts.join(", "))
    }
}

/// エラー型
#[derive(Error, Debug)]
pub enum PostgrestError {
    #[error("API error: {details} (Status: {status})")]
    ApiError {
        details: PostgrestApiErrorDetails,
        status: StatusCode,
    },

    #[error("API error (unparsed): {message} (Status: {status})")]
    UnparsedApiError { message: String, status: StatusCode },

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParseError(#[from] url::ParseError),

    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

impl PostgrestError {
    /// HTTP status of an API error, if the server answered at all.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            PostgrestError::ApiError { status, .. } => Some(*status),
            PostgrestError::UnparsedApiError { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// ソート方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Ascending => "asc",
            SortOrder::Descending => "desc",
        }
    }
}

/// PostgREST クライアント
///
/// Each builder method consumes and returns the client, so a query reads as a
/// chain: `client.select("*").eq("client_id", id).order("date", SortOrder::Descending)`.
#[derive(Debug, Clone)]
pub struct PostgrestClient {
    base_url: String,
    table: String,
    http_client: Client,
    headers: HeaderMap,
    query_params: Vec<(String, String)>,
}

impl PostgrestClient {
    /// 新しい PostgREST クライアントを作成
    pub fn new(
        base_url: &str,
        api_key: &str,
        table: &str,
        http_client: Client,
    ) -> Result<Self, PostgrestError> {
        let client = Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            table: table.to_string(),
            http_client,
            headers: HeaderMap::new(),
            query_params: Vec::new(),
        };
        client
            .with_header("apikey", api_key)?
            .with_header("Content-Type", "application/json")
    }

    /// ヘッダーを追加
    pub fn with_header(mut self, key: &str, value: &str) -> Result<Self, PostgrestError> {
        let header_value = HeaderValue::from_str(value).map_err(|_| {
            PostgrestError::InvalidParameters(format!("Invalid header value for {}", key))
        })?;
        let header_name = HeaderName::from_bytes(key.as_bytes()).map_err(|_| {
            PostgrestError::InvalidParameters(format!("Invalid header name: {}", key))
        })?;

        self.headers.insert(header_name, header_value);
        Ok(self)
    }

    /// 認証トークンを設定
    pub fn with_auth(self, token: &str) -> Result<Self, PostgrestError> {
        self.with_header("Authorization", &format!("Bearer {}", token))
    }

    /// スキーマを指定（public 以外の場合）
    pub fn schema(self, schema_name: &str) -> Result<Self, PostgrestError> {
        self.with_header("Accept-Profile", schema_name)?
            .with_header("Content-Profile", schema_name)
    }

    /// The table this client targets.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// 取得するカラムを指定
    pub fn select(mut self, columns: &str) -> Self {
        self.query_params.retain(|(key, _)| key != "select");
        self.query_params
            .push(("select".to_string(), columns.to_string()));
        self
    }

    /// 等価フィルター
    pub fn eq(mut self, column: &str, value: &str) -> Self {
        self.query_params
            .push((column.to_string(), format!("eq.{}", value)));
        self
    }

    /// IN フィルター
    ///
    /// Values containing PostgREST reserved characters are double-quoted.
    pub fn in_list<S: AsRef<str>>(mut self, column: &str, values: &[S]) -> Self {
        let value_list = values
            .iter()
            .map(|v| quote_list_value(v.as_ref()))
            .collect::<Vec<_>>()
            .join(",");
        self.query_params
            .push((column.to_string(), format!("in.({})", value_list)));
        self
    }

    /// ソート順を指定
    pub fn order(mut self, column: &str, order: SortOrder) -> Self {
        self.query_params.retain(|(key, _)| key != "order");
        self.query_params
            .push(("order".to_string(), format!("{}.{}", column, order.as_str())));
        self
    }

    /// 取得件数を制限
    pub fn limit(mut self, count: u32) -> Self {
        self.query_params.retain(|(key, _)| key != "limit");
        self.query_params
            .push(("limit".to_string(), count.to_string()));
        self
    }

    /// データを取得
    pub async fn execute<T: DeserializeOwned>(&self) -> Result<Vec<T>, PostgrestError> {
        let url = self.build_url()?;
        debug!("GET {}", url);

        let response = self
            .http_client
            .get(url)
            .headers(self.headers.clone())
            .send()
            .await?;

        let body = read_body(response).await?;
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str::<Vec<T>>(&body)
            .map_err(|e| PostgrestError::DeserializationError(e.to_string()))
    }

    /// データを挿入
    ///
    /// Sends `Prefer: return=representation`, so the stored rows (with
    /// server-assigned ids and defaults) come back as a JSON array.
    pub async fn insert<T: Serialize>(&self, values: T) -> Result<Value, PostgrestError> {
        let url = self.build_url()?;
        debug!("POST {}", url);

        let response = self
            .http_client
            .post(url)
            .headers(self.representation_headers())
            .json(&values)
            .send()
            .await?;

        parse_value(read_body(response).await?)
    }

    /// データを更新
    pub async fn update<T: Serialize>(&self, values: T) -> Result<Value, PostgrestError> {
        self.require_filter("update")?;
        let url = self.build_url()?;
        debug!("PATCH {}", url);

        let response = self
            .http_client
            .patch(url)
            .headers(self.representation_headers())
            .json(&values)
            .send()
            .await?;

        parse_value(read_body(response).await?)
    }

    /// データを削除
    pub async fn delete(&self) -> Result<Value, PostgrestError> {
        self.require_filter("delete")?;
        let url = self.build_url()?;
        debug!("DELETE {}", url);

        let response = self
            .http_client
            .delete(url)
            .headers(self.representation_headers())
            .send()
            .await?;

        parse_value(read_body(response).await?)
    }

    fn representation_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();
        headers.insert(
            HeaderName::from_static("prefer"),
            HeaderValue::from_static("return=representation"),
        );
        headers
    }

    // An unfiltered PATCH/DELETE would touch every row in the table.
    fn require_filter(&self, operation: &str) -> Result<(), PostgrestError> {
        let has_filter = self
            .query_params
            .iter()
            .any(|(key, _)| !matches!(key.as_str(), "select" | "order" | "limit"));
        if has_filter {
            Ok(())
        } else {
            Err(PostgrestError::InvalidParameters(format!(
                "{} on {} requires at least one filter",
                operation, self.table
            )))
        }
    }

    // URLを構築
    fn build_url(&self) -> Result<Url, PostgrestError> {
        let mut url = Url::parse(&format!("{}/rest/v1/{}", self.base_url, self.table))?;
        if !self.query_params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &self.query_params {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }
}

fn quote_list_value(value: &str) -> String {
    let reserved = value
        .chars()
        .any(|c| matches!(c, ',' | '(' | ')' | '"' | ' ' | '.' | ':'));
    if reserved {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        value.to_string()
    }
}

async fn read_body(response: Response) -> Result<String, PostgrestError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| PostgrestError::DeserializationError(format!("Failed to read response body: {}", e)))?;

    if status.is_success() {
        return Ok(body);
    }

    match serde_json::from_str::<PostgrestApiErrorDetails>(&body) {
        Ok(details) => Err(PostgrestError::ApiError { details, status }),
        Err(_) => Err(PostgrestError::UnparsedApiError {
            message: body,
            status,
        }),
    }
}

fn parse_value(body: String) -> Result<Value, PostgrestError> {
    // 204 No Content and minimal returns carry an empty body.
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str::<Value>(&body)
        .map_err(|e| PostgrestError::DeserializationError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, table: &str) -> PostgrestClient {
        PostgrestClient::new(&server.uri(), "fake-key", table, Client::new()).unwrap()
    }

    #[tokio::test]
    async fn test_select_with_filter_and_order() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rest/v1/material_logs"))
            .and(query_param("select", "*"))
            .and(query_param("client_id", "eq.c-1"))
            .and(query_param("order", "date.desc"))
            .and(header("apikey", "fake-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "id": "l-2", "client_id": "c-1" },
                { "id": "l-1", "client_id": "c-1" }
            ])))
            .expect(1)
            .mount(&mock_server)
            .await;

        let rows = client(&mock_server, "material_logs")
            .select("*")
            .eq("client_id", "c-1")
            .order("date", SortOrder::Descending)
            .execute::<Value>()
            .await
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], "l-2");
    }

    #[tokio::test]
    async fn test_in_list_filter() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rest/v1/material_items"))
            .and(query_param("log_id", "in.(l-1,l-2)"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "id": "i-1", "log_id": "l-1" }
            ])))
            .expect(1)
            .mount(&mock_server)
            .await;

        let rows = client(&mock_server, "material_items")
            .select("*")
            .in_list("log_id", &["l-1", "l-2"])
            .execute::<Value>()
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_in_list_quotes_reserved_values() {
        assert_eq!(quote_list_value("abc"), "abc");
        assert_eq!(quote_list_value("a,b"), "\"a,b\"");
        assert_eq!(quote_list_value("say \"hi\""), "\"say \\\"hi\\\"\"");
    }

    #[tokio::test]
    async fn test_insert_returns_representation() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/rest/v1/clients"))
            .and(header("prefer", "return=representation"))
            .and(body_json(json!({ "name": "Johnson Residence" })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!([
                { "id": "c-9", "name": "Johnson Residence" }
            ])))
            .expect(1)
            .mount(&mock_server)
            .await;

        let value = client(&mock_server, "clients")
            .insert(json!({ "name": "Johnson Residence" }))
            .await
            .unwrap();

        assert_eq!(value[0]["id"], "c-9");
    }

    #[tokio::test]
    async fn test_update_and_delete_require_filter() {
        let mock_server = MockServer::start().await;
        let unfiltered = client(&mock_server, "clients");

        let update = unfiltered.update(json!({ "name": "x" })).await;
        assert!(matches!(update, Err(PostgrestError::InvalidParameters(_))));

        let delete = unfiltered.delete().await;
        assert!(matches!(delete, Err(PostgrestError::InvalidParameters(_))));
    }

    #[tokio::test]
    async fn test_update_and_delete_by_id() {
        let mock_server = MockServer::start().await;

        Mock::given(method("PATCH"))
            .and(path("/rest/v1/material_logs"))
            .and(query_param("id", "eq.l-1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("DELETE"))
            .and(path("/rest/v1/material_logs"))
            .and(query_param("id", "eq.l-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "id": "l-1" }])))
            .expect(1)
            .mount(&mock_server)
            .await;

        let updated = client(&mock_server, "material_logs")
            .eq("id", "l-1")
            .update(json!({ "date": "2024-05-01T00:00:00Z" }))
            .await
            .unwrap();
        assert_eq!(updated, Value::Null);

        let deleted = client(&mock_server, "material_logs")
            .eq("id", "l-1")
            .delete()
            .await
            .unwrap();
        assert_eq!(deleted[0]["id"], "l-1");
    }

    #[tokio::test]
    async fn test_error_handling() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/rest/v1/clients"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "code": "23505",
                "message": "duplicate key value violates unique constraint",
                "details": null,
                "hint": null
            })))
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/rest/v1/clients"))
            .respond_with(ResponseTemplate::new(500).set_body_string("upstream down"))
            .mount(&mock_server)
            .await;

        let insert = client(&mock_server, "clients")
            .insert(json!({ "name": "dup" }))
            .await;
        match insert {
            Err(PostgrestError::ApiError { details, status }) => {
                assert_eq!(status, StatusCode::CONFLICT);
                assert_eq!(details.code.as_deref(), Some("23505"));
            }
            other => panic!("expected ApiError, got {:?}", other),
        }

        let select = client(&mock_server, "clients")
            .select("*")
            .execute::<Value>()
            .await;
        match select {
            Err(err @ PostgrestError::UnparsedApiError { .. }) => {
                assert_eq!(err.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
            }
            other => panic!("expected UnparsedApiError, got {:?}", other),
        }
    }
}
