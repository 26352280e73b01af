//! Google Sheets v4 REST store

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{CellBackground, CellWrite, SheetStore, StoreError};
use crate::infrastructure::config::SheetsConfig;

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetMeta>,
}

#[derive(Debug, Deserialize)]
struct SheetMeta {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetProperties {
    sheet_id: i64,
    title: String,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

/// One worksheet, addressed by gid, written with a caller-supplied access token
pub struct GoogleSheetsStore {
    http: Client,
    api_base: String,
    spreadsheet_id: String,
    sheet_gid: i64,
    access_token: String,
    sheet_title: OnceCell<String>,
}

impl GoogleSheetsStore {
    pub fn new(config: &SheetsConfig, access_token: impl Into<String>) -> Result<Self, StoreError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            spreadsheet_id: config.spreadsheet_id.clone(),
            sheet_gid: config.sheet_gid,
            access_token: access_token.into(),
            sheet_title: OnceCell::new(),
        })
    }

    fn spreadsheet_url(&self) -> String {
        format!("{}/spreadsheets/{}", self.api_base, self.spreadsheet_id)
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, StoreError> {
        let response = request
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(classify_failure(status, &body))
    }

    /// Worksheet title for the configured gid, looked up once
    async fn sheet_title(&self) -> Result<&str, StoreError> {
        self.sheet_title
            .get_or_try_init(|| async {
                let url = format!("{}?fields=sheets.properties", self.spreadsheet_url());
                let meta: SpreadsheetMeta = self
                    .send(self.http.get(&url))
                    .await?
                    .json()
                    .await
                    .map_err(|e| StoreError::Transport(e.to_string()))?;
                let title = meta
                    .sheets
                    .into_iter()
                    .find(|s| s.properties.sheet_id == self.sheet_gid)
                    .map(|s| s.properties.title)
                    .ok_or_else(|| StoreError::Rejected {
                        status: 404,
                        message: format!("no worksheet with gid {}", self.sheet_gid),
                    })?;
                info!("📄 Using worksheet '{}'", title);
                Ok::<_, StoreError>(title)
            })
            .await
            .map(String::as_str)
    }

    fn qualified(title: &str, range: &str) -> String {
        format!("'{}'!{}", title.replace('\'', "''"), range)
    }
}

fn classify_failure(status: StatusCode, body: &str) -> StoreError {
    let api_error = serde_json::from_str::<ApiErrorBody>(body).ok().map(|b| b.error);
    let message = api_error
        .as_ref()
        .map_or_else(|| body.to_string(), |e| e.message.clone());

    if status == StatusCode::TOO_MANY_REQUESTS
        || api_error.as_ref().is_some_and(|e| e.status == "RESOURCE_EXHAUSTED")
    {
        return StoreError::RateLimited { message };
    }
    StoreError::Rejected {
        status: status.as_u16(),
        message,
    }
}

fn cell_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[async_trait]
impl SheetStore for GoogleSheetsStore {
    async fn read_all_values(&self) -> Result<Vec<Vec<String>>, StoreError> {
        let title = self.sheet_title().await?;
        let quoted = format!("'{}'", title.replace('\'', "''"));
        let range = url::form_urlencoded::byte_serialize(quoted.as_bytes())
            .collect::<String>()
            .replace('+', "%20");
        let url = format!("{}/values/{}?majorDimension=ROWS", self.spreadsheet_url(), range);
        let body: ValueRange = self
            .send(self.http.get(&url))
            .await?
            .json()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        Ok(body
            .values
            .into_iter()
            .map(|row| row.into_iter().map(cell_text).collect())
            .collect())
    }

    async fn batch_write_cells(&self, cells: &[CellWrite]) -> Result<(), StoreError> {
        let title = self.sheet_title().await?;
        let data: Vec<Value> = cells
            .iter()
            .map(|c| json!({ "range": Self::qualified(title, &c.range), "values": [[c.value]] }))
            .collect();
        let body = json!({ "valueInputOption": "USER_ENTERED", "data": data });

        let url = format!("{}/values:batchUpdate", self.spreadsheet_url());
        self.send(self.http.post(&url).json(&body)).await?;
        debug!("Wrote {} cells", cells.len());
        Ok(())
    }

    async fn batch_set_background(&self, cells: &[CellBackground]) -> Result<(), StoreError> {
        let requests: Vec<Value> = cells
            .iter()
            .map(|c| {
                let (red, green, blue) = c.rgb;
                json!({
                    "repeatCell": {
                        "range": {
                            "sheetId": self.sheet_gid,
                            "startRowIndex": c.row.saturating_sub(1),
                            "endRowIndex": c.row,
                            "startColumnIndex": c.column.saturating_sub(1),
                            "endColumnIndex": c.column
                        },
                        "cell": { "userEnteredFormat": { "backgroundColor": { "red": red, "green": green, "blue": blue } } },
                        "fields": "userEnteredFormat.backgroundColor"
                    }
                })
            })
            .collect();

        let url = format!("{}:batchUpdate", self.spreadsheet_url());
        self.send(self.http.post(&url).json(&json!({ "requests": requests })))
            .await?;
        debug!("Colored {} cells", cells.len());
        Ok(())
    }
}
