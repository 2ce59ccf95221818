//! HTTP org connection (Salesforce-style REST, Bulk v1 and Bulk v2 endpoints)
//!
//! The JSON and CSV shapes below are specific to this adapter; the rest of
//! the crate only sees the traits in [`super`].

use std::env;

use async_trait::async_trait;
use log::{debug, trace};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{
    BatchInfo, BatchState, BulkV1Api, BulkV2Api, JobInfo, JobState, OrgConnection, RecordResult,
    RestApi, ResultSet, csv_to_records, records_to_csv,
};
use crate::error::{MigrationError, Result};
use crate::metadata::{EntityDescribe, FieldDescribe, FieldType};
use crate::model::{ApiOperation, Record};

/// Default REST API version
pub const DEFAULT_API_VERSION: &str = "60.0";

/// Credentials for one org
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgCredentials {
    /// Alias used in logs
    pub name: String,
    pub instance_url: String,
    pub access_token: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

impl OrgCredentials {
    /// Read `<PREFIX>_INSTANCE_URL`, `<PREFIX>_ACCESS_TOKEN` and optional
    /// `<PREFIX>_API_VERSION` from the environment
    pub fn from_env(name: &str, prefix: &str) -> Result<Self> {
        let var = |suffix: &str| env::var(format!("{}_{}", prefix, suffix));
        let instance_url = var("INSTANCE_URL").map_err(|_| {
            MigrationError::configuration(format!("{}_INSTANCE_URL is not set", prefix))
        })?;
        let access_token = var("ACCESS_TOKEN").map_err(|_| {
            MigrationError::configuration(format!("{}_ACCESS_TOKEN is not set", prefix))
        })?;
        Ok(OrgCredentials {
            name: name.to_string(),
            instance_url: instance_url.trim_end_matches('/').to_string(),
            access_token,
            api_version: var("API_VERSION").unwrap_or_else(|_| default_api_version()),
        })
    }
}

/// Org connection over HTTP
pub struct HttpOrgConnection {
    credentials: OrgCredentials,
    client: Client,
}

impl HttpOrgConnection {
    pub fn new(credentials: OrgCredentials) -> Self {
        HttpOrgConnection {
            credentials,
            client: Client::new(),
        }
    }

    fn data_url(&self, path: &str) -> String {
        format!(
            "{}/services/data/v{}/{}",
            self.credentials.instance_url,
            self.credentials.api_version,
            path.trim_start_matches('/')
        )
    }

    fn async_url(&self, path: &str) -> String {
        format!(
            "{}/services/async/{}/{}",
            self.credentials.instance_url,
            self.credentials.api_version,
            path.trim_start_matches('/')
        )
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        trace!("{} {}", method, url);
        self.client
            .request(method, url)
            .bearer_auth(&self.credentials.access_token)
    }

    /// Bulk v1 authenticates with a session header instead of a bearer token
    fn async_request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = self.async_url(path);
        trace!("{} {}", method, url);
        self.client
            .request(method, url)
            .header("X-SFDC-Session", &self.credentials.access_token)
    }

    async fn send_json(&self, builder: RequestBuilder) -> Result<Value> {
        let response = check_status(builder.send().await?).await?;
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    async fn send_text(&self, builder: RequestBuilder) -> Result<String> {
        let response = check_status(builder.send().await?).await?;
        Ok(response.text().await?)
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(MigrationError::Api {
        status: status.as_u16(),
        message: api_error_message(&body),
    })
}

/// First error message of an API error body, or the raw body
fn api_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.as_array()
                .and_then(|a| a.first().cloned())
                .or(Some(v))
                .and_then(|e| e.get("message").and_then(|m| m.as_str()).map(String::from))
        })
        .unwrap_or_else(|| body.to_string())
}

fn strip_attributes(value: Value) -> Option<Record> {
    let mut record = Record::from_json(value)?;
    record.remove("attributes");
    Some(record)
}

fn joined_errors(errors: Option<&Value>) -> Option<String> {
    let messages: Vec<String> = errors?
        .as_array()?
        .iter()
        .filter_map(|e| {
            e.get("message")
                .and_then(|m| m.as_str())
                .map(String::from)
                .or_else(|| e.as_str().map(String::from))
        })
        .collect();
    (!messages.is_empty()).then(|| messages.join("; "))
}

fn parse_record_result(value: &Value) -> RecordResult {
    let success = value.get("success").and_then(|s| s.as_bool()).unwrap_or(false);
    RecordResult {
        id: value.get("id").and_then(|i| i.as_str()).map(String::from),
        success,
        created: value.get("created").and_then(|c| c.as_bool()).unwrap_or(false),
        error: if success {
            None
        } else {
            joined_errors(value.get("errors")).or_else(|| Some("Unknown error".to_string()))
        },
    }
}

fn usize_field(value: &Value, name: &str) -> usize {
    match value.get(name) {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0) as usize,
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

fn job_id(value: &Value) -> Result<String> {
    value
        .get("id")
        .and_then(|i| i.as_str())
        .map(String::from)
        .ok_or_else(|| MigrationError::Api {
            status: 200,
            message: "Response did not contain a job id".to_string(),
        })
}

fn parse_describe(value: &Value) -> EntityDescribe {
    let flag = |v: &Value, name: &str| v.get(name).and_then(|b| b.as_bool()).unwrap_or(false);
    let fields = value
        .get("fields")
        .and_then(|f| f.as_array())
        .map(|fields| {
            fields
                .iter()
                .map(|f| {
                    let referenced: Vec<String> = f
                        .get("referenceTo")
                        .and_then(|r| r.as_array())
                        .map(|r| r.iter().filter_map(|e| e.as_str().map(String::from)).collect())
                        .unwrap_or_default();
                    let field_type =
                        FieldType::from_api(f.get("type").and_then(|t| t.as_str()).unwrap_or(""));
                    FieldDescribe {
                        name: f.get("name").and_then(|n| n.as_str()).unwrap_or("").to_string(),
                        is_lookup: field_type == FieldType::Reference && !referenced.is_empty(),
                        is_polymorphic: referenced.len() > 1 || flag(f, "polymorphicForeignKey"),
                        field_type,
                        creatable: flag(f, "createable"),
                        updateable: flag(f, "updateable"),
                        referenced_entities: referenced,
                        relationship_name: f
                            .get("relationshipName")
                            .and_then(|r| r.as_str())
                            .map(String::from),
                        is_external_id: flag(f, "externalId"),
                        is_name_field: flag(f, "nameField"),
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    EntityDescribe {
        name: value.get("name").and_then(|n| n.as_str()).unwrap_or("").to_string(),
        creatable: flag(value, "createable"),
        updateable: flag(value, "updateable"),
        deletable: flag(value, "deletable"),
        fields,
    }
}

#[async_trait]
impl OrgConnection for HttpOrgConnection {
    fn name(&self) -> &str {
        &self.credentials.name
    }

    async fn describe(&self, entity: &str) -> Result<EntityDescribe> {
        let url = self.data_url(&format!("sobjects/{}/describe", entity));
        let body = self.send_json(self.request(Method::GET, &url)).await?;
        Ok(parse_describe(&body))
    }

    async fn query(&self, soql: &str) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        let mut url = format!(
            "{}?q={}",
            self.data_url("query"),
            urlencoding::encode(soql)
        );

        loop {
            let body = self.send_json(self.request(Method::GET, &url)).await?;
            if let Some(page) = body.get("records").and_then(|r| r.as_array()) {
                records.extend(page.iter().cloned().filter_map(strip_attributes));
            }
            match body.get("nextRecordsUrl").and_then(|n| n.as_str()) {
                Some(next) if !body.get("done").and_then(|d| d.as_bool()).unwrap_or(true) => {
                    url = format!("{}{}", self.credentials.instance_url, next);
                }
                _ => break,
            }
        }

        debug!("Query returned {} records: {}", records.len(), soql);
        Ok(records)
    }

    fn rest(&self) -> Option<&dyn RestApi> {
        Some(self)
    }

    fn bulk_v1(&self) -> Option<&dyn BulkV1Api> {
        Some(self)
    }

    fn bulk_v2(&self) -> Option<&dyn BulkV2Api> {
        Some(self)
    }
}

#[async_trait]
impl RestApi for HttpOrgConnection {
    async fn execute(
        &self,
        entity: &str,
        operation: ApiOperation,
        records: &[Record],
        all_or_none: bool,
    ) -> Result<Vec<RecordResult>> {
        let url = self.data_url("composite/sobjects");
        let builder = match operation {
            ApiOperation::Insert | ApiOperation::Update => {
                let payload: Vec<Value> = records
                    .iter()
                    .map(|r| {
                        let mut fields = r.fields().clone();
                        fields.insert("attributes".to_string(), json!({ "type": entity }));
                        Value::Object(fields)
                    })
                    .collect();
                let method = if operation == ApiOperation::Insert {
                    Method::POST
                } else {
                    Method::PATCH
                };
                self.request(method, &url)
                    .json(&json!({ "allOrNone": all_or_none, "records": payload }))
            }
            ApiOperation::Delete => {
                let ids: Vec<String> = records.iter().filter_map(|r| r.id()).collect();
                self.request(Method::DELETE, &url).query(&[
                    ("ids", ids.join(",")),
                    ("allOrNone", all_or_none.to_string()),
                ])
            }
            ApiOperation::HardDelete => {
                return Err(MigrationError::Capability {
                    engine: "REST hardDelete".to_string(),
                    connection: self.credentials.name.clone(),
                    entity: entity.to_string(),
                });
            }
        };

        let body = self.send_json(builder).await?;
        let results = body
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .map(|item| {
                        let mut result = parse_record_result(item);
                        result.created = result.success && operation == ApiOperation::Insert;
                        result
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(results)
    }
}

#[async_trait]
impl BulkV1Api for HttpOrgConnection {
    async fn create_job(&self, entity: &str, operation: ApiOperation) -> Result<String> {
        let body = self
            .send_json(self.async_request(Method::POST, "job").json(&json!({
                "operation": operation.api_name(),
                "object": entity,
                "contentType": "JSON",
            })))
            .await?;
        job_id(&body)
    }

    async fn add_batch(&self, job_id_value: &str, records: &[Record]) -> Result<String> {
        let body = self
            .send_json(
                self.async_request(Method::POST, &format!("job/{}/batch", job_id_value))
                    .json(records),
            )
            .await?;
        job_id(&body)
    }

    async fn close_job(&self, job_id_value: &str) -> Result<()> {
        self.send_json(
            self.async_request(Method::POST, &format!("job/{}", job_id_value))
                .json(&json!({ "state": "Closed" })),
        )
        .await?;
        Ok(())
    }

    async fn batch_status(&self, job_id_value: &str, batch_id: &str) -> Result<BatchInfo> {
        let body = self
            .send_json(self.async_request(
                Method::GET,
                &format!("job/{}/batch/{}", job_id_value, batch_id),
            ))
            .await?;
        Ok(BatchInfo {
            state: BatchState::from_api(body.get("state").and_then(|s| s.as_str()).unwrap_or("")),
            processed: usize_field(&body, "numberRecordsProcessed"),
            failed: usize_field(&body, "numberRecordsFailed"),
            message: body
                .get("stateMessage")
                .and_then(|m| m.as_str())
                .map(String::from),
        })
    }

    async fn batch_results(&self, job_id_value: &str, batch_id: &str) -> Result<Vec<RecordResult>> {
        let body = self
            .send_json(self.async_request(
                Method::GET,
                &format!("job/{}/batch/{}/result", job_id_value, batch_id),
            ))
            .await?;
        Ok(body
            .as_array()
            .map(|items| items.iter().map(parse_record_result).collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl BulkV2Api for HttpOrgConnection {
    async fn create_job(&self, entity: &str, operation: ApiOperation) -> Result<String> {
        let url = self.data_url("jobs/ingest");
        let body = self
            .send_json(self.request(Method::POST, &url).json(&json!({
                "object": entity,
                "operation": operation.api_name(),
                "contentType": "CSV",
                "lineEnding": "LF",
            })))
            .await?;
        job_id(&body)
    }

    async fn upload(&self, job_id_value: &str, records: &[Record]) -> Result<()> {
        let url = self.data_url(&format!("jobs/ingest/{}/batches", job_id_value));
        let csv = records_to_csv(records)?;
        self.send_text(
            self.request(Method::PUT, &url)
                .header(reqwest::header::CONTENT_TYPE, "text/csv")
                .body(csv),
        )
        .await?;
        Ok(())
    }

    async fn close_job(&self, job_id_value: &str) -> Result<()> {
        let url = self.data_url(&format!("jobs/ingest/{}", job_id_value));
        self.send_json(
            self.request(Method::PATCH, &url)
                .json(&json!({ "state": "UploadComplete" })),
        )
        .await?;
        Ok(())
    }

    async fn job_status(&self, job_id_value: &str) -> Result<JobInfo> {
        let url = self.data_url(&format!("jobs/ingest/{}", job_id_value));
        let body = self.send_json(self.request(Method::GET, &url)).await?;
        Ok(JobInfo {
            state: JobState::from_api(body.get("state").and_then(|s| s.as_str()).unwrap_or("")),
            processed: usize_field(&body, "numberRecordsProcessed"),
            failed: usize_field(&body, "numberRecordsFailed"),
            message: body
                .get("errorMessage")
                .and_then(|m| m.as_str())
                .filter(|m| !m.is_empty())
                .map(String::from),
        })
    }

    async fn results(&self, job_id_value: &str, set: ResultSet) -> Result<Vec<Record>> {
        let path = match set {
            ResultSet::Successful => "successfulResults",
            ResultSet::Failed => "failedResults",
            ResultSet::Unprocessed => "unprocessedrecords",
        };
        let url = self.data_url(&format!("jobs/ingest/{}/{}/", job_id_value, path));
        let text = self.send_text(self.request(Method::GET, &url)).await?;
        csv_to_records(&text)
    }
}
