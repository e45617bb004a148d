// HTTP backend for the research execution API
//
// One client covers the four remote operations the core needs:
// - POST /execute/async                         start a research job or a chat turn
// - GET  /workflows/runs/{workflow}/{run}/stream server-sent workflow messages
// - GET  /objects/count                         number of documents in the library

use crate::backend::provider::{
    ChatBackend, ChunkStream, DocumentCounter, EventStreamSource, JobBackend, StreamChunk,
};
use crate::config::ApiConfig;
use crate::jobs::prompt::build_research_prompt;
use crate::models::ResearchParameters;
use crate::types::{ClientError, ClientResult, WorkflowRun};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

const RESEARCH_INTERACTION: &str = "DeepResearch";
const CHAT_INTERACTION: &str = "DocumentChat";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpBackend {
    client: Client,
    base_url: String,
    api_key: String,
    request_timeout: Duration,
}

// Request types
#[derive(Serialize)]
struct ExecuteRequest<T: Serialize> {
    #[serde(rename = "type")]
    kind: &'static str,
    interaction: &'static str,
    data: T,
}

#[derive(Serialize)]
struct ResearchTask {
    #[serde(rename = "Task")]
    task: String,
}

#[derive(Serialize)]
struct ChatTurnData<'a> {
    document_id: &'a str,
    question: &'a str,
    conversation_history: &'a str,
}

// Response types
#[derive(Deserialize)]
struct CountResponse {
    count: u64,
}

#[derive(Deserialize)]
struct ApiErrorResponse {
    #[serde(default)]
    error: Option<ApiErrorBody>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    message: String,
}

impl HttpBackend {
    pub fn new(config: &ApiConfig) -> ClientResult<Self> {
        // No overall client timeout: stream requests stay open for the whole turn
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        if self.api_key.is_empty() {
            builder
        } else {
            builder.header("Authorization", format!("Bearer {}", self.api_key))
        }
    }

    async fn execute_async<T: Serialize>(
        &self,
        interaction: &'static str,
        data: T,
    ) -> ClientResult<WorkflowRun> {
        let request = ExecuteRequest {
            kind: "conversation",
            interaction,
            data,
        };

        let response = self
            .authorized(self.client.post(self.url("/execute/async")))
            .timeout(self.request_timeout)
            .json(&request)
            .send()
            .await?;

        let run: WorkflowRun = Self::check_status(response).await?.json().await?;
        info!(interaction, run = %run, "Workflow started");
        Ok(run)
    }

    /// Turn a non-2xx response into an `Api` error carrying the server message
    async fn check_status(response: Response) -> ClientResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let error_text = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<ApiErrorResponse>(&error_text)
            .ok()
            .and_then(|e| e.error.map(|b| b.message).or(e.message))
            .unwrap_or(error_text);

        Err(ClientError::Api(format!("{} ({})", detail, status)))
    }
}

#[async_trait]
impl JobBackend for HttpBackend {
    async fn create_document_job(&self, parameters: &ResearchParameters) -> ClientResult<WorkflowRun> {
        let today = chrono::Local::now().date_naive();
        let task = build_research_prompt(parameters, today);
        self.execute_async(RESEARCH_INTERACTION, ResearchTask { task }).await
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn create_chat_turn(
        &self,
        document_id: &str,
        question: &str,
        history: &str,
    ) -> ClientResult<WorkflowRun> {
        let data = ChatTurnData {
            document_id,
            question,
            conversation_history: history,
        };
        self.execute_async(CHAT_INTERACTION, data).await
    }
}

#[async_trait]
impl EventStreamSource for HttpBackend {
    async fn open_event_stream(&self, run: &WorkflowRun) -> ClientResult<ChunkStream> {
        let url = self.url(&format!(
            "/workflows/runs/{}/{}/stream",
            run.workflow_id, run.run_id
        ));

        let response = self
            .authorized(self.client.get(url))
            .header("Accept", "text/event-stream")
            .send()
            .await?;
        let response = Self::check_status(response).await?;

        debug!(run = %run, "Event stream opened");

        let chunks = response
            .bytes_stream()
            .eventsource()
            .filter_map(|event| async move {
                match event {
                    Ok(event) if event.data.trim().is_empty() => None,
                    Ok(event) => Some(
                        serde_json::from_str::<StreamChunk>(&event.data).map_err(ClientError::from),
                    ),
                    Err(e) => Some(Err(ClientError::Stream(e.to_string()))),
                }
            });

        Ok(chunks.boxed())
    }
}

#[async_trait]
impl DocumentCounter for HttpBackend {
    async fn current_document_count(&self) -> ClientResult<u64> {
        let response = self
            .authorized(self.client.get(self.url("/objects/count")))
            .timeout(self.request_timeout)
            .send()
            .await?;

        let body: CountResponse = Self::check_status(response).await?.json().await?;
        Ok(body.count)
    }
}
