use reqwest::{Client, Method, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;

/// Literal line terminating every event stream.
pub const DONE_SENTINEL: &str = "[DONE]";
/// Response header naming the scope a fetched file was served under.
pub const FILE_SCOPE_HEADER: &str = "X-File-Scope";

const BASE_URL_ENV: &str = "CONFAB_BASE_URL";
const API_KEY_ENV: &str = "CONFAB_API_KEY";
const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";

#[derive(Debug, Error)]
pub enum ChatClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("chat protocol error: {0}")]
    Protocol(String),
}

/// Client for the serving process's streaming chat contract: create a
/// conversation, stream one turn, fetch the files the turn generated.
pub struct ChatClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl ChatClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http: Client::new(),
            base_url,
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Builds a client from `CONFAB_BASE_URL` and `CONFAB_API_KEY`, falling
    /// back to the local default address.
    pub fn from_env() -> Self {
        let base_url =
            std::env::var(BASE_URL_ENV).unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let mut client = Self::new(base_url);
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.is_empty() {
                client = client.with_api_key(key);
            }
        }
        client
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut builder = self.http.request(method, url);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    /// Creates a conversation and returns its id.
    pub async fn create_conversation(&self, title: &str) -> Result<String, ChatClientError> {
        let response = self
            .request(Method::POST, "conversations")
            .json(&json!({ "title": title }))
            .send()
            .await?
            .error_for_status()?;
        let body: Value = response.json().await?;
        body.get("id")
            .or_else(|| body.get("conversation_id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                ChatClientError::Protocol("conversation id missing from create response".into())
            })
    }

    /// Streams one turn and accumulates it until the `[DONE]` sentinel or
    /// the end of the stream. Unparseable event lines are skipped, never
    /// fatal.
    pub async fn stream_message(
        &self,
        conversation_id: &str,
        text: &str,
        model: &str,
    ) -> Result<StreamedTurn, ChatClientError> {
        let mut response = self
            .request(
                Method::POST,
                &format!("conversations/{conversation_id}/messages"),
            )
            .json(&json!({ "content": text, "model": model }))
            .send()
            .await?
            .error_for_status()?;

        let mut turn = TurnAccumulator::default();
        let mut line_buffer = String::new();
        'stream: while let Some(chunk) = response.chunk().await? {
            line_buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(newline) = line_buffer.find('\n') {
                let line: String = line_buffer.drain(..=newline).collect();
                turn.push_line(&line);
                if turn.saw_done() {
                    break 'stream;
                }
            }
        }
        if !turn.saw_done() && !line_buffer.trim().is_empty() {
            let trailing = std::mem::take(&mut line_buffer);
            turn.push_line(&trailing);
        }
        Ok(turn.finish())
    }

    /// Fetches a generated file from the conversation's scope at
    /// `<base>/files/<conversation-id>/<filename>`.
    pub async fn fetch_generated_file(
        &self,
        conversation_id: &str,
        filename: &str,
    ) -> Result<FetchedFile, ChatClientError> {
        let response = self
            .request(Method::GET, &format!("files/{conversation_id}/{filename}"))
            .send()
            .await?
            .error_for_status()?;
        let file_scope = response
            .headers()
            .get(FILE_SCOPE_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await?.to_vec();
        Ok(FetchedFile { bytes, file_scope })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedFile {
    pub bytes: Vec<u8>,
    pub file_scope: Option<String>,
}

/// One finished streamed turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamedTurn {
    /// Concatenated incremental text.
    pub text: String,
    /// Generated files accumulated across every `files_generated` event,
    /// de-duplicated preserving first announcement order.
    pub files: Vec<String>,
    /// Raw status of the `final` event, when one arrived.
    pub status: Option<String>,
    /// True only for a `final` event with status `success`.
    pub succeeded: bool,
    /// True when the stream ended with the `[DONE]` sentinel.
    pub completed: bool,
    /// Event lines that could not be parsed and were skipped.
    pub skipped_lines: usize,
}

/// Builds a [`StreamedTurn`] from raw SSE lines. Kept separate from the
/// HTTP plumbing so protocol handling is testable without a server.
#[derive(Debug, Default)]
pub struct TurnAccumulator {
    text: String,
    files: Vec<String>,
    status: Option<String>,
    saw_done: bool,
    skipped_lines: usize,
}

impl TurnAccumulator {
    /// Feeds one stream line. Blank keep-alives and comment lines are
    /// ignored; `data:` payloads are parsed as events; anything unparseable
    /// is counted and skipped.
    pub fn push_line(&mut self, line: &str) {
        if self.saw_done {
            return;
        }
        let line = line.trim();
        if line.is_empty() || line.starts_with(':') {
            return;
        }
        let Some(payload) = line.strip_prefix("data:") else {
            return;
        };
        let payload = payload.trim();
        if payload == DONE_SENTINEL {
            self.saw_done = true;
            return;
        }
        match serde_json::from_str::<StreamEvent>(payload) {
            Ok(StreamEvent::Content { delta }) => self.text.push_str(&delta),
            Ok(StreamEvent::FilesGenerated { files }) => {
                for file in files {
                    if !self.files.contains(&file) {
                        self.files.push(file);
                    }
                }
            }
            Ok(StreamEvent::Final { result }) => self.status = Some(result.status),
            Ok(StreamEvent::Unknown) => {}
            Err(err) => {
                self.skipped_lines += 1;
                warn!(error = %err, "skipping unparseable stream line");
            }
        }
    }

    pub fn saw_done(&self) -> bool {
        self.saw_done
    }

    pub fn finish(self) -> StreamedTurn {
        let succeeded = self.status.as_deref() == Some("success");
        StreamedTurn {
            text: self.text,
            files: self.files,
            status: self.status,
            succeeded,
            completed: self.saw_done,
            skipped_lines: self.skipped_lines,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    Content {
        #[serde(default)]
        delta: String,
    },
    FilesGenerated {
        #[serde(default)]
        files: Vec<String>,
    },
    Final {
        result: FinalResult,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct FinalResult {
    #[serde(default)]
    status: String,
}
