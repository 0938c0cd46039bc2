//! MCP tool server over stdio.
//!
//! Line-delimited JSON-RPC 2.0: one request per line on stdin, one response
//! per line on stdout. Logs must go to stderr so they never corrupt the
//! protocol stream.
//!
//! Requests are handled concurrently, so a long `convert_to_markdown` call
//! does not hold up `ping` or `get_task_status`. Responses are written in
//! completion order and matched to requests by `id`.

use crate::config::{ConvertOptions, TaskParams, DEFAULT_MODEL_VERSION};
use crate::convert::{handle_from_ids, Converter};
use crate::error::MineruError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const SERVER_NAME: &str = "mineru-markdown-converter";

const FORMATS_DESC: &str = "Supported formats: PDF, DOC, DOCX, PPT, PPTX, PNG, JPG, JPEG, HTML";

// ── Protocol types ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct McpRequest {
    #[serde(default)]
    pub jsonrpc: String,
    /// Absent for notifications. An explicit `null` is `Some(Value::Null)`
    /// and still gets a reply.
    #[serde(default, deserialize_with = "present_value")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

fn present_value<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(d).map(Some)
}

#[derive(Debug, Serialize)]
pub struct McpResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<McpError>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct McpError {
    pub code: i32,
    pub message: String,
}

impl McpError {
    const PARSE_ERROR: i32 = -32700;
    const METHOD_NOT_FOUND: i32 = -32601;
    const INVALID_PARAMS: i32 = -32602;

    fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: Self::INVALID_PARAMS,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct McpToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

// ── Tool arguments ───────────────────────────────────────────────────────

fn default_model() -> String {
    DEFAULT_MODEL_VERSION.to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_wait() -> u64 {
    300
}

fn default_poll_interval() -> u64 {
    10
}

#[derive(Debug, Deserialize)]
struct CreateParseTaskArgs {
    url: String,
    #[serde(default = "default_model")]
    model_version: String,
    #[serde(default)]
    is_ocr: bool,
    #[serde(default = "default_true")]
    enable_formula: bool,
    #[serde(default = "default_true")]
    enable_table: bool,
}

#[derive(Debug, Deserialize)]
struct TaskStatusArgs {
    task_id: Option<String>,
    batch_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DownloadResultArgs {
    #[serde(alias = "result_url")]
    zip_url: String,
    output_path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct ConvertArgs {
    url: String,
    output_path: PathBuf,
    model_version: Option<String>,
    #[serde(default = "default_max_wait")]
    max_wait_seconds: u64,
    #[serde(default = "default_poll_interval")]
    poll_interval: u64,
}

fn parse_args<T: for<'de> Deserialize<'de>>(arguments: Value) -> Result<T, McpError> {
    serde_json::from_value(arguments).map_err(|e| McpError::invalid_params(format!("Invalid arguments: {e}")))
}

fn require_non_empty(field: &str, value: &str) -> Result<(), McpError> {
    if value.trim().is_empty() {
        return Err(McpError::invalid_params(format!("{field} is required")));
    }
    Ok(())
}

/// Tool output: text content, optionally flagged as a tool-level failure.
fn tool_text(text: impl Into<String>, is_error: bool) -> Value {
    let mut result = json!({
        "content": [{ "type": "text", "text": text.into() }]
    });
    if is_error {
        result["isError"] = json!(true);
    }
    result
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn error_text(e: &MineruError) -> String {
    if e.is_validation() {
        format!("Validation error: {e}")
    } else {
        e.to_string()
    }
}

// ── Server ───────────────────────────────────────────────────────────────

/// Dispatches MCP requests to a [`Converter`].
pub struct McpServer {
    converter: Converter,
}

impl McpServer {
    pub fn new(converter: Converter) -> Self {
        Self { converter }
    }

    /// The advertised tools. `convert_pdf_to_markdown` is an alias of
    /// `convert_to_markdown` with the same schema.
    pub fn tool_definitions() -> Vec<McpToolDefinition> {
        let convert_schema = json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": format!("URL or local file path of the document to parse. {FORMATS_DESC}")
                },
                "output_path": {
                    "type": "string",
                    "description": "Local path to save the result zip file (e.g., /output/result.zip)"
                },
                "model_version": {
                    "type": "string",
                    "description": "Model version (auto-detected by default: 'vlm' for most files, 'MinerU-HTML' for HTML). Override if needed.",
                    "default": DEFAULT_MODEL_VERSION
                },
                "max_wait_seconds": {
                    "type": "integer",
                    "description": "Maximum time to wait for each task in seconds (default: 300)",
                    "default": 300
                },
                "poll_interval": {
                    "type": "integer",
                    "description": "Status check interval in seconds (default: 10)",
                    "default": 10
                }
            },
            "required": ["url", "output_path"]
        });
        let convert_description = format!(
            "Complete workflow: Submit a document for parsing, wait for completion, and download the result. \
{FORMATS_DESC}. Accepts a URL or a local file path. Auto-detects file type and configures optimal settings. \
For large PDFs (>200MB or >600 pages), automatically splits into chunks and downloads each result. \
This is a convenience tool that combines task creation, polling, and download."
        );

        vec![
            McpToolDefinition {
                name: "create_parse_task".to_string(),
                description: format!(
                    "Create a document parsing task on MinerU API. {FORMATS_DESC}. \
Accepts a URL or a local file path. Returns a task_id (for URL) or batch_id (for local file) for tracking. \
Model version and OCR are auto-configured based on file type. \
For large PDFs (>200MB), automatically splits into chunks. \
For PDFs with >600 pages, automatically uses page ranges."
                ),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "url": {
                            "type": "string",
                            "description": format!("URL or local file path of the document to parse. {FORMATS_DESC}")
                        },
                        "model_version": {
                            "type": "string",
                            "description": "Model version (auto-detected by default: 'vlm' for most files, 'MinerU-HTML' for HTML). Override if needed.",
                            "default": DEFAULT_MODEL_VERSION
                        },
                        "is_ocr": {
                            "type": "boolean",
                            "description": "Enable OCR (auto-enabled for images, default: false for others)",
                            "default": false
                        },
                        "enable_formula": {
                            "type": "boolean",
                            "description": "Enable formula recognition (default: true)",
                            "default": true
                        },
                        "enable_table": {
                            "type": "boolean",
                            "description": "Enable table recognition (default: true)",
                            "default": true
                        }
                    },
                    "required": ["url"]
                }),
            },
            McpToolDefinition {
                name: "get_task_status".to_string(),
                description: "Check the status of a document parsing task. Accepts task_id (from URL-based parsing) \
or batch_id (from local file upload). Returns task state and result URL when done."
                    .to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "task_id": {
                            "type": "string",
                            "description": "Task ID returned from create_parse_task (URL-based)"
                        },
                        "batch_id": {
                            "type": "string",
                            "description": "Batch ID returned from create_parse_task (local file upload)"
                        }
                    }
                }),
            },
            McpToolDefinition {
                name: "download_result".to_string(),
                description: "Download the document parsing result zip file to local disk.".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "zip_url": {
                            "type": "string",
                            "description": "URL of the result zip file (from get_task_status)"
                        },
                        "output_path": {
                            "type": "string",
                            "description": "Local path to save the zip file (e.g., result.zip)"
                        }
                    },
                    "required": ["zip_url", "output_path"]
                }),
            },
            McpToolDefinition {
                name: "convert_to_markdown".to_string(),
                description: convert_description.clone(),
                input_schema: convert_schema.clone(),
            },
            McpToolDefinition {
                name: "convert_pdf_to_markdown".to_string(),
                description: convert_description,
                input_schema: convert_schema,
            },
        ]
    }

    /// Handle one request. `None` for notifications, which get no reply.
    pub async fn handle_request(&self, request: McpRequest) -> Option<McpResponse> {
        debug!(method = %request.method, "MCP request received");

        let id = match request.id {
            Some(id) => id,
            None => {
                debug!("Notification {}", request.method);
                return None;
            }
        };

        let result = match request.method.as_str() {
            "initialize" => Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": { "listChanged": false } },
                "serverInfo": {
                    "name": SERVER_NAME,
                    "version": env!("CARGO_PKG_VERSION")
                }
            })),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": Self::tool_definitions() })),
            "tools/call" => self.call_tool(request.params).await,
            other => Err(McpError {
                code: McpError::METHOD_NOT_FOUND,
                message: format!("Method not found: {other}"),
            }),
        };

        Some(match result {
            Ok(data) => McpResponse {
                jsonrpc: "2.0".to_string(),
                id,
                result: Some(data),
                error: None,
            },
            Err(error) => McpResponse {
                jsonrpc: "2.0".to_string(),
                id,
                result: None,
                error: Some(error),
            },
        })
    }

    /// Handle one raw protocol line, returning the serialised reply if any.
    pub async fn handle_line(&self, line: &str) -> Option<String> {
        let response = match serde_json::from_str::<McpRequest>(line) {
            Ok(request) => self.handle_request(request).await?,
            Err(e) => {
                warn!("Unparseable MCP message: {}", e);
                McpResponse {
                    jsonrpc: "2.0".to_string(),
                    id: Value::Null,
                    result: None,
                    error: Some(McpError {
                        code: McpError::PARSE_ERROR,
                        message: format!("Parse error: {e}"),
                    }),
                }
            }
        };
        serde_json::to_string(&response).ok()
    }

    async fn call_tool(&self, params: Option<Value>) -> Result<Value, McpError> {
        let params = params.unwrap_or(Value::Null);
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| McpError::invalid_params("Missing tool name"))?;
        let arguments = params
            .get("arguments")
            .cloned()
            .filter(|a| !a.is_null())
            .ok_or_else(|| McpError::invalid_params("Missing arguments"))?;

        info!("Tool call: {}", name);
        match name {
            "create_parse_task" => self.create_parse_task(parse_args(arguments)?).await,
            "get_task_status" => self.get_task_status(parse_args(arguments)?).await,
            "download_result" => self.download_result(parse_args(arguments)?).await,
            "convert_to_markdown" | "convert_pdf_to_markdown" => {
                self.convert_to_markdown(parse_args(arguments)?).await
            }
            other => Err(McpError {
                code: McpError::METHOD_NOT_FOUND,
                message: format!("Unknown tool: {other}"),
            }),
        }
    }

    async fn create_parse_task(&self, args: CreateParseTaskArgs) -> Result<Value, McpError> {
        require_non_empty("url", &args.url)?;
        let requested = TaskParams {
            model_version: args.model_version,
            is_ocr: args.is_ocr,
            enable_formula: args.enable_formula,
            enable_table: args.enable_table,
        };
        Ok(match self.converter.create_parse_task(&args.url, requested).await {
            Ok(receipt) => tool_text(pretty(&receipt.to_payload()), false),
            Err(e) => tool_text(error_text(&e), true),
        })
    }

    async fn get_task_status(&self, args: TaskStatusArgs) -> Result<Value, McpError> {
        let handle = handle_from_ids(args.task_id, args.batch_id)
            .map_err(|e| McpError::invalid_params(e.to_string()))?;
        Ok(match self.converter.get_task_status(&handle).await {
            Ok(payload) => tool_text(pretty(&payload), false),
            Err(e) => tool_text(pretty(&json!({ "error": e.to_string() })), true),
        })
    }

    async fn download_result(&self, args: DownloadResultArgs) -> Result<Value, McpError> {
        require_non_empty("zip_url", &args.zip_url)?;
        require_non_empty("output_path", &args.output_path.to_string_lossy())?;
        Ok(
            match self
                .converter
                .download_result(&args.zip_url, &args.output_path)
                .await
            {
                Ok(path) => tool_text(
                    pretty(&json!({ "success": true, "path": path.display().to_string() })),
                    false,
                ),
                Err(e) => tool_text(pretty(&json!({ "error": e.to_string() })), true),
            },
        )
    }

    async fn convert_to_markdown(&self, args: ConvertArgs) -> Result<Value, McpError> {
        require_non_empty("url", &args.url)?;
        require_non_empty("output_path", &args.output_path.to_string_lossy())?;
        let options =
            ConvertOptions::from_secs(args.model_version, args.max_wait_seconds, args.poll_interval);
        Ok(
            match self
                .converter
                .convert_to_markdown(&args.url, &args.output_path, &options)
                .await
            {
                Ok(report) => tool_text(report.to_string(), !report.is_success()),
                Err(e) => tool_text(error_text(&e), true),
            },
        )
    }

    /// Serve requests from `reader` until EOF, writing replies to `writer`.
    ///
    /// In-flight requests are allowed to finish after EOF. The writer is
    /// handed back once every reply has been written.
    pub async fn serve<R, W>(self: Arc<Self>, reader: R, mut writer: W) -> std::io::Result<W>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        let writer_task = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
            }
            Ok::<W, std::io::Error>(writer)
        });

        let mut in_flight = JoinSet::new();
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let server = Arc::clone(&self);
            let tx = tx.clone();
            in_flight.spawn(async move {
                if let Some(reply) = server.handle_line(&line).await {
                    let _ = tx.send(reply);
                }
            });
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                warn!("MCP request handler panicked: {}", e);
            }
        }
        drop(tx);

        writer_task
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))?
    }

    /// Serve the MCP protocol on this process's stdin/stdout.
    pub async fn serve_stdio(self: Arc<Self>) -> std::io::Result<()> {
        info!("{} listening on stdio", SERVER_NAME);
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        self.serve(stdin, tokio::io::stdout()).await?;
        info!("stdin closed, shutting down");
        Ok(())
    }
}
