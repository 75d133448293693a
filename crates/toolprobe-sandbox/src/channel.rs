//! Control channel over a sandbox's stdio.
//!
//! The lifecycle core needs a handshake (`initialize`) and a way to release
//! the channel (`close`). On top of that a ready channel can enumerate the
//! server's tools and invoke them.
//!
//! [`JsonRpcConnector`] provides the default channel: newline-delimited
//! JSON-RPC 2.0, as spoken by MCP stdio servers.

use crate::error::{Result, SandboxError};
use crate::runtime::SandboxStdio;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::process::Child;
use tracing::{debug, warn};

/// Protocol revision announced in the handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Longest line read from a sandbox; the tail of longer lines is dropped.
pub const MAX_LINE_BYTES: u64 = 8 * 1024 * 1024;

/// Time a process gets to exit on its own after its stdin is closed.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

// =============================================================================
// Tools
// =============================================================================

/// A tool advertised by a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    /// Tool name used in calls.
    pub name: String,
    /// Human-readable title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// What the tool does.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema of the arguments.
    #[serde(default)]
    pub input_schema: Value,
}

impl Tool {
    /// Renders the tool as a plain-text block for a language model prompt.
    #[must_use]
    pub fn format_for_llm(&self) -> String {
        let required: Vec<&str> = self
            .input_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let mut arguments = Vec::new();
        if let Some(properties) = self.input_schema.get("properties").and_then(Value::as_object) {
            for (name, info) in properties {
                let description = info
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("No description");
                let mut line = format!("- {name}: {description}");
                if required.contains(&name.as_str()) {
                    line.push_str(" (required)");
                }
                arguments.push(line);
            }
        }

        let mut output = format!("Tool: {}\n", self.name);
        if let Some(title) = &self.title {
            output.push_str(&format!("User-readable title: {title}\n"));
        }
        output.push_str(&format!(
            "Description: {}\nArguments:\n{}\n",
            self.description.as_deref().unwrap_or_default(),
            arguments.join("\n")
        ));
        output
    }
}

/// Result of a tool call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    /// Text items, decoded as JSON where they carry an object.
    pub items: Vec<Value>,
    /// The server flagged the call as failed.
    pub is_error: bool,
}

impl ToolOutput {
    fn from_result(tool: &str, result: &Value) -> Self {
        let mut items = Vec::new();
        let content = result.get("content").and_then(Value::as_array);
        for item in content.into_iter().flatten() {
            match item.get("type").and_then(Value::as_str) {
                Some("text") => {
                    let text = item.get("text").and_then(Value::as_str).unwrap_or_default();
                    items.push(decode_text(text));
                }
                Some(kind) => warn!(tool, kind, "unsupported tool result content"),
                None => warn!(tool, "tool result content without a type"),
            }
        }
        Self {
            items,
            is_error: result.get("isError").and_then(Value::as_bool).unwrap_or(false),
        }
    }
}

/// Decodes the outermost `{...}` of a text item, falling back to the text.
fn decode_text(text: &str) -> Value {
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<Value>(&text[start..=end]) {
                return value;
            }
        }
    }
    Value::String(text.to_string())
}

// =============================================================================
// Channel Seams
// =============================================================================

/// Handshake, tool access and release of a control channel.
#[async_trait]
pub trait ControlChannel: Send {
    /// Performs the protocol handshake.
    async fn initialize(&mut self) -> Result<()>;

    /// Lists the tools the server offers.
    async fn list_tools(&mut self) -> Result<Vec<Tool>>;

    /// Invokes a tool once.
    async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<ToolOutput>;

    /// Releases the channel and the process behind it.
    async fn close(&mut self) -> Result<()>;
}

/// Builds a control channel on top of a started sandbox.
pub trait ChannelConnector: Send + Sync {
    /// Takes ownership of the sandbox stdio.
    fn connect(&self, stdio: SandboxStdio) -> Box<dyn ControlChannel>;
}

/// Connector producing [`JsonRpcChannel`]s.
#[derive(Debug, Clone)]
pub struct JsonRpcConnector {
    client_name: String,
    client_version: String,
    max_line: u64,
}

impl Default for JsonRpcConnector {
    fn default() -> Self {
        Self::new("toolprobe", env!("CARGO_PKG_VERSION"))
    }
}

impl JsonRpcConnector {
    /// Creates a connector announcing the given client identity.
    #[must_use]
    pub fn new(client_name: impl Into<String>, client_version: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
            client_version: client_version.into(),
            max_line: MAX_LINE_BYTES,
        }
    }

    /// Sets the longest line the channel reads.
    #[must_use]
    pub fn with_max_line(mut self, bytes: u64) -> Self {
        self.max_line = bytes;
        self
    }
}

impl ChannelConnector for JsonRpcConnector {
    fn connect(&self, stdio: SandboxStdio) -> Box<dyn ControlChannel> {
        Box::new(JsonRpcChannel {
            reader: BufReader::new(stdio.reader),
            writer: Some(stdio.writer),
            child: stdio.child,
            next_id: 1,
            max_line: self.max_line,
            client_info: json!({
                "name": self.client_name,
                "version": self.client_version,
            }),
        })
    }
}

// =============================================================================
// JSON-RPC Channel
// =============================================================================

/// Newline-delimited JSON-RPC channel.
pub struct JsonRpcChannel {
    reader: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
    writer: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    child: Option<Child>,
    next_id: u64,
    max_line: u64,
    client_info: Value,
}

impl JsonRpcChannel {
    async fn send(&mut self, message: &Value) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| SandboxError::protocol("channel is closed"))?;
        let mut line = message.to_string();
        line.push('\n');
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| SandboxError::protocol(format!("write failed: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| SandboxError::protocol(format!("flush failed: {e}")))
    }

    /// Reads one raw line into `buf`. Bytes past `max_line` are discarded
    /// up to the next newline.
    async fn read_line(&mut self, buf: &mut Vec<u8>) -> std::io::Result<usize> {
        buf.clear();
        let read = (&mut self.reader)
            .take(self.max_line)
            .read_until(b'\n', buf)
            .await?;
        if read as u64 >= self.max_line && buf.last() != Some(&b'\n') {
            let mut discarded = 0;
            let mut rest = Vec::new();
            loop {
                rest.clear();
                let n = (&mut self.reader)
                    .take(self.max_line)
                    .read_until(b'\n', &mut rest)
                    .await?;
                discarded += n;
                if n == 0 || rest.last() == Some(&b'\n') {
                    break;
                }
            }
            debug!(kept = read, discarded, "truncated oversized line");
        }
        Ok(read)
    }

    /// Reads lines until the response to `id` arrives.
    ///
    /// Lines that are not JSON (bootstrap banners, listings with non-UTF-8
    /// file names, stray prints) and messages for other ids are skipped.
    async fn response(&mut self, method: &str, id: u64) -> Result<Value> {
        let mut line = Vec::new();
        loop {
            let read = self
                .read_line(&mut line)
                .await
                .map_err(|e| SandboxError::protocol(format!("read failed: {e}")))?;
            if read == 0 {
                return Err(SandboxError::protocol(format!(
                    "stream closed before the {method} response"
                )));
            }

            let Ok(message) = serde_json::from_slice::<Value>(&line) else {
                debug!(
                    line = %String::from_utf8_lossy(&line).trim_end(),
                    "skipping non-protocol output"
                );
                continue;
            };
            if message.get("id").and_then(Value::as_u64) == Some(id) {
                return Ok(message);
            }
        }
    }

    /// Sends a request and returns the `result` of its response.
    async fn request(&mut self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id;
        self.next_id += 1;

        self.send(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        }))
        .await?;

        let mut response = self.response(method, id).await?;
        if let Some(error) = response.get("error") {
            return Err(SandboxError::protocol(format!(
                "server rejected {method}: {error}"
            )));
        }
        response
            .get_mut("result")
            .map(Value::take)
            .ok_or_else(|| SandboxError::protocol(format!("{method} response has no result")))
    }
}

/// Handshake failures are reported as such, whatever step failed.
fn handshake_error(err: SandboxError) -> SandboxError {
    match err {
        SandboxError::Protocol(msg) => SandboxError::Handshake(msg),
        other => other,
    }
}

#[async_trait]
impl ControlChannel for JsonRpcChannel {
    async fn initialize(&mut self) -> Result<()> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": self.client_info,
        });
        let result = self
            .request("initialize", params)
            .await
            .map_err(handshake_error)?;
        let server = result
            .pointer("/serverInfo/name")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        debug!(server, "initialize acknowledged");

        self.send(&json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized",
        }))
        .await
        .map_err(handshake_error)
    }

    async fn list_tools(&mut self) -> Result<Vec<Tool>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.map_or_else(|| json!({}), |cursor| json!({ "cursor": cursor }));
            let mut result = self.request("tools/list", params).await?;

            let listed = result
                .get_mut("tools")
                .map_or_else(|| json!([]), Value::take);
            let page: Vec<Tool> = serde_json::from_value(listed)
                .map_err(|e| SandboxError::protocol(format!("malformed tool list: {e}")))?;
            tools.extend(page);

            cursor = result
                .get("nextCursor")
                .and_then(Value::as_str)
                .map(str::to_string);
            if cursor.is_none() {
                return Ok(tools);
            }
        }
    }

    async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<ToolOutput> {
        let params = json!({ "name": name, "arguments": arguments });
        let result = self.request("tools/call", params).await?;
        Ok(ToolOutput::from_result(name, &result))
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("closing channel input failed: {}", e);
            }
        }

        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        if tokio::time::timeout(CLOSE_GRACE, child.wait()).await.is_ok() {
            return Ok(());
        }
        warn!(pid = ?child.id(), "process did not exit after close, killing it");
        child.kill().await?;
        Ok(())
    }
}
