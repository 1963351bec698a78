//! Terminal rendering of requests and line-based operator input.

use std::io::Write;

use anyhow::{Context, Result};
use chrono::Local;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Stdin};

use crate::consumer::{Answer, ConsumerEvent, Responder};
use crate::core::sanitize;
use crate::core::types::{Request, RequestKind};

/// Line that ends multi-line feedback when typed on its own.
pub const END_OF_FEEDBACK: &str = "EOF";

/// Responder that asks a human at a terminal.
///
/// Generic over the streams so tests can feed bytes and capture output.
pub struct TerminalResponder<R, W> {
    input: R,
    output: W,
}

impl TerminalResponder<BufReader<Stdin>, std::io::Stdout> {
    pub fn stdio() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), std::io::stdout())
    }
}

impl<R, W> TerminalResponder<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: Write + Send,
{
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    pub fn into_output(self) -> W {
        self.output
    }

    fn render(&mut self, request: &Request) -> std::io::Result<()> {
        let source = if request.source.is_empty() {
            "Unknown Tool"
        } else {
            request.source.as_str()
        };
        let out = &mut self.output;
        writeln!(out)?;
        writeln!(out, "New request received (ID: {}...)", request.id.short())?;
        writeln!(out, "Time: {}", Local::now().format("%Y-%m-%d %H:%M:%S"))?;
        writeln!(out)?;
        writeln!(out, "=== HITL request from {source} ({}) ===", request.kind)?;
        writeln!(out, "{}", request.prompt)?;

        if let Some(context) = request.context.as_ref().filter(|c| !c.is_empty()) {
            writeln!(out)?;
            writeln!(out, "Context:")?;
            for (key, value) in context {
                writeln!(out, "  {key}: {}", display_value(value))?;
            }
        }
        out.flush()
    }

    /// Next input line without its terminator, or `None` at end of input.
    async fn read_line(&mut self) -> Result<Option<String>> {
        let mut buf = Vec::new();
        let read = self
            .input
            .read_until(b'\n', &mut buf)
            .await
            .context("read operator input")?;
        if read == 0 {
            return Ok(None);
        }
        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }
        Ok(Some(sanitize::lossy_text(&buf).into_owned()))
    }

    async fn read_feedback(&mut self) -> Result<Answer> {
        writeln!(self.output)?;
        writeln!(self.output, "Your feedback:")?;
        writeln!(self.output, "  * press Enter for a new line")?;
        writeln!(
            self.output,
            "  * type '{END_OF_FEEDBACK}' on its own line or press Ctrl+D to submit"
        )?;

        let mut lines = Vec::new();
        loop {
            write!(self.output, "[{}] ", lines.len() + 1)?;
            self.output.flush()?;
            match self.read_line().await? {
                Some(line) if line == END_OF_FEEDBACK => break,
                Some(line) => lines.push(line),
                None => break,
            }
        }

        let value = lines.join("\n");
        writeln!(self.output)?;
        if value.trim().is_empty() {
            writeln!(self.output, "No feedback provided")?;
        } else {
            writeln!(self.output, "Received {} lines of feedback", lines.len())?;
        }
        self.output.flush()?;
        Ok(Answer::Value(Value::String(value)))
    }
}

impl<R, W> Responder for TerminalResponder<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: Write + Send,
{
    async fn answer(&mut self, request: &Request) -> Result<Answer> {
        self.render(request).context("render request")?;
        match request.kind {
            RequestKind::Feedback => self.read_feedback().await,
            RequestKind::Notify => {
                writeln!(self.output)?;
                writeln!(self.output, "Press Enter to acknowledge...")?;
                self.output.flush()?;
                self.read_line().await?;
                Ok(Answer::Value(Value::Bool(true)))
            }
        }
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Greeting printed when a shell attaches to a queue.
pub fn welcome(target: &str) -> String {
    format!("HITL shell started\nConnected to: {target}\nWaiting for requests...")
}

/// Print a consumer event to stdout: a dot per idle poll, a line otherwise.
pub fn report_event(event: &ConsumerEvent) {
    let mut out = std::io::stdout().lock();
    let _ = match (event, describe_event(event)) {
        (ConsumerEvent::Idle, _) => write!(out, "."),
        (ConsumerEvent::Delivered(_), Some(line)) => {
            writeln!(out, "\n{line}\n\nWaiting for next request...")
        }
        (_, Some(line)) => writeln!(out, "\n{line}"),
        (_, None) => Ok(()),
    };
    let _ = out.flush();
}

/// Operator-facing line for a consumer event, if it deserves one.
pub fn describe_event(event: &ConsumerEvent) -> Option<String> {
    match event {
        ConsumerEvent::Delivered(_) => Some("✓ Response sent successfully".to_string()),
        ConsumerEvent::NotFound(id) => Some(format!(
            "✗ Request {} expired or was already answered",
            id.short()
        )),
        ConsumerEvent::DeliveryFailed { error, .. } => {
            Some(format!("✗ Failed to send response: {error}"))
        }
        ConsumerEvent::ClaimFailed(error) => Some(format!("Error polling server: {error}")),
        ConsumerEvent::Cancelled(id) => Some(format!("Request {} cancelled", id.short())),
        ConsumerEvent::Idle | ConsumerEvent::Claimed(_) | ConsumerEvent::Answered(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::core::types::RequestId;

    async fn answer_with(input: &[u8], request: &Request) -> (Answer, String) {
        let mut responder = TerminalResponder::new(input, Vec::new());
        let answer = responder.answer(request).await.expect("answer");
        let output = String::from_utf8(responder.into_output()).expect("utf8 output");
        (answer, output)
    }

    #[tokio::test]
    async fn feedback_reads_lines_until_eof_marker() {
        let request = Request::feedback("Review this?")
            .with_source("deployer")
            .with_context(json!({"file": "main.py", "lines": 100}).as_object().cloned().expect("object"));

        let (answer, output) = answer_with(b"first\nsecond\nEOF\nignored\n", &request).await;

        assert_eq!(answer, Answer::Value(json!("first\nsecond")));
        assert!(output.contains("HITL request from deployer"), "{output}");
        assert!(output.contains("Review this?"));
        assert!(output.contains("  file: main.py"));
        assert!(output.contains("  lines: 100"));
        assert!(output.contains("[1] ") && output.contains("[3] "));
        assert!(output.contains("Received 2 lines of feedback"));
    }

    #[tokio::test]
    async fn end_of_input_submits_feedback() {
        let request = Request::feedback("ok?");
        let (answer, output) = answer_with(b"only line\r\n", &request).await;
        assert_eq!(answer, Answer::Value(json!("only line")));
        assert!(output.contains("Unknown Tool"));
    }

    #[tokio::test]
    async fn empty_feedback_is_still_an_answer() {
        let (answer, output) = answer_with(b"", &Request::feedback("ok?")).await;
        assert_eq!(answer, Answer::Value(json!("")));
        assert!(output.contains("No feedback provided"));
    }

    #[tokio::test]
    async fn invalid_utf8_input_is_replaced() {
        let (answer, _) = answer_with(b"caf\xe9\nEOF\n", &Request::feedback("ok?")).await;
        assert_eq!(answer, Answer::Value(json!("caf\u{FFFD}")));
    }

    #[tokio::test]
    async fn notify_waits_for_enter_and_acknowledges() {
        let (answer, output) = answer_with(b"\n", &Request::notify("Deploy finished")).await;
        assert_eq!(answer, Answer::Value(json!(true)));
        assert!(output.contains("Deploy finished"));
        assert!(output.contains("Press Enter to acknowledge..."));
        assert!(!output.contains("Your feedback"));
    }

    #[test]
    fn events_worth_showing_are_described() {
        let id = RequestId::from("0123456789abcdef");
        assert_eq!(describe_event(&ConsumerEvent::Idle), None);
        assert_eq!(
            describe_event(&ConsumerEvent::Delivered(id.clone())).as_deref(),
            Some("✓ Response sent successfully")
        );
        assert_eq!(
            describe_event(&ConsumerEvent::NotFound(id)).as_deref(),
            Some("✗ Request 01234567 expired or was already answered")
        );
    }
}
