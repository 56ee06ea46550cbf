//! Unpacks webhook events into inbound messages and runs the reply flow
//! for each, off the request path.

use std::sync::Arc;

use serde_json::Value;
use tracing::Instrument;
use uuid::Uuid;

use crate::app::{add_message, AppState};
use crate::error::ProcessError;
use crate::types::{InboundMessage, MessageRecord};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessReport {
    pub received: usize,
    pub skipped: usize,
    pub replied: usize,
    pub fallbacks: usize,
    pub suppressed: usize,
}

#[derive(Debug)]
pub struct DispatchOutcome {
    pub event_id: Uuid,
    pub result: Result<ProcessReport, ProcessError>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Extracted {
    pub messages: Vec<InboundMessage>,
    pub skipped: usize,
}

fn array_at<'a>(value: &'a Value, key: &str) -> &'a [Value] {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Walk `entry[].changes[].value.messages[]`. Levels that are missing or of
/// the wrong type count as empty; messages without a sender or text body are
/// counted in `skipped`.
pub fn extract_messages(payload: &Value) -> Extracted {
    let mut extracted = Extracted::default();

    for entry in array_at(payload, "entry") {
        for change in array_at(entry, "changes") {
            let Some(value) = change.get("value") else {
                continue;
            };
            for message in array_at(value, "messages") {
                let from = message
                    .get("from")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .unwrap_or("");
                let text = message
                    .get("text")
                    .and_then(|t| t.get("body"))
                    .and_then(Value::as_str)
                    .unwrap_or("");

                if from.is_empty() || text.trim().is_empty() {
                    tracing::warn!(raw = %message, "skipping inbound message without sender or text");
                    extracted.skipped += 1;
                    continue;
                }

                extracted.messages.push(InboundMessage {
                    from: from.to_string(),
                    text: text.to_string(),
                });
            }
        }
    }

    extracted
}

pub async fn process_event(
    state: &Arc<AppState>,
    payload: &Value,
) -> Result<ProcessReport, ProcessError> {
    let extracted = extract_messages(payload);
    let mut report = ProcessReport {
        skipped: extracted.skipped,
        ..ProcessReport::default()
    };

    for inbound in extracted.messages {
        tracing::info!(from = %inbound.from, "inbound message");
        add_message(state, MessageRecord::from_user(&inbound.from, &inbound.text)).await?;
        report.received += 1;

        if state.honor_bot_toggle && state.store.bot_enabled(&inbound.from).await? == Some(false) {
            tracing::info!(from = %inbound.from, "bot disabled for contact, reply withheld");
            report.suppressed += 1;
            continue;
        }

        let reply = state.replies.generate(&inbound.from, &inbound.text).await;
        if reply.is_fallback() {
            report.fallbacks += 1;
        }
        let text = reply.text().trim();
        if text.is_empty() {
            tracing::debug!(from = %inbound.from, "empty reply, nothing to send");
            continue;
        }

        let outcome = state.transport.send_text(&inbound.from, text).await;
        if !outcome.is_delivered() {
            tracing::warn!(from = %inbound.from, ?outcome, "reply not delivered");
        }

        add_message(state, MessageRecord::from_bot(&inbound.from, text)).await?;
        report.replied += 1;
    }

    Ok(report)
}

/// Run `process_event` detached from the caller and return its event id
/// immediately. The outcome is logged and, when a hook is installed on the
/// state, forwarded there; the caller never sees it.
pub fn dispatch(state: Arc<AppState>, payload: Value) -> Uuid {
    let event_id = Uuid::new_v4();
    let span = tracing::info_span!("webhook_event", %event_id);
    let hook = state.dispatch_hook.clone();

    tokio::spawn(
        async move {
            let worker = tokio::spawn(
                async move { process_event(&state, &payload).await }
                    .instrument(tracing::Span::current()),
            );
            let result = match worker.await {
                Ok(result) => result,
                Err(err) => Err(ProcessError::Aborted(err.to_string())),
            };

            match &result {
                Ok(report) => tracing::info!(
                    received = report.received,
                    skipped = report.skipped,
                    replied = report.replied,
                    fallbacks = report.fallbacks,
                    suppressed = report.suppressed,
                    "webhook event processed"
                ),
                Err(err) => tracing::error!(error = %err, "webhook event failed"),
            }

            if let Some(hook) = hook {
                let _ = hook.send(DispatchOutcome { event_id, result });
            }
        }
        .instrument(span),
    );

    event_id
}
