//! Subcommand implementations
//!
//! Each command returns its report as a string so `main` only prints.

use anyhow::Context;
use chrono::{Duration as ChronoDuration, Utc};
use confab_billing::{
    CreditCalculator, CreditConfig, CreditLedger, CreditPurchase, InMemoryPurchaseStore,
    InMemoryUsageStore, PurchaseStore,
};
use confab_chat::{
    InMemoryMessageStore, MessageStore, StoredMessage, StreamingCoordinator, TurnConfig,
    TurnDriver, TurnOutcome, TurnRequest, TurnStatus,
};
use confab_core::{MessagePart, Role, ToolState, event_stream};
use serde_json::json;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufRead;

const REPLAY_USER: &str = "local";
const REPLAY_CONVERSATION: &str = "replay";

/// Run a captured event stream through a full turn against in-memory stores
pub async fn replay<R>(
    reader: R,
    model: &str,
    credit_config: &CreditConfig,
    snapshot_interval: Duration,
) -> anyhow::Result<TurnOutcome>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let store = Arc::new(InMemoryMessageStore::new());
    let purchases = Arc::new(InMemoryPurchaseStore::new());
    let ledger = Arc::new(CreditLedger::new(
        credit_config,
        CreditCalculator::from_config(credit_config),
        store.clone(),
        purchases,
    ));

    let request = TurnRequest {
        user_id: REPLAY_USER.to_string(),
        conversation_id: REPLAY_CONVERSATION.to_string(),
        user_message_id: uuid::Uuid::new_v4().to_string(),
        assistant_message_id: uuid::Uuid::new_v4().to_string(),
        model: model.to_string(),
        period_start: Utc::now() - ChronoDuration::days(30),
    };
    store
        .append(StoredMessage::new(
            &request.user_id,
            &request.conversation_id,
            &request.user_message_id,
            Role::User,
            model,
        ))
        .await?;

    let driver = TurnDriver::new(store, Arc::new(StreamingCoordinator::new()))
        .with_ledger(ledger)
        .with_config(TurnConfig { snapshot_interval });
    let outcome = driver
        .run(&request, event_stream(reader))
        .await
        .context("Replay failed")?;
    Ok(outcome)
}

fn status_name(status: TurnStatus) -> &'static str {
    match status {
        TurnStatus::Completed => "completed",
        TurnStatus::Aborted => "aborted",
        TurnStatus::Failed => "failed",
    }
}

/// Render a replay outcome as JSON or as a short human summary
pub fn render_replay(outcome: &TurnOutcome, as_json: bool) -> anyhow::Result<String> {
    if as_json {
        let usage = outcome.usage.map(|u| {
            json!({
                "inputTokens": u.input_tokens,
                "outputTokens": u.output_tokens,
            })
        });
        let report = json!({
            "status": status_name(outcome.status),
            "parts": outcome.parts,
            "usage": usage,
            "credits": outcome.credits,
            "error": outcome.error,
        });
        return Ok(serde_json::to_string_pretty(&report)?);
    }

    let mut out = String::new();
    for part in &outcome.parts {
        match part {
            MessagePart::Text { text } => writeln!(out, "[text] {}", text)?,
            MessagePart::Reasoning { text, duration, .. } => match duration {
                Some(secs) => writeln!(out, "[reasoning {}s] {}", secs, text)?,
                None => writeln!(out, "[reasoning] {}", text)?,
            },
            MessagePart::ToolInvocation {
                name, state, result, ..
            } => {
                let state = match state {
                    ToolState::Call => "call",
                    ToolState::Result => "result",
                };
                match result {
                    Some(result) => writeln!(out, "[tool {} {}] {}", name, state, result)?,
                    None => writeln!(out, "[tool {} {}]", name, state)?,
                }
            }
            MessagePart::Sources { sources } => {
                writeln!(out, "[sources]")?;
                for source in sources {
                    writeln!(out, "  {} <{}>", source.title, source.url)?;
                }
            }
        }
    }

    write!(out, "status: {}", status_name(outcome.status))?;
    if let Some(error) = &outcome.error {
        write!(out, " ({})", error)?;
    }
    writeln!(out)?;
    if let Some(usage) = outcome.usage {
        writeln!(
            out,
            "tokens: {} in / {} out, {} credits",
            usage.input_tokens, usage.output_tokens, outcome.credits
        )?;
    }
    Ok(out)
}

/// Price one request
pub fn quote(
    calculator: &CreditCalculator,
    model: &str,
    input_tokens: u64,
    output_tokens: u64,
) -> String {
    let quote = calculator.quote(model, input_tokens, output_tokens);
    if quote.used_default_price {
        format!("{} credits ({} not priced, default rate used)", quote.credits, model)
    } else {
        format!("{} credits", quote.credits)
    }
}

/// List the pricing table, credits per million tokens
pub fn pricing(calculator: &CreditCalculator) -> String {
    let table = calculator.table();
    let width = table
        .entries()
        .iter()
        .map(|(model, _)| model.len())
        .max()
        .unwrap_or(0);

    let mut out = String::new();
    for (model, price) in table.entries() {
        let _ = writeln!(out, "{:<width$}  {:>7} in  {:>7} out", model, price.input, price.output);
    }
    let default = table.default_price();
    let _ = writeln!(
        out,
        "{:<width$}  {:>7} in  {:>7} out",
        "(default)", default.input, default.output
    );
    out
}

/// Deduct `amount` from packs of the given sizes, oldest first, and show what is left
pub async fn simulate_ledger(
    credit_config: &CreditConfig,
    pack_amounts: &[u64],
    amount: u64,
) -> anyhow::Result<String> {
    let purchases = Arc::new(InMemoryPurchaseStore::new());
    let start = Utc::now() - ChronoDuration::days(1);
    for (i, credits) in pack_amounts.iter().enumerate() {
        let purchased_at = start + ChronoDuration::minutes(i as i64);
        purchases
            .insert(CreditPurchase::new(REPLAY_USER, *credits, purchased_at))
            .await?;
    }

    let ledger = CreditLedger::new(
        credit_config,
        CreditCalculator::from_config(credit_config),
        Arc::new(InMemoryUsageStore::new()),
        purchases.clone(),
    );
    let deduction = ledger.deduct(REPLAY_USER, amount).await?;

    let mut out = String::new();
    writeln!(out, "deducted {} of {}", deduction.deducted, deduction.requested)?;
    if deduction.shortfall() > 0 {
        writeln!(out, "shortfall {}", deduction.shortfall())?;
    }
    let mut remaining = purchases.purchases(REPLAY_USER).await?;
    remaining.sort_by_key(|p| p.purchased_at);
    for purchase in remaining {
        writeln!(
            out,
            "  {:>7} / {:<7} {:?}",
            purchase.credits_remaining, purchase.credits_amount, purchase.status
        )?;
    }
    Ok(out)
}
