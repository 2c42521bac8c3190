//! Response and follow-up synthesis
//!
//! Turns merged findings into conversational prose, generates the 2-3
//! follow-up prompts shown after a response, and writes the proactive
//! session greeting. Every method degrades to a usable default on model
//! failure; prose generation never fails a turn.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::error;

use crate::claude::{strip_code_fences, ClaudeClient};
use crate::models::{Finding, MessageRecord};
use crate::snapshot::FinancialSnapshot;

const HISTORY_WINDOW: usize = 6;
const MAX_FOLLOW_UPS: usize = 3;

const RESPONSE_FALLBACK: &str =
    "I encountered an issue analysing your request. Please try again.";

const RESPONSE_SYSTEM_PROMPT: &str = "\
You are a Canadian personal-finance assistant. Synthesize the analysis \
findings you are given into a short conversational answer to the user's \
question. Lead with the highest-impact insight, keep real dollar figures, \
and end with the single most useful action. Stay under 80 words. Return \
plain text only.";

const FOLLOW_UP_SYSTEM_PROMPT: &str = "\
You are generating follow-up question suggestions for a financial \
intelligence app. Based on the user's question, the assistant's response, \
and the underlying findings, generate exactly 2-3 specific follow-up \
questions the user might want to ask next. Include real dollar figures \
from the findings where possible and keep each question under 70 \
characters. Return ONLY a JSON array of strings.";

const GREETING_SYSTEM_PROMPT: &str = "\
You are a proactive financial intelligence assistant greeting a returning \
user. Summarise the top opportunities identified today: lead with the \
highest-impact finding, mention 2-3 specific amounts in CAD formatted as \
$X,XXX, and end with an invitation to explore further. Keep it to 3-4 \
sentences. Never say \"As an AI\" and do not start with \"I\".";

#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Conversational answer from findings. Never fails; degrades to a
    /// fixed apology line.
    async fn synthesize_response(
        &self,
        message: &str,
        findings: &Value,
        history: &[MessageRecord],
    ) -> String;

    /// 2-3 short follow-up prompts. Degrades to none.
    async fn generate_follow_ups(
        &self,
        message: &str,
        response: &str,
        findings: &Value,
    ) -> Vec<String>;

    /// Session-opening greeting from the top findings. Degrades to a
    /// deterministic sentence built from the snapshot.
    async fn synthesize_greeting(
        &self,
        top_findings: &[Finding],
        snapshot: &FinancialSnapshot,
    ) -> String;
}

pub struct LlmSynthesizer {
    client: Arc<ClaudeClient>,
}

impl LlmSynthesizer {
    pub fn new(client: Arc<ClaudeClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Synthesizer for LlmSynthesizer {
    async fn synthesize_response(
        &self,
        message: &str,
        findings: &Value,
        history: &[MessageRecord],
    ) -> String {
        let recent: Vec<_> = history
            .iter()
            .rev()
            .take(HISTORY_WINDOW)
            .rev()
            .map(|record| json!({"role": record.role, "content": record.content}))
            .collect();

        let user_content = json!({
            "user_message": message,
            "agent_findings": findings,
            "recent_history": recent,
        })
        .to_string();

        match self
            .client
            .complete(RESPONSE_SYSTEM_PROMPT, &user_content, 1024)
            .await
        {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                error!("Response synthesis failed: {}", e);
                RESPONSE_FALLBACK.to_string()
            }
        }
    }

    async fn generate_follow_ups(
        &self,
        message: &str,
        response: &str,
        findings: &Value,
    ) -> Vec<String> {
        let user_content = json!({
            "user_message": message,
            "assistant_response": response,
            "findings_context": findings,
        })
        .to_string();

        let raw = match self
            .client
            .complete(FOLLOW_UP_SYSTEM_PROMPT, &user_content, 256)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                error!("Follow-up generation failed: {}", e);
                return Vec::new();
            }
        };

        match serde_json::from_str::<Vec<String>>(strip_code_fences(&raw)) {
            Ok(chips) => chips.into_iter().take(MAX_FOLLOW_UPS).collect(),
            Err(e) => {
                error!("Follow-up payload malformed: {}", e);
                Vec::new()
            }
        }
    }

    async fn synthesize_greeting(
        &self,
        top_findings: &[Finding],
        snapshot: &FinancialSnapshot,
    ) -> String {
        let user_content = json!({
            "top_findings": top_findings,
            "portfolio_summary": {
                "total_value_cad": snapshot.total_value_cad,
                "total_gain_loss_cad": snapshot.total_gain_loss_cad,
            },
        })
        .to_string();

        match self
            .client
            .complete(GREETING_SYSTEM_PROMPT, &user_content, 512)
            .await
        {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                error!("Greeting synthesis failed: {}", e);
                fallback_greeting(snapshot)
            }
        }
    }
}

pub fn fallback_greeting(snapshot: &FinancialSnapshot) -> String {
    format!(
        "Welcome back. Your portfolio is worth ${:.2} CAD. \
         I've identified several opportunities — ask me anything to explore them.",
        snapshot.total_value_cad
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::demo_snapshot;

    #[test]
    fn test_fallback_greeting_carries_portfolio_value() {
        let snapshot = demo_snapshot();
        let greeting = fallback_greeting(&snapshot);
        assert!(greeting.contains("Welcome back"));
        assert!(greeting.contains(&format!("{:.2}", snapshot.total_value_cad)));
    }
}
