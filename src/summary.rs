//! One-shot financial summary.
//!
//! A single prompt-and-parse round trip, deliberately outside the
//! orchestrator: fetch every transaction the user owns, ask the chat model
//! for a JSON analysis, strip any markdown fencing, and validate the
//! required keys. No iteration, no tools, no per-turn state.

use anyhow::{Context, Result, anyhow};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::agent::{ChatReply, LlmClient, Message};
use crate::store::{TransactionFilter, TransactionStore};

const SUMMARY_SYSTEM_PROMPT: &str = r#"You are a professional financial analyst AI. Analyze the provided transaction data and generate a comprehensive financial summary in JSON format.

IMPORTANT:
- Respond ONLY with valid JSON, no additional text
- Use Indonesian language for text fields
- Calculate percentages accurately
- Provide actionable insights and recommendations
- Group transactions by categories properly
- Calculate trends based on chronological data
- Include descriptive analysis and practical tips

Required JSON structure:
{
  "userId": "string",
  "period": {"startDate": "YYYY-MM-DD", "endDate": "YYYY-MM-DD", "totalDays": number},
  "income": {
    "total": number,
    "count": number,
    "averagePerTransaction": number,
    "categories": [{"category": "string", "amount": number, "percentage": number}]
  },
  "expenses": {
    "total": number,
    "count": number,
    "averagePerTransaction": number,
    "categories": [{"category": "string", "amount": number, "percentage": number}]
  },
  "netBalance": number,
  "insights": {
    "topExpenseCategory": "string",
    "topIncomeCategory": "string",
    "averageDailySpending": number,
    "averageDailyIncome": number,
    "spendingTrend": "increasing|decreasing|stable",
    "recommendations": ["string"]
  },
  "monthlyBreakdown": [{"month": "YYYY-MM", "income": number, "expenses": number, "netBalance": number}],
  "descriptiveSummary": {
    "overallFinancialHealth": "string",
    "spendingPattern": "string",
    "savingsRate": number,
    "financialHabits": ["string"]
  },
  "tips": {
    "budgetingTips": ["string"],
    "savingsTips": ["string"],
    "investmentSuggestions": ["string"],
    "immediateActions": ["string"]
  }
}"#;

/// Generate the summary for one user. `None` when the user has no
/// transactions at all.
pub async fn generate_financial_summary(
    llm: &Arc<dyn LlmClient>,
    store: &Arc<dyn TransactionStore>,
    user_id: &str,
) -> Result<Option<Value>> {
    let transactions = store
        .find(user_id, &TransactionFilter::default())
        .await
        .context("fetching transactions for summary")?;

    if transactions.is_empty() {
        return Ok(None);
    }

    let transaction_data: Vec<Value> = transactions
        .iter()
        .map(|t| {
            json!({
                "id": t.id,
                "type": t.kind.as_str(),
                "category": t.category,
                "amount": t.amount,
                "description": t.description,
                "date": t.date.format("%Y-%m-%d").to_string(),
            })
        })
        .collect();

    let user_prompt = format!(
        "Analisis data transaksi keuangan berikut dan berikan ringkasan dalam format JSON:\n\n\
         USER ID: {user_id}\n\
         TOTAL TRANSAKSI: {count}\n\n\
         DATA TRANSAKSI:\n{data}\n\n\
         Berikan analisis mendalam termasuk:\n\
         1. Ringkasan pendapatan dan pengeluaran per kategori\n\
         2. Tren pengeluaran (naik/turun/stabil)\n\
         3. Rekomendasi pengelolaan keuangan\n\
         4. Breakdown bulanan jika data mencakup lebih dari 1 bulan\n\
         5. Insight dan pola spending behavior\n\n\
         Pastikan semua perhitungan akurat dan JSON valid.",
        count = transactions.len(),
        data = serde_json::to_string_pretty(&transaction_data)?,
    );

    let messages = vec![
        Message::system(SUMMARY_SYSTEM_PROMPT),
        Message::user(user_prompt),
    ];

    let reply = llm.invoke(&messages, None).await?;
    let content = match reply {
        ChatReply::Text(text) => text,
        ChatReply::ToolCalls(_) => {
            return Err(anyhow!("summary model unexpectedly requested tool calls"));
        }
    };

    let summary = parse_summary_json(&content).inspect_err(|e| {
        warn!("Could not parse summary response: {e}");
        debug!("Raw summary response: {content}");
    })?;

    Ok(Some(summary))
}

/// Strip markdown code fences the model may wrap around its JSON and
/// validate the fields every consumer relies on.
fn parse_summary_json(content: &str) -> Result<Value> {
    let cleaned = content
        .trim()
        .replace("```json", "")
        .replace("```", "")
        .trim()
        .to_string();

    let summary: Value =
        serde_json::from_str(&cleaned).context("summary response is not valid JSON")?;

    for key in ["userId", "period", "income", "expenses"] {
        if summary.get(key).is_none() {
            return Err(anyhow!("summary response is missing required field '{key}'"));
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ToolSchema;
    use crate::store::{NewTransaction, SqliteStore, TransactionKind};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use std::sync::Mutex;

    struct CannedClient {
        reply: String,
        prompts: Mutex<Vec<Vec<Message>>>,
    }

    #[async_trait]
    impl LlmClient for CannedClient {
        async fn invoke(
            &self,
            messages: &[Message],
            _tools: Option<&[ToolSchema]>,
        ) -> anyhow::Result<ChatReply> {
            self.prompts.lock().unwrap().push(messages.to_vec());
            Ok(ChatReply::Text(self.reply.clone()))
        }
    }

    fn valid_summary() -> String {
        json!({
            "userId": "user-1",
            "period": {"startDate": "2025-05-01", "endDate": "2025-05-31", "totalDays": 31},
            "income": {"total": 0, "count": 0, "averagePerTransaction": 0, "categories": []},
            "expenses": {"total": 50000, "count": 1, "averagePerTransaction": 50000, "categories": []},
            "netBalance": -50000
        })
        .to_string()
    }

    async fn seeded_store() -> Arc<dyn TransactionStore> {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert_one(NewTransaction {
                owner_id: "user-1".to_string(),
                kind: TransactionKind::Expense,
                category: "Food & Beverage".to_string(),
                amount: Decimal::from(50000),
                date: NaiveDate::from_ymd_opt(2025, 5, 24).unwrap(),
                description: None,
                source_or_payment_method: None,
            })
            .await
            .unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_no_transactions_yields_none_without_model_call() {
        let store: Arc<dyn TransactionStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let llm: Arc<dyn LlmClient> = Arc::new(CannedClient {
            reply: valid_summary(),
            prompts: Mutex::new(Vec::new()),
        });

        let result = generate_financial_summary(&llm, &store, "user-1")
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_summary_parses_fenced_json() {
        let store = seeded_store().await;
        let client = Arc::new(CannedClient {
            reply: format!("```json\n{}\n```", valid_summary()),
            prompts: Mutex::new(Vec::new()),
        });
        let llm: Arc<dyn LlmClient> = client.clone();

        let summary = generate_financial_summary(&llm, &store, "user-1")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(summary["userId"], "user-1");
        assert_eq!(summary["expenses"]["total"], json!(50000));

        // The prompt carried the user's data, exactly once through the model
        let prompts = client.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0][1].text_content().contains("TOTAL TRANSAKSI: 1"));
        assert!(prompts[0][1].text_content().contains("Food & Beverage"));
    }

    #[tokio::test]
    async fn test_invalid_summary_structure_is_an_error() {
        let store = seeded_store().await;
        let llm: Arc<dyn LlmClient> = Arc::new(CannedClient {
            reply: r#"{"userId": "user-1"}"#.to_string(),
            prompts: Mutex::new(Vec::new()),
        });

        let result = generate_financial_summary(&llm, &store, "user-1").await;
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_rejects_non_json() {
        assert!(parse_summary_json("Maaf, saya tidak bisa menganalisis itu.").is_err());
    }
}
