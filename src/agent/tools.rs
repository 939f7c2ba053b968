//! Finance tools exposed to the model.
//!
//! Four operations (create/read/update/delete transaction), each bound to
//! one owning user at construction so an invocation can never touch another
//! user's data. Results are deliberately human-readable strings, not
//! structured objects: they are fed straight back into the model's context,
//! and the standard system instruction defines the textual protocol:
//! anything starting with "Error:" is a failure, everything else
//! (including the no-results notice) is success.

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::provider::ToolSchema;
use crate::store::{
    NewTransaction, TransactionFilter, TransactionKind, TransactionPatch, TransactionStore,
};

pub const CREATE_TOOL: &str = "create_financial_transaction";
pub const READ_TOOL: &str = "read_financial_transactions";
pub const UPDATE_TOOL: &str = "update_financial_transaction";
pub const DELETE_TOOL: &str = "delete_financial_transaction";

const DEFAULT_READ_LIMIT: u32 = 50;

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn schema(&self) -> ToolSchema;
    async fn execute(&self, arguments: &str) -> anyhow::Result<String>;
}

/// True for operations that mutate the store; these drive cache
/// invalidation in the orchestrator.
pub fn is_write_operation(name: &str) -> bool {
    matches!(name, CREATE_TOOL | UPDATE_TOOL | DELETE_TOOL)
}

/// Build the four tools bound to one owning user.
pub fn create_tools_for_user(
    user_id: &str,
    store: Arc<dyn TransactionStore>,
) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(CreateTransactionTool {
            owner_id: user_id.to_string(),
            store: store.clone(),
        }),
        Arc::new(ReadTransactionsTool {
            owner_id: user_id.to_string(),
            store: store.clone(),
        }),
        Arc::new(UpdateTransactionTool {
            owner_id: user_id.to_string(),
            store: store.clone(),
        }),
        Arc::new(DeleteTransactionTool {
            owner_id: user_id.to_string(),
            store,
        }),
    ]
}

/// Per-user cache of bound tool handles.
///
/// Rebuilding four handles on every step is wasteful, but a stale handle
/// must never mask a mutation: the orchestrator invalidates before a write
/// batch runs and again after it succeeds. Last-invalidate-wins is
/// acceptable; each orchestrator run proceeds sequentially per thread.
pub struct ToolCache {
    store: Arc<dyn TransactionStore>,
    entries: Mutex<HashMap<String, Arc<Vec<Arc<dyn Tool>>>>>,
}

impl ToolCache {
    pub fn new(store: Arc<dyn TransactionStore>) -> Self {
        Self {
            store,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn tools_for_user(&self, user_id: &str) -> Arc<Vec<Arc<dyn Tool>>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .entry(user_id.to_string())
            .or_insert_with(|| {
                debug!("Binding tool handles for user {}", user_id);
                Arc::new(create_tools_for_user(user_id, self.store.clone()))
            })
            .clone()
    }

    pub fn invalidate(&self, user_id: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.remove(user_id).is_some() {
            debug!("Invalidated tool handles for user {}", user_id);
        }
    }
}

fn parse_arguments(arguments: &str) -> Result<Value, String> {
    serde_json::from_str(arguments).map_err(|e| format!("Error: Invalid tool arguments: {e}"))
}

/// Decode a monetary JSON value without a float detour.
fn decimal_field(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}

fn date_field(value: &Value) -> Option<NaiveDate> {
    value
        .as_str()
        .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
}

// --- CREATE ---

struct CreateTransactionTool {
    owner_id: String,
    store: Arc<dyn TransactionStore>,
}

#[async_trait]
impl Tool for CreateTransactionTool {
    fn name(&self) -> &str {
        CREATE_TOOL
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: CREATE_TOOL.to_string(),
            description:
                "Use this tool to record a new financial transaction (income or expense) for the user."
                    .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "type": {
                        "type": "string",
                        "enum": ["income", "expense"],
                        "description": "Type of transaction"
                    },
                    "category": {
                        "type": "string",
                        "description": "The category of the transaction (e.g., 'Salary', 'Food & Beverage', 'Transportation')"
                    },
                    "amount": {
                        "type": "number",
                        "description": "The monetary value of the transaction as a positive number"
                    },
                    "date": {
                        "type": "string",
                        "description": "The date of the transaction in YYYY-MM-DD format"
                    },
                    "description": {
                        "type": "string",
                        "description": "A brief note about the transaction"
                    },
                    "sourceOrPaymentMethod": {
                        "type": "string",
                        "description": "Source of income or method of payment"
                    }
                },
                "required": ["type", "category", "amount", "date"]
            }),
        }
    }

    async fn execute(&self, arguments: &str) -> anyhow::Result<String> {
        if self.owner_id.is_empty() {
            return Ok("Error: User ID is missing. Cannot create transaction.".to_string());
        }

        let args = match parse_arguments(arguments) {
            Ok(v) => v,
            Err(e) => return Ok(e),
        };
        debug!("{} received: {}", CREATE_TOOL, args);

        let kind_raw = args.get("type").and_then(Value::as_str);
        let category = args.get("category").and_then(Value::as_str);
        let has_amount = args.get("amount").is_some_and(|v| !v.is_null());
        let date_raw = args.get("date").and_then(Value::as_str);

        let (Some(kind_raw), Some(category), true, Some(date_raw)) =
            (kind_raw, category, has_amount, date_raw)
        else {
            return Ok(
                "Error: Missing required fields: type, category, amount, or date.".to_string(),
            );
        };

        let Some(kind) = TransactionKind::parse(kind_raw) else {
            return Ok(
                "Error: Invalid transaction type. Must be 'income' or 'expense'.".to_string(),
            );
        };

        let amount = args.get("amount").and_then(decimal_field);
        let Some(amount) = amount.filter(|a| *a > Decimal::ZERO) else {
            return Ok("Error: Amount must be a positive number.".to_string());
        };

        let Ok(date) = NaiveDate::parse_from_str(date_raw, "%Y-%m-%d") else {
            return Ok("Error: Invalid date format. Please use YYYY-MM-DD.".to_string());
        };

        let tx = NewTransaction {
            owner_id: self.owner_id.clone(),
            kind,
            category: category.to_string(),
            amount,
            date,
            description: args
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string),
            source_or_payment_method: args
                .get("sourceOrPaymentMethod")
                .and_then(Value::as_str)
                .map(str::to_string),
        };

        match self.store.insert_one(tx).await {
            Ok(id) => Ok(format!(
                "Transaction created successfully with ID: {id}. \
                 Amount: {amount}, Category: {category}, Date: {date_raw}."
            )),
            Err(e) => Ok(format!("Error creating transaction: {e}")),
        }
    }
}

// --- READ ---

struct ReadTransactionsTool {
    owner_id: String,
    store: Arc<dyn TransactionStore>,
}

#[async_trait]
impl Tool for ReadTransactionsTool {
    fn name(&self) -> &str {
        READ_TOOL
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: READ_TOOL.to_string(),
            description: "Use this tool to read the user's financial transactions.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "limit": {
                        "type": "integer",
                        "description": "Number of transactions to return"
                    },
                    "category": {
                        "type": "string",
                        "description": "Filter by category"
                    },
                    "type": {
                        "type": "string",
                        "enum": ["income", "expense"],
                        "description": "Filter by transaction type"
                    },
                    "startDate": {
                        "type": "string",
                        "description": "Filter transactions from this date (YYYY-MM-DD)"
                    },
                    "endDate": {
                        "type": "string",
                        "description": "Filter transactions up to this date (YYYY-MM-DD)"
                    }
                }
            }),
        }
    }

    async fn execute(&self, arguments: &str) -> anyhow::Result<String> {
        if self.owner_id.is_empty() {
            return Ok("Error: User ID is missing. Cannot read transactions.".to_string());
        }

        let args = match parse_arguments(arguments) {
            Ok(v) => v,
            Err(e) => return Ok(e),
        };
        debug!("{} received: {}", READ_TOOL, args);

        let limit = match args.get("limit") {
            None | Some(Value::Null) => DEFAULT_READ_LIMIT,
            Some(v) => match v.as_u64().filter(|l| *l > 0) {
                Some(l) => l as u32,
                None => return Ok("Error: limit must be a positive integer.".to_string()),
            },
        };

        let kind = match args.get("type").and_then(Value::as_str) {
            Some(raw) => match TransactionKind::parse(raw) {
                Some(kind) => Some(kind),
                None => {
                    return Ok(
                        "Error: Invalid transaction type. Must be 'income' or 'expense'."
                            .to_string(),
                    );
                }
            },
            None => None,
        };

        let mut filter = TransactionFilter {
            kind,
            category: args
                .get("category")
                .and_then(Value::as_str)
                .map(str::to_string),
            limit: Some(limit),
            ..Default::default()
        };

        if let Some(v) = args.get("startDate").filter(|v| !v.is_null()) {
            match date_field(v) {
                Some(date) => filter.start_date = Some(date),
                None => {
                    return Ok("Error: Invalid date format. Please use YYYY-MM-DD.".to_string());
                }
            }
        }
        if let Some(v) = args.get("endDate").filter(|v| !v.is_null()) {
            match date_field(v) {
                Some(date) => filter.end_date = Some(date),
                None => {
                    return Ok("Error: Invalid date format. Please use YYYY-MM-DD.".to_string());
                }
            }
        }

        let transactions = match self.store.find(&self.owner_id, &filter).await {
            Ok(rows) => rows,
            Err(e) => return Ok(format!("Error reading transactions: {e}")),
        };

        if transactions.is_empty() {
            return Ok("No transactions found matching your criteria.".to_string());
        }

        let formatted: Vec<Value> = transactions
            .iter()
            .map(|t| {
                json!({
                    "transactionId": t.id,
                    "type": t.kind.as_str(),
                    "category": t.category,
                    "amount": t.amount,
                    "date": t.date.format("%Y-%m-%d").to_string(),
                    "description": t.description,
                    "sourceOrPaymentMethod": t.source_or_payment_method,
                })
            })
            .collect();

        let listing =
            serde_json::to_string_pretty(&formatted).unwrap_or_else(|_| "[]".to_string());
        Ok(format!(
            "Found {} transactions:\n{listing}",
            transactions.len()
        ))
    }
}

// --- UPDATE ---

struct UpdateTransactionTool {
    owner_id: String,
    store: Arc<dyn TransactionStore>,
}

#[async_trait]
impl Tool for UpdateTransactionTool {
    fn name(&self) -> &str {
        UPDATE_TOOL
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: UPDATE_TOOL.to_string(),
            description: "Use this tool to update an existing financial transaction for the user."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "transactionId": {
                        "type": "string",
                        "description": "The ID of the transaction to update"
                    },
                    "updates": {
                        "type": "object",
                        "description": "Object with fields to update",
                        "properties": {
                            "type": {
                                "type": "string",
                                "enum": ["income", "expense"],
                                "description": "New transaction type"
                            },
                            "category": { "type": "string", "description": "New category" },
                            "amount": { "type": "number", "description": "New amount" },
                            "date": { "type": "string", "description": "New date (YYYY-MM-DD)" },
                            "description": { "type": "string", "description": "New description" },
                            "sourceOrPaymentMethod": {
                                "type": "string",
                                "description": "New source or payment method"
                            }
                        }
                    }
                },
                "required": ["transactionId", "updates"]
            }),
        }
    }

    async fn execute(&self, arguments: &str) -> anyhow::Result<String> {
        if self.owner_id.is_empty() {
            return Ok("Error: User ID is missing. Cannot update transaction.".to_string());
        }

        let args = match parse_arguments(arguments) {
            Ok(v) => v,
            Err(e) => return Ok(e),
        };
        debug!("{} received: {}", UPDATE_TOOL, args);

        let Some(transaction_id) = args
            .get("transactionId")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
        else {
            return Ok("Error: transactionId is required to update a transaction.".to_string());
        };

        let updates = args.get("updates").and_then(Value::as_object);
        let Some(updates) = updates.filter(|u| !u.is_empty()) else {
            return Ok("Error: updates object is empty. Nothing to update.".to_string());
        };

        let mut patch = TransactionPatch::default();

        if let Some(raw) = updates.get("type").and_then(Value::as_str) {
            match TransactionKind::parse(raw) {
                Some(kind) => patch.kind = Some(kind),
                None => {
                    return Ok(
                        "Error: Invalid transaction type. Must be 'income' or 'expense'."
                            .to_string(),
                    );
                }
            }
        }
        if let Some(category) = updates.get("category").and_then(Value::as_str) {
            patch.category = Some(category.to_string());
        }
        if let Some(v) = updates.get("amount").filter(|v| !v.is_null()) {
            match decimal_field(v).filter(|a| *a > Decimal::ZERO) {
                Some(amount) => patch.amount = Some(amount),
                None => return Ok("Error: Amount must be a positive number.".to_string()),
            }
        }
        if let Some(v) = updates.get("date").filter(|v| !v.is_null()) {
            match date_field(v) {
                Some(date) => patch.date = Some(date),
                None => {
                    return Ok(
                        "Error: Invalid date format in updates. Please use YYYY-MM-DD."
                            .to_string(),
                    );
                }
            }
        }
        if let Some(description) = updates.get("description").and_then(Value::as_str) {
            patch.description = Some(description.to_string());
        }
        if let Some(source) = updates.get("sourceOrPaymentMethod").and_then(Value::as_str) {
            patch.source_or_payment_method = Some(source.to_string());
        }

        if patch.is_empty() {
            return Ok("Error: No valid fields provided for update after processing.".to_string());
        }

        match self
            .store
            .update_one(&self.owner_id, transaction_id, patch)
            .await
        {
            Ok(outcome) if outcome.matched == 0 => Ok(format!(
                "Error: No transaction found with ID {transaction_id} for this user."
            )),
            Ok(outcome) if outcome.modified == 0 => Ok(format!(
                "Transaction {transaction_id} found but no changes were made \
                 (values might be the same)."
            )),
            Ok(_) => Ok(format!("Transaction {transaction_id} updated successfully.")),
            Err(e) => Ok(format!("Error updating transaction: {e}")),
        }
    }
}

// --- DELETE ---

struct DeleteTransactionTool {
    owner_id: String,
    store: Arc<dyn TransactionStore>,
}

#[async_trait]
impl Tool for DeleteTransactionTool {
    fn name(&self) -> &str {
        DELETE_TOOL
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: DELETE_TOOL.to_string(),
            description: "Use this tool to delete a financial transaction for the user."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "transactionId": {
                        "type": "string",
                        "description": "The ID of the transaction to delete"
                    }
                },
                "required": ["transactionId"]
            }),
        }
    }

    async fn execute(&self, arguments: &str) -> anyhow::Result<String> {
        if self.owner_id.is_empty() {
            return Ok("Error: User ID is missing. Cannot delete transaction.".to_string());
        }

        let args = match parse_arguments(arguments) {
            Ok(v) => v,
            Err(e) => return Ok(e),
        };
        debug!("{} received: {}", DELETE_TOOL, args);

        let Some(transaction_id) = args
            .get("transactionId")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
        else {
            return Ok("Error: transactionId is required to delete a transaction.".to_string());
        };

        match self.store.delete_one(&self.owner_id, transaction_id).await {
            Ok(0) => Ok(format!(
                "Error: No transaction found with ID {transaction_id} for this user, \
                 or transaction has already been deleted."
            )),
            Ok(_) => Ok(format!("Transaction {transaction_id} deleted successfully.")),
            Err(e) => Ok(format!("Error deleting transaction: {e}")),
        }
    }
}
