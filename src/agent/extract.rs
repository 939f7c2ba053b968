//! Best-effort extraction of transaction fields from a receipt analysis.
//!
//! The vision model replies with a loosely structured Indonesian template;
//! when the user later confirms, the fields are recovered from that text
//! with fixed label patterns. Parsing semi-structured model output is
//! inherently fragile, so the whole bridge lives behind this one function
//! and returns `None` rather than guessing when no amount can be found.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::debug;

use super::provider::{Message, Role};

// Labeled amount is preferred; the bare currency pattern is a fallback and
// takes the first figure in the message even when several appear.
static AMOUNT_LABELED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:Jumlah|Total|Amount):\s*Rp\.?\s*([\d.,]+)").unwrap());
static AMOUNT_BARE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)Rp\.?\s*([\d.,]+)").unwrap());
static DATE_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:Tanggal|Date)(?:\s+Transaksi)?:\s*([^\n]+)").unwrap());
static CATEGORY_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:Kategori|Category):\s*([^\n]+)").unwrap());
static DESCRIPTION_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:Deskripsi|Description|Merchant):\s*([^\n]+)").unwrap());
static DESCRIPTION_FALLBACK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:di|at|from)\s+([^\n,]+)").unwrap());

/// Fields recovered from an analysis message. Always an expense dated
/// today: receipts are recorded on confirmation day regardless of the
/// printed date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedTransaction {
    pub category: String,
    pub amount: Decimal,
    pub date: NaiveDate,
    pub description: String,
}

impl ExtractedTransaction {
    /// The exact parameter object for `create_financial_transaction`.
    pub fn to_tool_parameters(&self) -> serde_json::Value {
        json!({
            "type": "expense",
            "category": self.category,
            "amount": self.amount,
            "date": self.date.format("%Y-%m-%d").to_string(),
            "description": self.description,
        })
    }
}

/// Scan the history newest-first for an assistant message carrying the
/// analysis template and pull the transaction fields out of it.
pub fn extract_transaction_from_analysis(
    messages: &[Message],
    today: NaiveDate,
) -> Option<ExtractedTransaction> {
    for message in messages.iter().rev() {
        if message.role != Role::Assistant {
            continue;
        }
        let content = message.text_content();
        if content.is_empty() {
            continue;
        }

        let has_analysis = content.contains("Tanggal Transaksi:")
            || content.contains("Jumlah:")
            || content.contains("detail transaksi")
            || content.contains("Rp.")
            || content.contains("struk");
        if !has_analysis {
            continue;
        }

        let amount_capture = AMOUNT_LABELED
            .captures(content)
            .or_else(|| AMOUNT_BARE.captures(content));

        let date_capture = DATE_LABEL.captures(content);
        let category_capture = CATEGORY_LABEL.captures(content);
        let description_capture = DESCRIPTION_LABEL
            .captures(content)
            .or_else(|| DESCRIPTION_FALLBACK.captures(content));

        debug!(
            "Analysis field captures: amount={:?} date={:?} category={:?} description={:?}",
            amount_capture.as_ref().map(|c| c[1].to_string()),
            date_capture.as_ref().map(|c| c[1].to_string()),
            category_capture.as_ref().map(|c| c[1].to_string()),
            description_capture.as_ref().map(|c| c[1].to_string()),
        );

        let Some(amount_capture) = amount_capture else {
            debug!("Analysis message carries no amount, scanning older messages");
            continue;
        };

        // IDR figures use dots/commas as grouping separators: strip them and
        // read the digits as a whole number of rupiah.
        let cleaned: String = amount_capture[1]
            .chars()
            .filter(|c| *c != '.' && *c != ',')
            .collect();
        let Ok(amount) = cleaned.parse::<i64>() else {
            debug!("Unparseable amount figure: {}", &amount_capture[1]);
            continue;
        };

        let category = category_capture
            .map(|c| c[1].trim().to_string())
            .unwrap_or_else(|| "General".to_string());
        let description = description_capture
            .map(|c| c[1].trim().to_string())
            .unwrap_or_else(|| "Transaction from receipt".to_string());

        return Some(ExtractedTransaction {
            category,
            amount: Decimal::from(amount),
            date: today,
            description,
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MessageContent;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 5, 24).unwrap()
    }

    fn analysis_reply() -> Message {
        Message::assistant(
            "Berikut adalah detail transaksi yang telah diambil dari struk:\n\n\
             Tanggal Transaksi: 2023-11-02\n\
             Jumlah: Rp. 75.000\n\
             Kategori: Transportasi\n\
             Deskripsi: Grab ke bandara\n\n\
             Ketik \"Tambah\" untuk menambahkan transaksi ini ke database Anda.",
        )
    }

    #[test]
    fn test_extracts_labeled_fields() {
        let messages = vec![Message::user("analisis struk ini"), analysis_reply()];
        let extracted = extract_transaction_from_analysis(&messages, today()).unwrap();

        assert_eq!(extracted.amount, Decimal::from(75000));
        assert_eq!(extracted.category, "Transportasi");
        assert_eq!(extracted.description, "Grab ke bandara");
        // The printed receipt date is ignored: records land on today
        assert_eq!(extracted.date, today());
    }

    #[test]
    fn test_tool_parameters_shape() {
        let messages = vec![analysis_reply()];
        let params = extract_transaction_from_analysis(&messages, today())
            .unwrap()
            .to_tool_parameters();

        assert_eq!(params["type"], "expense");
        assert_eq!(params["category"], "Transportasi");
        assert_eq!(params["amount"].to_string(), "75000");
        assert_eq!(params["date"], "2025-05-24");
    }

    #[test]
    fn test_defaults_when_labels_missing() {
        let messages = vec![Message::assistant(
            "Pembayaran sebesar Rp. 50.000 terdeteksi dari struk.",
        )];
        let extracted = extract_transaction_from_analysis(&messages, today()).unwrap();

        assert_eq!(extracted.amount, Decimal::from(50000));
        assert_eq!(extracted.category, "General");
    }

    #[test]
    fn test_no_amount_yields_none() {
        let messages = vec![Message::assistant(
            "Maaf, detail transaksi pada struk tidak terbaca.",
        )];
        assert!(extract_transaction_from_analysis(&messages, today()).is_none());
    }

    #[test]
    fn test_user_messages_are_never_scanned() {
        let messages = vec![Message::user("Jumlah: Rp. 99.999")];
        assert!(extract_transaction_from_analysis(&messages, today()).is_none());
    }

    #[test]
    fn test_labeled_amount_wins_over_earlier_bare_figure() {
        let messages = vec![Message::assistant(
            "Total belanja bulan ini Rp. 1.200.000.\nJumlah: Rp. 75.000\nKategori: Makanan",
        )];
        let extracted = extract_transaction_from_analysis(&messages, today()).unwrap();
        assert_eq!(extracted.amount, Decimal::from(75000));
    }

    #[test]
    fn test_bare_fallback_takes_first_figure() {
        // Known fragility, preserved: with no label, the first currency
        // figure in the message wins.
        let messages = vec![Message::assistant(
            "Struk menunjukkan Rp. 10.000 untuk parkir dan Rp. 90.000 untuk bensin.",
        )];
        let extracted = extract_transaction_from_analysis(&messages, today()).unwrap();
        assert_eq!(extracted.amount, Decimal::from(10000));
    }

    #[test]
    fn test_newest_analysis_message_wins() {
        let mut older = analysis_reply();
        older.content = MessageContent::Text("Jumlah: Rp. 11.111\nKategori: Lama".to_string());
        let messages = vec![older, Message::user("tambah"), analysis_reply()];

        let extracted = extract_transaction_from_analysis(&messages, today()).unwrap();
        assert_eq!(extracted.amount, Decimal::from(75000));
        assert_eq!(extracted.category, "Transportasi");
    }
}
