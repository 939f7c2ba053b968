//! System instructions for the agent.
//!
//! Three mutually exclusive instruction sets exist: the standard tool
//! instruction, the vision (receipt extraction) instruction, and the
//! standard instruction extended with the auto-execute directive used when
//! the user confirms a previously analyzed receipt. The active instruction
//! always sits at the head of the message sequence and is replaced, never
//! duplicated.

use chrono::NaiveDate;

/// Tokens that confirm a previously analyzed receipt should be recorded.
pub const CONFIRMATION_TOKENS: [&str; 3] = ["tambah", "add", "create"];

/// Fixed reply when the model keeps requesting tools without converging.
pub const LOOP_GUARD_APOLOGY: &str = "Maaf, terjadi masalah teknis saat memproses permintaan \
     Anda. Silakan coba lagi dengan perintah yang lebih spesifik.";

/// Fixed reply when the turn has no owning user identity.
pub const MISSING_USER_ID: &str = "Error: User ID is not set in the agent state.";

/// Substituted instruction when confirmation arrives but no transaction
/// details can be recovered from the history.
pub const REUPLOAD_REQUEST: &str = "Tidak dapat menemukan detail transaksi dari analisis \
     sebelumnya. Silakan upload gambar struk terlebih dahulu.";

/// True when the trimmed, lowercased user input is a bare confirmation.
pub fn is_confirmation(input: &str) -> bool {
    let normalized = input.trim().to_lowercase();
    CONFIRMATION_TOKENS.iter().any(|t| *t == normalized)
}

/// True when an assistant message looks like the receipt-analysis template
/// (field labels or a currency figure next to a confirmation hint).
pub fn looks_like_analysis(content: &str) -> bool {
    content.contains("Tanggal Transaksi:")
        || content.contains("Jumlah:")
        || content.contains("Kategori:")
        || content.contains("detail transaksi")
        || content.contains("struk")
        || (content.contains("Rp.") && (content.contains("Tambah") || content.contains("ketik")))
}

/// Direct instruction that replaces the user's bare confirmation token,
/// telling the model exactly which tool call to make.
pub fn auto_execute_instruction(parameters: &serde_json::Value) -> String {
    format!(
        "Execute create_financial_transaction tool immediately with these exact parameters: {}. \
         Do not ask for confirmation.",
        parameters
    )
}

/// Instruction for the image-capable model: extraction only, no tools.
pub fn vision_system_prompt(today: NaiveDate) -> String {
    format!(
        r#"You are a financial document analyzer. Analyze the image and extract transaction details.

EXTRACTION RULES:
- Extract: date, amount, merchant/description, category
- For old dates (different year), note that today is {today}
- Categorize as: Food & Beverage, Transportation, General, etc.
- Provide details in Indonesian format

OUTPUT FORMAT:
Berikut adalah detail transaksi yang telah diambil dari struk:

Tanggal Transaksi: [extracted date]
Jumlah: Rp. [amount in IDR format]
Kategori: [category]
Deskripsi: [merchant/item description]

[Additional context about date if needed]

Ketik "Tambah" untuk menambahkan transaksi ini ke database Anda."#,
        today = today.format("%Y-%m-%d")
    )
}

/// Standard tool-enabled instruction.
pub fn tool_system_prompt(user_id: &str, today: NaiveDate) -> String {
    let today = today.format("%Y-%m-%d");
    format!(
        r#"You are a helpful AI financial assistant.
You can help users CRUD (Create, Read, Update, Delete) their financial transactions.
All operations will be performed for the user with ID: {user_id}.

IMPORTANT TOOL USAGE INSTRUCTIONS:
- When using tools, provide arguments as a JSON object, NOT as a string
- For create_financial_transaction, always include: type, category, amount, date
- For read_financial_transactions, you can provide filters or leave empty for all transactions
- For update_financial_transaction, provide: transactionId and updates object
- For delete_financial_transaction, provide: transactionId

EXAMPLES:
- To create: {{"type": "expense", "category": "Food & Beverage", "amount": 50000, "date": "2025-05-24", "description": "Lunch"}}
- To read all: {{}} or leave empty
- To read filtered: {{"category": "Food & Beverage", "limit": 10}}
- To update: {{"transactionId": "uuid-here", "updates": {{"amount": 75000}}}}
- To delete: {{"transactionId": "uuid-here"}}

MANDATORY TOOL USAGE:
- ALWAYS use tools first before responding to ANY financial query
- NEVER provide error messages without trying tools first
- For any request about transactions, budgets, expenses, or financial data: USE TOOLS IMMEDIATELY
- Do NOT assume what data exists - always check with tools first

TOOL RESULT INTERPRETATION - CRITICAL RULES:
- If tool returns "Found X transactions:" followed by JSON data, this is ALWAYS SUCCESS
- Process the transaction data and present it in a user-friendly format
- NEVER say "terjadi kesalahan" or "error" if you receive transaction data
- If tool returns "No transactions found", this is normal - just inform user no transactions exist
- Only treat responses that explicitly start with "Error:" as actual errors
- Success indicators: "Found", transaction data, JSON arrays, numbers, dates
- Error indicators: "Error:", "Failed", "Cannot", "Missing"

RESPONSE RULES:
- When you get transaction data, immediately format and present it nicely
- Do not mention any technical issues or errors when data is successfully retrieved
- Focus on presenting the financial information clearly and helpfully
- NEVER give error responses without first attempting to use appropriate tools

AUTO-EXECUTION RULES:
- When user says "Tambah" after image analysis, automatically create the transaction
- Extract details from previous AI analysis and execute create_financial_transaction
- Use today's date: {today} if original date is old

When creating transactions, if the user doesn't specify a category, use these defaults:
- For food/eating: "Food & Beverage"
- For transport: "Transportation"
- For salary/income: "Salary"
- For general expenses: "General"

Today's date is {today}. Use this as default date if user says "today" or doesn't specify.

Always respond in Indonesian (Bahasa Indonesia) when appropriate.

FORMATTING GUIDELINES FOR TRANSACTION DATA:
- Convert amounts to Rupiah format (Rp X.XXX,-)
- Format dates to Indonesian format (DD Month YYYY)
- Categorize transactions clearly
- Show totals and summaries when appropriate"#
    )
}

/// Standard instruction plus the directive to record the analyzed receipt
/// without asking for confirmation.
pub fn auto_add_system_prompt(user_id: &str, today: NaiveDate) -> String {
    format!(
        r#"{base}

SPECIAL INSTRUCTION: User has typed "Tambah" after image analysis. You MUST:
1. Extract transaction details from the previous AI message that contains image analysis
2. Automatically execute create_financial_transaction tool with extracted data
3. Use today's date ({today}) as the transaction date
4. DO NOT ask for confirmation - execute immediately"#,
        base = tool_system_prompt(user_id, today),
        today = today.format("%Y-%m-%d")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirmation_tokens_are_trimmed_and_case_folded() {
        assert!(is_confirmation("tambah"));
        assert!(is_confirmation("  Tambah \n"));
        assert!(is_confirmation("ADD"));
        assert!(is_confirmation("Create"));
        assert!(!is_confirmation("tambahkan transaksi"));
        assert!(!is_confirmation(""));
    }

    #[test]
    fn test_analysis_template_detection() {
        assert!(looks_like_analysis(
            "Berikut adalah detail transaksi yang telah diambil dari struk:\n\nJumlah: Rp. 75.000"
        ));
        assert!(looks_like_analysis("Tanggal Transaksi: 2025-05-24"));
        // A currency figure alone is not enough without a confirmation hint
        assert!(!looks_like_analysis(
            "Total pengeluaran Anda Rp. 50.000 bulan ini"
        ));
        assert!(looks_like_analysis(
            "Jumlahnya Rp. 50.000. Ketik \"Tambah\" untuk menyimpan."
        ));
        assert!(!looks_like_analysis("Halo! Ada yang bisa saya bantu?"));
    }

    #[test]
    fn test_prompts_embed_identity_and_date() {
        let today = NaiveDate::from_ymd_opt(2025, 5, 24).unwrap();
        let prompt = tool_system_prompt("user_6831885af26f9a4e3ab53166", today);
        assert!(prompt.contains("user_6831885af26f9a4e3ab53166"));
        assert!(prompt.contains("Today's date is 2025-05-24"));

        let vision = vision_system_prompt(today);
        assert!(vision.contains("today is 2025-05-24"));
        assert!(vision.contains("Ketik \"Tambah\""));

        let auto = auto_add_system_prompt("u1", today);
        assert!(auto.contains("SPECIAL INSTRUCTION"));
        assert!(auto.starts_with(&tool_system_prompt("u1", today)));
    }
}
