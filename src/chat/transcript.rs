use crate::models::{ChatMessage, MessageRole};
use crate::types::{ClientError, ClientResult};
use chrono::NaiveDate;

/// Role-prefixed transcript sent as the `history` of a chat turn
pub fn serialize_history(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|msg| format!("{}: {}", msg.role, msg.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render a conversation as a markdown document.
pub fn export_markdown(title: &str, messages: &[ChatMessage], date: NaiveDate) -> ClientResult<String> {
    if messages.is_empty() {
        return Err(ClientError::InvalidRequest(
            "No conversation to download yet.".to_string(),
        ));
    }

    let mut markdown = format!("# Chat with {}\n\n", title);
    markdown.push_str(&format!("Date: {}\n\n", date.format("%B %-d, %Y")));
    markdown.push_str("---\n\n");

    for msg in messages {
        let role = match msg.role {
            MessageRole::User => "**You**",
            MessageRole::Assistant => "**Assistant**",
        };
        markdown.push_str(&format!("{}: {}\n\n", role, msg.content));
    }

    Ok(markdown)
}

pub fn export_file_name(title: &str, timestamp_millis: i64) -> String {
    let sanitized: String = title
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("chat_{}_{}.md", sanitized, timestamp_millis)
}
