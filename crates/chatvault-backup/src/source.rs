//! Where message records come from. The message store itself lives
//! outside this crate; it only has to hand over decrypted records.

use std::path::PathBuf;
use std::sync::RwLock;

use anyhow::{Context, Result};
use async_trait::async_trait;

use chatvault_core::types::MessageRecord;

#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Every message currently held locally
    async fn load_messages(&self) -> Result<Vec<MessageRecord>>;
}

/// In-memory source, replaced wholesale by the caller
#[derive(Default)]
pub struct StaticSource {
    messages: RwLock<Vec<MessageRecord>>,
}

impl StaticSource {
    pub fn new(messages: Vec<MessageRecord>) -> Self {
        Self {
            messages: RwLock::new(messages),
        }
    }

    pub fn replace(&self, messages: Vec<MessageRecord>) {
        *self.messages.write().unwrap_or_else(|e| e.into_inner()) = messages;
    }
}

#[async_trait]
impl MessageSource for StaticSource {
    async fn load_messages(&self) -> Result<Vec<MessageRecord>> {
        Ok(self
            .messages
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }
}

/// One JSON-encoded `MessageRecord` per line. Blank lines are skipped.
pub struct JsonlFileSource {
    path: PathBuf,
}

impl JsonlFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl MessageSource for JsonlFileSource {
    async fn load_messages(&self) -> Result<Vec<MessageRecord>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading messages: {}", self.path.display()))?;
        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str(line).with_context(|| {
                    format!("parsing {} line {}", self.path.display(), n + 1)
                })
            })
            .collect()
    }
}

/// Write records as JSONL, the format `JsonlFileSource` reads back.
pub async fn write_jsonl(path: &std::path::Path, messages: &[MessageRecord]) -> Result<()> {
    let mut out = String::new();
    for m in messages {
        out.push_str(&serde_json::to_string(m).context("serializing message")?);
        out.push('\n');
    }
    tokio::fs::write(path, out)
        .await
        .with_context(|| format!("writing messages: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str) -> MessageRecord {
        MessageRecord {
            id: id.into(),
            conversation_id: "c".into(),
            sender_id: "s".into(),
            content: format!("hello {id}"),
            timestamp: 1,
        }
    }

    #[tokio::test]
    async fn test_static_source_replace() {
        let source = StaticSource::new(vec![msg("a")]);
        assert_eq!(source.load_messages().await.unwrap().len(), 1);
        source.replace(vec![msg("a"), msg("b")]);
        assert_eq!(source.load_messages().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_jsonl_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.jsonl");
        write_jsonl(&path, &[msg("a"), msg("b")]).await.unwrap();

        let loaded = JsonlFileSource::new(&path).load_messages().await.unwrap();
        assert_eq!(loaded, vec![msg("a"), msg("b")]);
    }

    #[tokio::test]
    async fn test_jsonl_reports_bad_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.jsonl");
        tokio::fs::write(&path, "\n{not json}\n").await.unwrap();

        let err = JsonlFileSource::new(&path).load_messages().await.unwrap_err();
        assert!(format!("{err:#}").contains("line 2"));
    }
}
