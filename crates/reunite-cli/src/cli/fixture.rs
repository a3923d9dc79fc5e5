use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use reunite_core::gateway::{InMemoryDirectory, InMemoryGateway};
use reunite_core::models::Message;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureUser {
    pub id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureListing {
    pub id: String,
    pub title: String,
    /// Receives the first message anyone sends about this listing
    pub contact_id: String,
}

/// Offline data set for the CLI: stored messages plus the directory entries
/// used to resolve names, titles and listing contacts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Fixture {
    /// Viewer used when `--viewer` is not given
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewer: Option<String>,
    pub users: Vec<FixtureUser>,
    pub listings: Vec<FixtureListing>,
    pub messages: Vec<Message>,
}

impl Fixture {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixture file: {}", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Failed to parse fixture file: {}", path.display()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize fixture")
    }

    /// Write the fixture back, e.g. after a send or a read mark.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize fixture")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write fixture file: {}", path.display()))
    }

    pub fn backends(&self) -> (Arc<InMemoryGateway>, Arc<InMemoryDirectory>) {
        let gateway = Arc::new(InMemoryGateway::new());
        gateway.seed(self.messages.iter().cloned());

        let directory = Arc::new(InMemoryDirectory::new());
        for user in &self.users {
            directory.add_user(&user.id, &user.display_name);
        }
        for listing in &self.listings {
            directory.add_listing(&listing.id, &listing.title, &listing.contact_id);
        }
        (gateway, directory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reunite_core::gateway::{Directory, MessageFilter, MessageGateway};
    use std::io::Write;
    use tempfile::NamedTempFile;

    const FIXTURE: &str = r#"{
        "viewer": "V",
        "users": [{"id": "C", "displayName": "Camille"}],
        "listings": [{"id": "L1", "title": "Lost tabby cat", "contactId": "C"}],
        "messages": [
            {"id": "1", "threadId": "L1", "senderId": "V", "recipientId": "C",
             "kind": "text", "content": "Is she still missing?", "createdAt": 100},
            {"id": "2", "threadId": "L1", "senderId": "C", "recipientId": "V",
             "kind": "text", "content": "Yes, since Sunday", "createdAt": 200}
        ]
    }"#;

    #[test]
    fn test_parse_fixture() {
        let fixture = Fixture::from_json(FIXTURE).unwrap();
        assert_eq!(fixture.viewer.as_deref(), Some("V"));
        assert_eq!(fixture.messages.len(), 2);
        assert!(!fixture.messages[1].is_read);
        assert_eq!(fixture.listings[0].contact_id, "C");
    }

    #[test]
    fn test_empty_fixture_defaults() {
        let fixture = Fixture::from_json("{}").unwrap();
        assert_eq!(fixture, Fixture::default());
    }

    #[test]
    fn test_load_reports_path() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let err = Fixture::load(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse fixture file"));
    }

    #[test]
    fn test_save_then_load() {
        let file = NamedTempFile::new().unwrap();
        let fixture = Fixture::from_json(FIXTURE).unwrap();
        fixture.save(file.path()).unwrap();
        assert_eq!(Fixture::load(file.path()).unwrap(), fixture);
    }

    #[tokio::test]
    async fn test_backends_are_seeded() {
        let (gateway, directory) = Fixture::from_json(FIXTURE).unwrap().backends();
        let messages = gateway
            .query_messages(MessageFilter::participant("V"))
            .await
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(
            directory.resolve_display_identity("C").await.unwrap(),
            "Camille"
        );
        assert_eq!(directory.resolve_subject_contact("L1").await.unwrap(), "C");
    }
}
