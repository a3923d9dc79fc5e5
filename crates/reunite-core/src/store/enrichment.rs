use crate::error::GatewayError;
use crate::models::Message;
use std::collections::HashMap;

/// A display lookup the session should run against the directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EnrichmentRequest {
    DisplayName { user_id: String },
    SubjectTitle { thread_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Lookup {
    InFlight { attempts: u32 },
    Failed { attempts: u32 },
    /// Permanently unavailable (deleted listing, unknown user) or out of attempts
    Abandoned,
    Resolved(String),
}

/// Sub-store for display names and listing titles.
///
/// Lookups are best-effort: anything unresolved renders as a placeholder, and
/// transient failures are retried by the session up to `max_attempts`.
pub struct EnrichmentCache {
    names: HashMap<String, Lookup>,
    titles: HashMap<String, Lookup>,
    unknown_user_label: String,
    missing_subject_label: String,
    max_attempts: u32,
}

impl EnrichmentCache {
    pub fn new(
        unknown_user_label: impl Into<String>,
        missing_subject_label: impl Into<String>,
        max_attempts: u32,
    ) -> Self {
        Self {
            names: HashMap::new(),
            titles: HashMap::new(),
            unknown_user_label: unknown_user_label.into(),
            missing_subject_label: missing_subject_label.into(),
            max_attempts: max_attempts.max(1),
        }
    }

    // ===== Getters =====

    pub fn display_name(&self, user_id: &str) -> String {
        match self.names.get(user_id) {
            Some(Lookup::Resolved(name)) => name.clone(),
            _ => self.unknown_user_label.clone(),
        }
    }

    pub fn subject_title(&self, thread_id: &str) -> String {
        match self.titles.get(thread_id) {
            Some(Lookup::Resolved(title)) => title.clone(),
            _ => self.missing_subject_label.clone(),
        }
    }

    /// Lookups dispatched and not answered yet.
    pub fn in_flight_count(&self) -> usize {
        self.names
            .values()
            .chain(self.titles.values())
            .filter(|lookup| matches!(lookup, Lookup::InFlight { .. }))
            .count()
    }

    fn entry(&self, request: &EnrichmentRequest) -> Option<&Lookup> {
        match request {
            EnrichmentRequest::DisplayName { user_id } => self.names.get(user_id),
            EnrichmentRequest::SubjectTitle { thread_id } => self.titles.get(thread_id),
        }
    }

    fn entry_mut(&mut self, request: &EnrichmentRequest) -> &mut HashMap<String, Lookup> {
        match request {
            EnrichmentRequest::DisplayName { .. } => &mut self.names,
            EnrichmentRequest::SubjectTitle { .. } => &mut self.titles,
        }
    }

    // ===== Planning =====

    /// Lookups needed to display `message`: both participants and its listing.
    /// Only returns requests never attempted before; each is marked in flight.
    pub fn requests_for(&mut self, message: &Message) -> Vec<EnrichmentRequest> {
        let mut candidates = vec![
            EnrichmentRequest::DisplayName {
                user_id: message.sender_id.clone(),
            },
            EnrichmentRequest::DisplayName {
                user_id: message.recipient_id.clone(),
            },
        ];
        if let Some(thread_id) = &message.thread_id {
            candidates.push(EnrichmentRequest::SubjectTitle {
                thread_id: thread_id.clone(),
            });
        }
        candidates.dedup();
        candidates
            .into_iter()
            .filter(|request| self.begin(request))
            .collect()
    }

    /// Mark `request` in flight if it has never been looked up.
    pub fn begin(&mut self, request: &EnrichmentRequest) -> bool {
        if self.entry(request).is_some() {
            return false;
        }
        let key = request_key(request).to_string();
        self.entry_mut(request)
            .insert(key, Lookup::InFlight { attempts: 0 });
        true
    }

    /// Failed lookups that still have attempts left, marked in flight again.
    pub fn due_retries(&mut self) -> Vec<EnrichmentRequest> {
        let mut due = Vec::new();
        for (user_id, lookup) in self.names.iter_mut() {
            if let Lookup::Failed { attempts } = *lookup {
                *lookup = Lookup::InFlight { attempts };
                due.push(EnrichmentRequest::DisplayName {
                    user_id: user_id.clone(),
                });
            }
        }
        for (thread_id, lookup) in self.titles.iter_mut() {
            if let Lookup::Failed { attempts } = *lookup {
                *lookup = Lookup::InFlight { attempts };
                due.push(EnrichmentRequest::SubjectTitle {
                    thread_id: thread_id.clone(),
                });
            }
        }
        due
    }

    // ===== Resolution =====

    /// Record a lookup result. Returns true when a placeholder got replaced.
    pub fn resolve(
        &mut self,
        request: &EnrichmentRequest,
        result: Result<String, GatewayError>,
    ) -> bool {
        let max_attempts = self.max_attempts;
        let attempts = match self.entry(request) {
            Some(Lookup::InFlight { attempts }) => *attempts,
            Some(Lookup::Failed { attempts }) => *attempts,
            _ => 0,
        };
        let key = request_key(request).to_string();

        let next = match result {
            Ok(value) if !value.trim().is_empty() => Lookup::Resolved(value),
            Ok(_) => Lookup::Abandoned,
            Err(e) if e.is_transient() && attempts + 1 < max_attempts => {
                tracing::warn!(?request, attempt = attempts + 1, "enrichment lookup failed: {}", e);
                Lookup::Failed {
                    attempts: attempts + 1,
                }
            }
            Err(e) => {
                tracing::warn!(?request, "enrichment lookup abandoned: {}", e);
                Lookup::Abandoned
            }
        };
        let replaced = matches!(next, Lookup::Resolved(_));
        self.entry_mut(request).insert(key, next);
        replaced
    }
}

fn request_key(request: &EnrichmentRequest) -> &str {
    match request {
        EnrichmentRequest::DisplayName { user_id } => user_id,
        EnrichmentRequest::SubjectTitle { thread_id } => thread_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageKind;

    fn cache() -> EnrichmentCache {
        EnrichmentCache::new("Unknown user", "Listing unavailable", 3)
    }

    fn message() -> Message {
        Message {
            id: "m".to_string(),
            thread_id: Some("L1".to_string()),
            sender_id: "alice".to_string(),
            recipient_id: "bob".to_string(),
            content: "hi".to_string(),
            photo_ref: None,
            location: None,
            kind: MessageKind::Text,
            created_at: 1,
            is_read: false,
            client_ref: None,
        }
    }

    fn name(user_id: &str) -> EnrichmentRequest {
        EnrichmentRequest::DisplayName {
            user_id: user_id.to_string(),
        }
    }

    #[test]
    fn test_requests_issued_once() {
        let mut cache = cache();
        let first = cache.requests_for(&message());
        assert_eq!(first.len(), 3);
        assert!(cache.requests_for(&message()).is_empty());
    }

    #[test]
    fn test_placeholder_until_resolved() {
        let mut cache = cache();
        cache.requests_for(&message());
        assert_eq!(cache.display_name("alice"), "Unknown user");
        assert_eq!(cache.subject_title("L1"), "Listing unavailable");

        assert!(cache.resolve(&name("alice"), Ok("Alice".to_string())));
        assert_eq!(cache.display_name("alice"), "Alice");
    }

    #[test]
    fn test_transient_failure_retried_until_exhausted() {
        let mut cache = cache();
        cache.begin(&name("bob"));

        let outage = || Err(GatewayError::Unavailable("timeout".into()));
        cache.resolve(&name("bob"), outage());
        assert_eq!(cache.due_retries(), vec![name("bob")]);
        // in flight again: not due twice
        assert!(cache.due_retries().is_empty());

        cache.resolve(&name("bob"), outage());
        assert_eq!(cache.due_retries(), vec![name("bob")]);
        cache.resolve(&name("bob"), outage());
        // third failure hits max_attempts
        assert!(cache.due_retries().is_empty());
        assert_eq!(cache.display_name("bob"), "Unknown user");
    }

    #[test]
    fn test_not_found_is_not_retried() {
        let mut cache = cache();
        let title = EnrichmentRequest::SubjectTitle {
            thread_id: "deleted".to_string(),
        };
        cache.begin(&title);
        cache.resolve(&title, Err(GatewayError::NotFound("deleted".into())));
        assert!(cache.due_retries().is_empty());
        assert_eq!(cache.subject_title("deleted"), "Listing unavailable");
    }

    #[test]
    fn test_self_message_requests_one_name() {
        let mut cache = cache();
        let mut msg = message();
        msg.recipient_id = "alice".to_string();
        let requests = cache.requests_for(&msg);
        assert_eq!(
            requests
                .iter()
                .filter(|r| matches!(r, EnrichmentRequest::DisplayName { .. }))
                .count(),
            1
        );
    }
}
