//! Typed webhook event model.
//!
//! Deliveries are routed on the `(event type, action)` pair. Rather than
//! poking at loosely-typed JSON in every handler, the raw payload is
//! deserialized once into [`WebhookPayload`] and then classified into a
//! [`WebhookEvent`] variant: one per handled combination, with an explicit
//! [`WebhookEvent::Unhandled`] fallthrough. Handlers match on the variant and
//! get exactly the fields that combination guarantees.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raw webhook payload shape, shared across event types.
///
/// Every field is optional at this layer; [`WebhookEvent::classify`] is what
/// decides which fields a given `(event, action)` pair actually requires.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookPayload {
    pub action: Option<String>,
    pub installation: Option<InstallationPayload>,
    pub repository: Option<RepositoryPayload>,
    #[serde(default)]
    pub repositories_added: Vec<RepositoryRef>,
    #[serde(default)]
    pub repositories_removed: Vec<RepositoryRef>,
    pub pull_request: Option<PullRequestPayload>,
    pub sender: Option<UserPayload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstallationPayload {
    pub id: u64,
    pub account: Option<AccountPayload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountPayload {
    pub id: u64,
    pub login: String,
    #[serde(rename = "type")]
    pub account_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryPayload {
    pub id: u64,
    pub name: String,
    pub full_name: String,
    #[serde(default)]
    pub private: bool,
    pub language: Option<String>,
    pub default_branch: Option<String>,
}

/// Abbreviated repository shape used in `installation_repositories` events.
#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryRef {
    pub id: u64,
    pub name: String,
    pub full_name: String,
    #[serde(default)]
    pub private: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestPayload {
    pub id: u64,
    pub number: u64,
    pub title: Option<String>,
    pub merged: Option<bool>,
    pub user: Option<UserPayload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserPayload {
    pub id: u64,
    pub login: String,
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("payload is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A handled `(event, action)` combination was missing a field that
    /// combination guarantees. Retrying will re-parse identical bytes, so
    /// callers should treat this as non-retryable.
    #[error("{event} event is missing required field `{field}`")]
    MissingField {
        event: &'static str,
        field: &'static str,
    },
}

/// One webhook delivery, classified.
#[derive(Debug, Clone)]
pub enum WebhookEvent {
    InstallationCreated {
        installation: InstallationPayload,
    },
    InstallationDeleted {
        installation: InstallationPayload,
    },
    InstallationSuspended {
        installation: InstallationPayload,
    },
    InstallationUnsuspended {
        installation: InstallationPayload,
    },
    RepositoriesAdded {
        installation: InstallationPayload,
    },
    RepositoriesRemoved {
        installation: InstallationPayload,
        repositories: Vec<RepositoryRef>,
    },
    PullRequestOpened {
        installation: InstallationPayload,
        repository: RepositoryPayload,
        pull_request: PullRequestPayload,
    },
    PullRequestSynchronized {
        installation: InstallationPayload,
        repository: RepositoryPayload,
        pull_request: PullRequestPayload,
    },
    PullRequestClosed {
        installation: InstallationPayload,
        repository: RepositoryPayload,
        pull_request: PullRequestPayload,
    },
    /// Extension seam: pushes are accepted but not acted on.
    Push,
    Unhandled {
        event_type: String,
        action: Option<String>,
    },
}

impl WebhookEvent {
    /// Parses and classifies a raw delivery body.
    pub fn parse(event_type: &str, body: &[u8]) -> Result<Self, EventError> {
        let payload: WebhookPayload = serde_json::from_slice(body)?;
        Self::classify(event_type, payload)
    }

    /// Classifies a deserialized payload by `(event type, action)`.
    ///
    /// Combinations we do not handle land in [`WebhookEvent::Unhandled`];
    /// handled combinations with missing required fields are an error.
    pub fn classify(event_type: &str, payload: WebhookPayload) -> Result<Self, EventError> {
        let action = payload.action.as_deref();

        let event = match (event_type, action) {
            ("installation", Some("created")) => Self::InstallationCreated {
                installation: required(payload.installation, "installation", "installation")?,
            },
            ("installation", Some("deleted")) => Self::InstallationDeleted {
                installation: required(payload.installation, "installation", "installation")?,
            },
            ("installation", Some("suspend")) => Self::InstallationSuspended {
                installation: required(payload.installation, "installation", "installation")?,
            },
            ("installation", Some("unsuspend")) => Self::InstallationUnsuspended {
                installation: required(payload.installation, "installation", "installation")?,
            },
            ("installation_repositories", Some("added")) => Self::RepositoriesAdded {
                installation: required(
                    payload.installation,
                    "installation_repositories",
                    "installation",
                )?,
            },
            ("installation_repositories", Some("removed")) => Self::RepositoriesRemoved {
                installation: required(
                    payload.installation,
                    "installation_repositories",
                    "installation",
                )?,
                repositories: payload.repositories_removed,
            },
            ("pull_request", Some(pr_action @ ("opened" | "synchronize" | "closed"))) => {
                let installation =
                    required(payload.installation, "pull_request", "installation")?;
                let repository = required(payload.repository, "pull_request", "repository")?;
                let pull_request =
                    required(payload.pull_request, "pull_request", "pull_request")?;
                match pr_action {
                    "opened" => Self::PullRequestOpened {
                        installation,
                        repository,
                        pull_request,
                    },
                    "synchronize" => Self::PullRequestSynchronized {
                        installation,
                        repository,
                        pull_request,
                    },
                    _ => Self::PullRequestClosed {
                        installation,
                        repository,
                        pull_request,
                    },
                }
            }
            ("push", _) => Self::Push,
            _ => Self::Unhandled {
                event_type: event_type.to_string(),
                action: payload.action,
            },
        };

        Ok(event)
    }
}

fn required<T>(
    value: Option<T>,
    event: &'static str,
    field: &'static str,
) -> Result<T, EventError> {
    value.ok_or(EventError::MissingField { event, field })
}

/// Serializable description of one queued delivery.
///
/// This is what the ingress endpoint hands to the job queue. The raw body is
/// carried opaquely and only parsed by the worker: the ingress endpoint
/// authenticates and acknowledges, nothing more.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryJob {
    pub delivery_id: String,
    pub event_type: String,
    /// Raw payload text as received (post signature check).
    pub payload: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> WebhookPayload {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_classify_installation_created() {
        let p = payload(json!({
            "action": "created",
            "installation": {
                "id": 42,
                "account": {"id": 7, "login": "octo-org", "type": "Organization"}
            }
        }));

        let event = WebhookEvent::classify("installation", p).unwrap();
        match event {
            WebhookEvent::InstallationCreated { installation } => {
                assert_eq!(installation.id, 42);
                assert_eq!(installation.account.unwrap().login, "octo-org");
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn test_classify_suspend_and_unsuspend() {
        let base = json!({"installation": {"id": 1}});

        let mut p = base.clone();
        p["action"] = json!("suspend");
        assert!(matches!(
            WebhookEvent::classify("installation", payload(p)).unwrap(),
            WebhookEvent::InstallationSuspended { .. }
        ));

        let mut p = base;
        p["action"] = json!("unsuspend");
        assert!(matches!(
            WebhookEvent::classify("installation", payload(p)).unwrap(),
            WebhookEvent::InstallationUnsuspended { .. }
        ));
    }

    #[test]
    fn test_classify_repositories_removed_carries_repo_list() {
        let p = payload(json!({
            "action": "removed",
            "installation": {"id": 42},
            "repositories_removed": [
                {"id": 1, "name": "a", "full_name": "octo/a"},
                {"id": 2, "name": "b", "full_name": "octo/b", "private": true}
            ]
        }));

        match WebhookEvent::classify("installation_repositories", p).unwrap() {
            WebhookEvent::RepositoriesRemoved { repositories, .. } => {
                assert_eq!(repositories.len(), 2);
                assert_eq!(repositories[1].full_name, "octo/b");
                assert!(repositories[1].private);
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn test_classify_pull_request_actions() {
        let p = json!({
            "installation": {"id": 42},
            "repository": {"id": 9, "name": "repo", "full_name": "octo/repo"},
            "pull_request": {"id": 100, "number": 5, "title": "Add thing", "merged": false}
        });

        for (action, want_opened, want_sync, want_closed) in [
            ("opened", true, false, false),
            ("synchronize", false, true, false),
            ("closed", false, false, true),
        ] {
            let mut body = p.clone();
            body["action"] = json!(action);
            let event = WebhookEvent::classify("pull_request", payload(body)).unwrap();
            assert_eq!(
                matches!(event, WebhookEvent::PullRequestOpened { .. }),
                want_opened
            );
            assert_eq!(
                matches!(event, WebhookEvent::PullRequestSynchronized { .. }),
                want_sync
            );
            assert_eq!(
                matches!(event, WebhookEvent::PullRequestClosed { .. }),
                want_closed
            );
        }
    }

    #[test]
    fn test_classify_missing_field_is_error() {
        // pull_request event with no repository: a handled combination with a
        // hole in it must be an error, not Unhandled.
        let p = payload(json!({
            "action": "opened",
            "installation": {"id": 42},
            "pull_request": {"id": 100, "number": 5}
        }));

        let err = WebhookEvent::classify("pull_request", p).unwrap_err();
        assert!(matches!(
            err,
            EventError::MissingField {
                field: "repository",
                ..
            }
        ));
    }

    #[test]
    fn test_classify_push_is_noop_seam() {
        assert!(matches!(
            WebhookEvent::classify("push", WebhookPayload::default()).unwrap(),
            WebhookEvent::Push
        ));
    }

    #[test]
    fn test_classify_unknown_event_falls_through() {
        let p = payload(json!({"action": "completed"}));
        match WebhookEvent::classify("workflow_run", p).unwrap() {
            WebhookEvent::Unhandled { event_type, action } => {
                assert_eq!(event_type, "workflow_run");
                assert_eq!(action.as_deref(), Some("completed"));
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn test_classify_known_event_unknown_action_falls_through() {
        let p = payload(json!({
            "action": "edited",
            "installation": {"id": 42},
            "repository": {"id": 9, "name": "repo", "full_name": "octo/repo"},
            "pull_request": {"id": 100, "number": 5}
        }));
        assert!(matches!(
            WebhookEvent::classify("pull_request", p).unwrap(),
            WebhookEvent::Unhandled { .. }
        ));
    }

    #[test]
    fn test_parse_rejects_invalid_json() {
        assert!(matches!(
            WebhookEvent::parse("pull_request", b"not json"),
            Err(EventError::Malformed(_))
        ));
    }
}
