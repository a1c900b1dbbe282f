// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Event names webhooks can subscribe to.

use crate::error::{Result, WebhookError};

/// Subscribes to every event.
pub const WILDCARD: &str = "*";

/// Operator-initiated connectivity check.
pub const PING: &str = "ping";

/// Events a webhook may subscribe to, besides [`WILDCARD`].
pub const KNOWN_EVENTS: &[&str] = &[
    "push",
    "pull_request",
    "pull_request_review",
    "issues",
    "issue_comment",
    "create",
    "delete",
    "release",
    "fork",
    "star",
    "workflow_run",
    "workflow_job",
    PING,
];

/// Whether `event` can be triggered.
pub fn is_known(event: &str) -> bool {
    KNOWN_EVENTS.contains(&event)
}

/// Validate a subscription list. Returns it sorted and deduplicated.
pub fn validate_subscriptions(events: &[String]) -> Result<Vec<String>> {
    if events.is_empty() {
        return Err(WebhookError::NoEvents);
    }
    if let Some(unknown) = events.iter().find(|e| *e != WILDCARD && !is_known(e)) {
        return Err(WebhookError::UnknownEvent(unknown.clone()));
    }

    let mut events = events.to_vec();
    events.sort();
    events.dedup();
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_subscriptions() {
        let events = vec!["push".to_string(), "*".to_string(), "push".to_string()];
        assert_eq!(
            validate_subscriptions(&events).unwrap(),
            vec!["*".to_string(), "push".to_string()]
        );

        assert!(matches!(validate_subscriptions(&[]), Err(WebhookError::NoEvents)));
        assert!(matches!(
            validate_subscriptions(&["pushed".to_string()]),
            Err(WebhookError::UnknownEvent(e)) if e == "pushed"
        ));
    }
}
