// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Secret resolution for job environments.
//!
//! Secrets are scoped to an organization, a repository, or a repository
//! environment (`production`, `staging`, ...). When the same name exists in
//! several scopes the narrower one wins: organization < repository <
//! environment.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

/// Secret errors.
#[derive(Debug, Error)]
pub enum SecretError {
    /// Secrets file could not be read.
    #[error("Failed to read secrets file: {0}")]
    Io(#[from] std::io::Error),

    /// Secrets file is not valid JSON of the expected shape.
    #[error("Invalid secrets file: {0}")]
    Json(#[from] serde_json::Error),

    /// The secret store is unreachable.
    #[error("Secret store unavailable: {0}")]
    Unavailable(String),
}

/// Resolves the secrets visible to a job.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    /// Secrets for a job in `repository_id`, optionally under an organization
    /// and a deployment environment.
    async fn resolve(
        &self,
        repository_id: &str,
        organization_id: Option<&str>,
        environment: Option<&str>,
    ) -> Result<BTreeMap<String, String>, SecretError>;
}

/// On-disk layout of a secrets file.
///
/// ```json
/// {
///   "organizations": { "org-1": { "NPM_TOKEN": "..." } },
///   "repositories":  { "repo-1": { "API_KEY": "..." } },
///   "environments":  { "repo-1/production": { "API_KEY": "..." } }
/// }
/// ```
#[derive(Debug, Default, Deserialize)]
struct SecretsFile {
    #[serde(default)]
    organizations: HashMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    repositories: HashMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    environments: HashMap<String, BTreeMap<String, String>>,
}

/// In-memory scoped secret store.
#[derive(Debug, Clone, Default)]
pub struct InMemorySecretResolver {
    organizations: HashMap<String, BTreeMap<String, String>>,
    repositories: HashMap<String, BTreeMap<String, String>>,
    environments: HashMap<String, BTreeMap<String, String>>,
}

fn environment_key(repository_id: &str, environment: &str) -> String {
    format!("{}/{}", repository_id, environment)
}

impl InMemorySecretResolver {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON secrets file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SecretError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse a JSON secrets document.
    pub fn from_json(content: &str) -> Result<Self, SecretError> {
        let file: SecretsFile = serde_json::from_str(content)?;
        Ok(Self {
            organizations: file.organizations,
            repositories: file.repositories,
            environments: file.environments,
        })
    }

    /// Add an organization secret.
    pub fn with_organization_secret(mut self, organization_id: &str, name: &str, value: &str) -> Self {
        self.organizations
            .entry(organization_id.to_string())
            .or_default()
            .insert(name.to_string(), value.to_string());
        self
    }

    /// Add a repository secret.
    pub fn with_repository_secret(mut self, repository_id: &str, name: &str, value: &str) -> Self {
        self.repositories
            .entry(repository_id.to_string())
            .or_default()
            .insert(name.to_string(), value.to_string());
        self
    }

    /// Add an environment secret.
    pub fn with_environment_secret(
        mut self,
        repository_id: &str,
        environment: &str,
        name: &str,
        value: &str,
    ) -> Self {
        self.environments
            .entry(environment_key(repository_id, environment))
            .or_default()
            .insert(name.to_string(), value.to_string());
        self
    }
}

#[async_trait]
impl SecretResolver for InMemorySecretResolver {
    async fn resolve(
        &self,
        repository_id: &str,
        organization_id: Option<&str>,
        environment: Option<&str>,
    ) -> Result<BTreeMap<String, String>, SecretError> {
        let mut secrets = BTreeMap::new();

        let scopes = [
            organization_id.and_then(|org| self.organizations.get(org)),
            self.repositories.get(repository_id),
            environment.and_then(|env| self.environments.get(&environment_key(repository_id, env))),
        ];
        for scope in scopes.into_iter().flatten() {
            secrets.extend(scope.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        Ok(secrets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_narrower_scope_wins() {
        let resolver = InMemorySecretResolver::new()
            .with_organization_secret("org", "TOKEN", "org")
            .with_organization_secret("org", "ORG_ONLY", "o")
            .with_repository_secret("repo", "TOKEN", "repo")
            .with_environment_secret("repo", "prod", "TOKEN", "prod")
            .with_environment_secret("other", "prod", "LEAK", "x");

        let all = resolver.resolve("repo", Some("org"), Some("prod")).await.unwrap();
        assert_eq!(all.get("TOKEN").map(String::as_str), Some("prod"));
        assert_eq!(all.get("ORG_ONLY").map(String::as_str), Some("o"));
        assert!(!all.contains_key("LEAK"));

        let no_env = resolver.resolve("repo", Some("org"), None).await.unwrap();
        assert_eq!(no_env.get("TOKEN").map(String::as_str), Some("repo"));

        let no_org = resolver.resolve("repo", None, Some("staging")).await.unwrap();
        assert_eq!(no_org.len(), 1);
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");
        std::fs::write(
            &path,
            r#"{"repositories": {"repo": {"A": "1"}}, "environments": {"repo/prod": {"A": "2"}}}"#,
        )
        .unwrap();

        let resolver = InMemorySecretResolver::from_json_file(&path).unwrap();
        assert_eq!(resolver.repositories["repo"]["A"], "1");
        assert_eq!(resolver.environments["repo/prod"]["A"], "2");

        assert!(matches!(
            InMemorySecretResolver::from_json("[1]"),
            Err(SecretError::Json(_))
        ));
        assert!(matches!(
            InMemorySecretResolver::from_json_file(dir.path().join("missing.json")),
            Err(SecretError::Io(_))
        ));
    }
}
