//! Session handles.
//!
//! A [`Session`] is the opaque handle a [`Target`](crate::parallel::Target)
//! carries: a profile name for display plus the [`Connector`] that builds a
//! transport for a given service, region and client configuration. Sessions
//! are cheap to clone and are shared read-only across workers.
//!
//! Real sessions come from [`Session::load`], which resolves credentials and
//! region through the standard AWS provider chain (environment, shared
//! config and credentials files, SSO, container and instance metadata).

use crate::aws::api::{Connector, StaticConnector, Transport};
use crate::aws::sdk::SdkConnector;
use aws_config::BehaviorVersion;
use aws_types::SdkConfig;
use std::env;
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;

/// Opaque credential/session handle bound to one account or profile.
#[derive(Clone)]
pub struct Session {
    profile_name: Arc<str>,
    connector: Arc<dyn Connector>,
}

impl Session {
    pub fn new(profile_name: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        Self {
            profile_name: Arc::from(profile_name.into()),
            connector,
        }
    }

    /// Session whose clients all share one pre-built transport.
    pub fn with_transport(
        profile_name: impl Into<String>,
        transport: impl Transport + 'static,
    ) -> Self {
        Self::new(
            profile_name,
            Arc::new(StaticConnector::new(Arc::new(transport))),
        )
    }

    /// Session backed by AWS SDK clients built from `config`.
    ///
    /// `runtime` drives the async SDK clients from blocking worker threads.
    pub fn from_sdk_config(
        profile_name: impl Into<String>,
        config: SdkConfig,
        runtime: Handle,
    ) -> Self {
        Self::new(profile_name, Arc::new(SdkConnector::new(config, runtime)))
    }

    /// Load shared AWS configuration for `profile`, or for the default
    /// provider chain when `None`.
    ///
    /// Credentials are resolved lazily, so a missing or expired profile
    /// surfaces on the first API call rather than here.
    pub async fn load(profile: Option<&str>, runtime: Handle) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(profile) = profile {
            loader = loader.profile_name(profile);
        }
        let config = loader.load().await;

        let name = profile
            .map(str::to_string)
            .or_else(|| env::var("AWS_PROFILE").ok().filter(|p| !p.is_empty()))
            .unwrap_or_else(|| "default".to_string());
        tracing::debug!("loaded AWS configuration for profile {}", name);
        Self::from_sdk_config(name, config, runtime)
    }

    pub fn profile_name(&self) -> &str {
        &self.profile_name
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("profile_name", &self.profile_name)
            .finish_non_exhaustive()
    }
}

/// Default region list from `AWS_REGION` or `AWS_DEFAULT_REGION`.
pub fn regions_from_env() -> Vec<String> {
    env::var("AWS_REGION")
        .or_else(|_| env::var("AWS_DEFAULT_REGION"))
        .map(|value| split_list(&value))
        .unwrap_or_default()
}

/// Split a comma-separated list, dropping blanks.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::api::{ApiError, ApiRequest};
    use serde_json::{json, Value};

    #[test]
    fn test_session_with_transport() {
        let session =
            Session::with_transport("audit", |_: &ApiRequest| -> Result<Value, ApiError> {
                Ok(json!({}))
            });
        assert_eq!(session.profile_name(), "audit");
        let cloned = session.clone();
        assert!(Arc::ptr_eq(session.connector(), cloned.connector()));
    }

    #[test]
    fn test_debug_shows_only_profile() {
        let session =
            Session::with_transport("prod", |_: &ApiRequest| -> Result<Value, ApiError> {
                Ok(json!({}))
            });
        let rendered = format!("{:?}", session);
        assert!(rendered.contains("prod"));
        assert!(!rendered.contains("connector"));
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list("us-east-1, eu-west-1,,"), vec!["us-east-1", "eu-west-1"]);
        assert!(split_list(" , ").is_empty());
    }
}
