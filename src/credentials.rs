//! Per-instance credential secret validation
//!
//! For each tracked instance the controller writes a Secret named after the
//! instance id whose data entry (also keyed by the instance id) holds
//! JSON-encoded connection credentials.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::context::{SuiteFixture, TestContext};
use crate::identity::active_instance_ids;
use crate::poll::Convergence;
use crate::Error;

/// Connection credentials for one instance
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Cloud instance id
    #[serde(default)]
    pub instance_id: String,
    /// Address used to reach the instance
    #[serde(default)]
    pub ip_address: String,
    /// Login user
    #[serde(default)]
    pub username: String,
    /// Login password
    #[serde(default)]
    pub password: String,
}

impl Credentials {
    /// True when every field still has its default value
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Decode the credentials stored under `instance_id` in a secret's data
pub fn decode_credentials(
    secret: &k8s_openapi::api::core::v1::Secret,
    instance_id: &str,
) -> Result<Credentials, Error> {
    let context = format!("Secret {}", instance_id);
    let payload = secret
        .data
        .as_ref()
        .and_then(|d| d.get(instance_id))
        .ok_or_else(|| Error::decode(&context, format!("missing data key {}", instance_id)))?;
    serde_json::from_slice(&payload.0)
        .map_err(|e| Error::decode(&context, format!("unmarshalling creds failed: {}", e)))
}

impl TestContext {
    /// Wait for the credentials secret of `instance_id` and decode it.
    ///
    /// Uses the single-item timeout; a secret that exists but does not decode
    /// fails immediately.
    pub async fn credentials_for(&self, instance_id: &str) -> Result<Credentials, Error> {
        let namespace = self.config.namespace.as_str();
        let cluster = self.cluster();
        let what = format!("instance secret {}/{}", namespace, instance_id);

        self.poller()
            .wait_for(&what, || async move {
                match cluster.get_secret(namespace, instance_id).await? {
                    Some(secret) => decode_credentials(&secret, instance_id).map(Convergence::Converged),
                    None => {
                        debug!(namespace = %namespace, instance = %instance_id, "waiting for instance secret to be created");
                        Ok(Convergence::Pending)
                    }
                }
            })
            .await
    }

    /// Validate the credentials secret of one instance.
    ///
    /// A secret that decodes to default credentials is a failure.
    pub async fn validate_instance_secret(&self, instance_id: &str) -> Result<Credentials, Error> {
        let creds = self.credentials_for(instance_id).await?;
        if creds.is_empty() {
            return Err(Error::decode(
                format!("Secret {}", instance_id),
                "expected credentials to be present but got default value",
            ));
        }
        Ok(creds)
    }

    /// Validate the credentials secret of every active instance.
    ///
    /// The number of active instances must equal the expected node count so
    /// an empty node list cannot pass vacuously. Every instance is checked;
    /// the first failure is returned and all failing ids are logged.
    pub async fn validate_secrets(&self, fixture: &SuiteFixture) -> Result<usize, Error> {
        let ids = active_instance_ids(&fixture.nodes);
        if ids.len() != fixture.expected_nodes {
            return Err(Error::Mismatch {
                context: format!(
                    "mismatched node count: expected {} active instances, found {}",
                    fixture.expected_nodes,
                    ids.len()
                ),
                missing: Vec::new(),
                unexpected: Vec::new(),
            });
        }

        let mut first_failure = None;
        let mut failed = Vec::new();
        for id in &ids {
            if let Err(e) = self.validate_instance_secret(id).await {
                warn!(instance = %id, error = %e, "instance secret validation failed");
                failed.push(id.as_str());
                first_failure.get_or_insert(e);
            }
        }

        match first_failure {
            Some(e) => {
                warn!(failed = ?failed, checked = ids.len(), "instance secrets invalid");
                Err(e)
            }
            None => {
                info!(checked = ids.len(), "all instance secrets valid");
                Ok(ids.len())
            }
        }
    }
}
