//! Managed-function backing: runners execute as AWS Lambda invocations.
//!
//! Setup is create-or-reuse throughout: the IAM role and per-region function
//! survive across test sessions (the function upload is skipped when the
//! payload hash matches), while the FIFO result queue is per-session and
//! deleted on teardown.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_lambda::primitives::Blob;
use aws_sdk_lambda::types::{FunctionCode, InvocationType, Runtime};
use aws_sdk_sqs::types::QueueAttributeName;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::launcher::{InvokeArgs, LaunchError, Launcher};
use crate::plan::{RunnerSpec, Workload};
use crate::worker::Respawn;

/// Name of the Lambda function and prefix of every provisioned resource.
pub const FUNCTION_NAME: &str = "stampede";
const ROLE_NAME: &str = "stampede-runner-role";
const POLICY_NAME: &str = "stampede-runner-role-policy";

const ASSUME_ROLE_POLICY: &str = r#"{
  "Version": "2012-10-17",
  "Statement": {
    "Effect": "Allow",
    "Principal": {"Service": "lambda.amazonaws.com"},
    "Action": "sts:AssumeRole"
  }
}"#;

/// Queue-send for telemetry, log-write for diagnostics, self-invoke for the
/// self-fork handoff.
const ROLE_POLICY: &str = r#"{
  "Version": "2012-10-17",
  "Statement": [
    {
      "Action": ["sqs:SendMessage"],
      "Effect": "Allow",
      "Resource": "arn:aws:sqs:*:*:stampede-*"
    },
    {
      "Action": ["lambda:Invoke*"],
      "Effect": "Allow",
      "Resource": ["arn:aws:lambda:*:*:function:stampede"]
    },
    {
      "Action": [
        "logs:CreateLogGroup",
        "logs:CreateLogStream",
        "logs:PutLogEvents"
      ],
      "Effect": "Allow",
      "Resource": "arn:aws:logs:*:*:*"
    }
  ]
}"#;

async fn sdk_config(region: &str) -> SdkConfig {
    aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region.to_string()))
        .load()
        .await
}

/// Lambda alias names may not contain dots.
fn alias_name() -> String {
    format!("v{}", env!("CARGO_PKG_VERSION").replace('.', "-"))
}

fn payload_shasum(payload: &[u8]) -> String {
    BASE64.encode(Sha256::digest(payload))
}

#[derive(Default)]
pub struct LambdaLauncher {
    home_region: String,
    queue_url: String,
}

impl LambdaLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    async fn ensure_role(&self, config: &SdkConfig) -> Result<String, LaunchError> {
        let iam = aws_sdk_iam::Client::new(config);
        match iam.get_role().role_name(ROLE_NAME).send().await {
            Ok(output) => {
                let role = output
                    .role()
                    .ok_or_else(|| LaunchError::Provision("IAM role lookup returned no role".into()))?;
                Ok(role.arn().to_string())
            }
            Err(error) => {
                if !error.into_service_error().is_no_such_entity_exception() {
                    return Err(LaunchError::Provision(format!(
                        "failed to look up IAM role {ROLE_NAME}"
                    )));
                }
                info!(role = ROLE_NAME, "creating IAM role");
                let created = iam
                    .create_role()
                    .assume_role_policy_document(ASSUME_ROLE_POLICY)
                    .role_name(ROLE_NAME)
                    .path("/")
                    .send()
                    .await
                    .map_err(|e| LaunchError::Provision(e.to_string()))?;
                iam.put_role_policy()
                    .policy_document(ROLE_POLICY)
                    .policy_name(POLICY_NAME)
                    .role_name(ROLE_NAME)
                    .send()
                    .await
                    .map_err(|e| LaunchError::Provision(e.to_string()))?;
                let role = created
                    .role()
                    .ok_or_else(|| LaunchError::Provision("IAM role creation returned no role".into()))?;
                Ok(role.arn().to_string())
            }
        }
    }

    /// Create-or-update keyed by content hash, so unchanged payloads are not
    /// re-uploaded on every run.
    async fn ensure_function(
        &self,
        region: &str,
        role_arn: &str,
        payload: &[u8],
    ) -> Result<(), LaunchError> {
        let config = sdk_config(region).await;
        let lambda = aws_sdk_lambda::Client::new(&config);

        let existing = lambda
            .get_function_configuration()
            .function_name(FUNCTION_NAME)
            .send()
            .await;

        match existing {
            Ok(function) => {
                if function.code_sha256() == Some(payload_shasum(payload).as_str()) {
                    info!(region, "runner function up to date");
                    return self.ensure_alias(&lambda).await;
                }
                info!(region, "updating runner function code");
                lambda
                    .update_function_code()
                    .function_name(FUNCTION_NAME)
                    .zip_file(Blob::new(payload.to_vec()))
                    .publish(true)
                    .send()
                    .await
                    .map_err(|e| LaunchError::Provision(e.to_string()))?;
                self.ensure_alias(&lambda).await
            }
            Err(error) => {
                if !error.into_service_error().is_resource_not_found_exception() {
                    return Err(LaunchError::Provision(format!(
                        "failed to look up runner function in {region}"
                    )));
                }
                info!(region, "creating runner function");
                lambda
                    .create_function()
                    .function_name(FUNCTION_NAME)
                    .handler("bootstrap")
                    .role(role_arn)
                    .runtime(Runtime::Providedal2023)
                    .memory_size(1536)
                    .timeout(300)
                    .publish(true)
                    .code(
                        FunctionCode::builder()
                            .zip_file(Blob::new(payload.to_vec()))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|e| LaunchError::Provision(e.to_string()))?;
                self.ensure_alias(&lambda).await
            }
        }
    }

    async fn ensure_alias(&self, lambda: &aws_sdk_lambda::Client) -> Result<(), LaunchError> {
        let alias = alias_name();
        let exists = lambda
            .get_alias()
            .function_name(FUNCTION_NAME)
            .name(&alias)
            .send()
            .await
            .is_ok();
        let result = if exists {
            lambda
                .update_alias()
                .function_name(FUNCTION_NAME)
                .function_version("$LATEST")
                .name(&alias)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| e.to_string())
        } else {
            lambda
                .create_alias()
                .function_name(FUNCTION_NAME)
                .function_version("$LATEST")
                .name(&alias)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| e.to_string())
        };
        result.map_err(LaunchError::Provision)
    }

    async fn create_queue(&mut self) -> Result<(), LaunchError> {
        let config = sdk_config(&self.home_region).await;
        let sqs = aws_sdk_sqs::Client::new(&config);
        let output = sqs
            .create_queue()
            .queue_name(format!("{FUNCTION_NAME}-{}.fifo", Uuid::new_v4()))
            .attributes(QueueAttributeName::FifoQueue, "true")
            .send()
            .await
            .map_err(|e| LaunchError::Provision(e.to_string()))?;
        self.queue_url = output
            .queue_url()
            .ok_or_else(|| LaunchError::Provision("queue creation returned no URL".into()))?
            .to_string();
        info!(queue_url = %self.queue_url, "result queue created");
        Ok(())
    }
}

#[async_trait]
impl Launcher for LambdaLauncher {
    async fn setup(&mut self, workload: &Workload) -> Result<(), LaunchError> {
        self.home_region = workload.regions[0].clone();
        let config = sdk_config(&self.home_region).await;
        let role_arn = self.ensure_role(&config).await?;

        let runner_path = workload.runner_path.as_deref().ok_or_else(|| {
            LaunchError::Provision(
                "no runner payload configured; set [task] runner in the settings file".into(),
            )
        })?;
        let payload = std::fs::read(runner_path)?;

        for region in &workload.regions {
            self.ensure_function(region, &role_arn, &payload).await?;
        }
        self.create_queue().await
    }

    async fn launch(&self, spec: &RunnerSpec) -> Result<(), LaunchError> {
        let config = sdk_config(&spec.region).await;
        let lambda = aws_sdk_lambda::Client::new(&config);
        let envelope = serde_json::to_vec(&InvokeArgs::from_spec(spec))
            .map_err(|e| LaunchError::Invoke(e.to_string()))?;
        lambda
            .invoke()
            .function_name(FUNCTION_NAME)
            .invocation_type(InvocationType::Event)
            .payload(Blob::new(envelope))
            .send()
            .await
            .map_err(|e| LaunchError::Invoke(e.to_string()))?;
        Ok(())
    }

    fn queue_url(&self) -> &str {
        &self.queue_url
    }

    fn queue_region(&self) -> &str {
        &self.home_region
    }

    async fn teardown(&mut self) {
        if self.queue_url.is_empty() {
            return;
        }
        let config = sdk_config(&self.home_region).await;
        let sqs = aws_sdk_sqs::Client::new(&config);
        if let Err(error) = sqs.delete_queue().queue_url(&self.queue_url).send().await {
            warn!(error = %error, "failed to delete result queue");
        }
        self.queue_url.clear();
    }
}

/// Self-fork transport for Lambda-hosted runners: invoke the function again
/// in the runner's own region.
pub struct LambdaRespawn;

#[async_trait]
impl Respawn for LambdaRespawn {
    async fn respawn(&self, spec: &RunnerSpec) -> Result<(), LaunchError> {
        let config = sdk_config(&spec.region).await;
        let lambda = aws_sdk_lambda::Client::new(&config);
        let envelope = serde_json::to_vec(&InvokeArgs::from_spec(spec))
            .map_err(|e| LaunchError::Invoke(e.to_string()))?;
        lambda
            .invoke()
            .function_name(FUNCTION_NAME)
            .invocation_type(InvocationType::Event)
            .payload(Blob::new(envelope))
            .send()
            .await
            .map_err(|e| LaunchError::Invoke(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shasum_matches_known_vector() {
        // sha256("") base64-encoded
        assert_eq!(
            payload_shasum(b""),
            "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU="
        );
    }

    #[test]
    fn alias_name_has_no_dots() {
        assert!(!alias_name().contains('.'));
        assert!(alias_name().starts_with('v'));
    }
}
