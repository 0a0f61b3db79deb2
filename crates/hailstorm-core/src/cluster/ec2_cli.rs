use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::cluster::aws::{
    Ec2Api, Ec2Factory, Ec2Instance, InstanceState, MachineImage, RunInstanceRequest,
};
use crate::config::AmazonCloudConfig;
use crate::error::HailstormError;

/// [`Ec2Api`] implemented over the `aws` CLI binary.
///
/// Credentials are injected per call through the environment, so nothing
/// secret lands in process arguments. Rate-limit and connectivity failures
/// map to transient errors for the retry layer.
#[derive(Debug, Clone)]
pub struct AwsCliEc2 {
    access_key: String,
    secret_key: String,
    region: String,
}

impl AwsCliEc2 {
    pub fn new(config: &AmazonCloudConfig) -> Self {
        Self {
            access_key: config.access_key.clone(),
            secret_key: config.secret_key.clone(),
            region: config.region.clone(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<Value, HailstormError> {
        let output = Command::new("aws")
            .args(["ec2", "--region", &self.region, "--output", "json"])
            .args(args)
            .env("AWS_ACCESS_KEY_ID", &self.access_key)
            .env("AWS_SECRET_ACCESS_KEY", &self.secret_key)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| HailstormError::transient("aws-api", e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            if stderr.contains("RequestLimitExceeded")
                || stderr.contains("Throttling")
                || stderr.contains("Could not connect")
                || stderr.contains("timed out")
            {
                return Err(HailstormError::transient("aws-api", stderr.trim().to_string()));
            }
            return Err(HailstormError::Setup(format!(
                "aws ec2 {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }
        if output.stdout.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }

    fn parse_instance(value: &Value) -> Option<Ec2Instance> {
        let id = value.get("InstanceId")?.as_str()?.to_string();
        let state = value
            .get("State")
            .and_then(|s| s.get("Name"))
            .and_then(Value::as_str)
            .and_then(InstanceState::parse)?;
        Some(Ec2Instance {
            id,
            state,
            public_ip: value
                .get("PublicIpAddress")
                .and_then(Value::as_str)
                .map(str::to_string),
            private_ip: value
                .get("PrivateIpAddress")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

#[async_trait]
impl Ec2Api for AwsCliEc2 {
    async fn key_pair_exists(&self, name: &str) -> Result<bool, HailstormError> {
        match self.run(&["describe-key-pairs", "--key-names", name]).await {
            Ok(_) => Ok(true),
            Err(HailstormError::Setup(message)) if message.contains("NotFound") => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn create_key_pair(&self, name: &str) -> Result<String, HailstormError> {
        let value = self.run(&["create-key-pair", "--key-name", name]).await?;
        value
            .get("KeyMaterial")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                HailstormError::Setup("create-key-pair returned no key material".to_string())
            })
    }

    async fn delete_key_pair(&self, name: &str) -> Result<(), HailstormError> {
        self.run(&["delete-key-pair", "--key-name", name]).await?;
        Ok(())
    }

    async fn ensure_security_group(
        &self,
        name: &str,
        description: &str,
        open_ports: &[u16],
    ) -> Result<(), HailstormError> {
        let exists = match self
            .run(&["describe-security-groups", "--group-names", name])
            .await
        {
            Ok(_) => true,
            Err(HailstormError::Setup(message)) if message.contains("NotFound") => false,
            Err(err) => return Err(err),
        };
        if exists {
            return Ok(());
        }
        self.run(&[
            "create-security-group",
            "--group-name",
            name,
            "--description",
            description,
        ])
        .await?;
        for port in open_ports {
            let port = port.to_string();
            self.run(&[
                "authorize-security-group-ingress",
                "--group-name",
                name,
                "--protocol",
                "tcp",
                "--port",
                &port,
                "--cidr",
                "0.0.0.0/0",
            ])
            .await?;
        }
        Ok(())
    }

    async fn images_by_name(&self, name: &str) -> Result<Vec<MachineImage>, HailstormError> {
        let filter = format!("Name=name,Values={name}");
        let value = self
            .run(&["describe-images", "--owners", "self", "--filters", &filter])
            .await?;
        let images = value
            .get("Images")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|image| {
                        Some(MachineImage {
                            id: image.get("ImageId")?.as_str()?.to_string(),
                            name: image.get("Name")?.as_str()?.to_string(),
                            state: image.get("State")?.as_str()?.to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(images)
    }

    async fn create_image(
        &self,
        instance_id: &str,
        name: &str,
    ) -> Result<String, HailstormError> {
        let value = self
            .run(&["create-image", "--instance-id", instance_id, "--name", name])
            .await?;
        value
            .get("ImageId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| HailstormError::Setup("create-image returned no image id".to_string()))
    }

    async fn run_instance(
        &self,
        request: &RunInstanceRequest,
    ) -> Result<Ec2Instance, HailstormError> {
        let mut args: Vec<String> = vec![
            "run-instances".to_string(),
            "--image-id".to_string(),
            request.image_id.clone(),
            "--instance-type".to_string(),
            request.instance_type.clone(),
            "--key-name".to_string(),
            request.key_name.clone(),
            "--security-groups".to_string(),
            request.security_group.clone(),
            "--client-token".to_string(),
            request.client_token.clone(),
            "--count".to_string(),
            "1".to_string(),
        ];
        if let Some(zone) = &request.zone {
            args.push("--placement".to_string());
            args.push(format!("AvailabilityZone={zone}"));
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let value = self.run(&arg_refs).await?;
        value
            .get("Instances")
            .and_then(Value::as_array)
            .and_then(|instances| instances.first())
            .and_then(Self::parse_instance)
            .ok_or_else(|| {
                HailstormError::Setup("run-instances returned no instance".to_string())
            })
    }

    async fn describe_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<Ec2Instance>, HailstormError> {
        let value = match self
            .run(&["describe-instances", "--instance-ids", instance_id])
            .await
        {
            Ok(value) => value,
            Err(HailstormError::Setup(message)) if message.contains("NotFound") => {
                return Ok(None)
            }
            Err(err) => return Err(err),
        };
        let instance = value
            .get("Reservations")
            .and_then(Value::as_array)
            .and_then(|reservations| reservations.first())
            .and_then(|r| r.get("Instances"))
            .and_then(Value::as_array)
            .and_then(|instances| instances.first())
            .and_then(Self::parse_instance);
        Ok(instance)
    }

    async fn instance_checks_passed(&self, instance_id: &str) -> Result<bool, HailstormError> {
        let value = self
            .run(&["describe-instance-status", "--instance-ids", instance_id])
            .await?;
        let passed = value
            .get("InstanceStatuses")
            .and_then(Value::as_array)
            .and_then(|statuses| statuses.first())
            .map(|status| {
                let system_ok = status
                    .pointer("/SystemStatus/Status")
                    .and_then(Value::as_str)
                    == Some("ok");
                let instance_ok = status
                    .pointer("/InstanceStatus/Status")
                    .and_then(Value::as_str)
                    == Some("ok");
                system_ok && instance_ok
            })
            .unwrap_or(false);
        Ok(passed)
    }

    async fn start_instance(&self, instance_id: &str) -> Result<(), HailstormError> {
        self.run(&["start-instances", "--instance-ids", instance_id])
            .await?;
        Ok(())
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<(), HailstormError> {
        self.run(&["stop-instances", "--instance-ids", instance_id])
            .await?;
        Ok(())
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<(), HailstormError> {
        self.run(&["terminate-instances", "--instance-ids", instance_id])
            .await?;
        Ok(())
    }

    async fn available_zones(&self) -> Result<Vec<String>, HailstormError> {
        let value = self
            .run(&[
                "describe-availability-zones",
                "--filters",
                "Name=state,Values=available",
            ])
            .await?;
        let zones = value
            .get("AvailabilityZones")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|zone| zone.get("ZoneName").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(zones)
    }
}

/// [`Ec2Factory`] producing CLI-backed clients, one per cluster config.
#[derive(Debug, Clone, Default)]
pub struct AwsCliFactory;

impl Ec2Factory for AwsCliFactory {
    fn ec2(&self, config: &AmazonCloudConfig) -> Arc<dyn Ec2Api> {
        Arc::new(AwsCliEc2::new(config))
    }
}
