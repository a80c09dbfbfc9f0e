//! Worker launch and stop through the `pipe` command line tool.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use gridscale_core::{CommandExecutor, GridScaleError, PriceType, Result};

/// Everything needed to launch one worker run.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRequest {
    pub instance_type: String,
    pub disk_size: u32,
    pub image: String,
    pub cmd_template: String,
    pub parent_run_id: String,
    pub price_type: PriceType,
    pub region_id: u64,
    /// Extra `key value` launch parameters, in order.
    pub params: Vec<(String, String)>,
}

/// Launches and stops compute runs.
#[async_trait]
pub trait ComputeLauncher: Send + Sync {
    /// Launch a run and return its id.
    async fn launch(&self, request: &LaunchRequest) -> Result<String>;

    async fn stop(&self, run_id: &str) -> Result<()>;
}

/// `ComputeLauncher` backed by the `pipe` CLI.
pub struct PipeCli {
    executor: Arc<dyn CommandExecutor>,
    binary: String,
}

impl PipeCli {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            binary: "pipe".to_string(),
        }
    }

    /// Use a `pipe` binary other than the one on `PATH`.
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }
}

fn price_type_arg(price_type: PriceType) -> &'static str {
    match price_type {
        PriceType::Spot => "spot",
        PriceType::OnDemand => "on-demand",
    }
}

/// The run id is the last non-empty line `pipe run --quiet` prints.
fn parse_run_id(output: &str) -> Result<String> {
    output
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .filter(|line| line.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string)
        .ok_or_else(|| GridScaleError::Parsing(format!("no run id in launch output: {output:?}")))
}

#[async_trait]
impl ComputeLauncher for PipeCli {
    async fn launch(&self, request: &LaunchRequest) -> Result<String> {
        let disk = request.disk_size.to_string();
        let region = request.region_id.to_string();
        let mut args: Vec<&str> = vec![
            "run",
            "--yes",
            "--quiet",
            "--instance-disk",
            disk.as_str(),
            "--instance-type",
            request.instance_type.as_str(),
            "--docker-image",
            request.image.as_str(),
            "--cmd-template",
            request.cmd_template.as_str(),
            "--parent-id",
            request.parent_run_id.as_str(),
            "--price-type",
            price_type_arg(request.price_type),
            "--region-id",
            region.as_str(),
        ];
        for (key, value) in &request.params {
            args.push(key);
            args.push(value);
        }
        let output = self.executor.execute(&self.binary, &args).await?;
        let run_id = parse_run_id(&output)?;
        info!(%run_id, instance_type = %request.instance_type, "worker run launched");
        Ok(run_id)
    }

    async fn stop(&self, run_id: &str) -> Result<()> {
        self.executor
            .execute(&self.binary, &["stop", "--yes", run_id])
            .await?;
        info!(%run_id, "worker run stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridscale_core::testing::FakeExecutor;

    fn request() -> LaunchRequest {
        LaunchRequest {
            instance_type: "m5.large".to_string(),
            disk_size: 50,
            image: "library/centos:7".to_string(),
            cmd_template: "sleep infinity".to_string(),
            parent_run_id: "1".to_string(),
            price_type: PriceType::OnDemand,
            region_id: 2,
            params: vec![
                ("cluster_role".to_string(), "worker".to_string()),
                ("cluster_role_type".to_string(), "additional".to_string()),
            ],
        }
    }

    const LAUNCH: &str = "pipe run --yes --quiet --instance-disk 50 --instance-type m5.large \
--docker-image library/centos:7 --cmd-template sleep infinity --parent-id 1 \
--price-type on-demand --region-id 2 cluster_role worker cluster_role_type additional";

    #[tokio::test]
    async fn launch_returns_run_id() {
        let executor = Arc::new(FakeExecutor::new());
        executor.on(LAUNCH, "Pipeline run scheduled\n4242\n");
        let cli = PipeCli::new(executor.clone());

        assert_eq!(cli.launch(&request()).await.unwrap(), "4242");
        assert!(executor.called(LAUNCH));
    }

    #[tokio::test]
    async fn launch_without_run_id_is_a_parsing_error() {
        let executor = Arc::new(FakeExecutor::new());
        executor.on(LAUNCH, "something went sideways\n");
        let err = PipeCli::new(executor).launch(&request()).await.unwrap_err();
        assert!(matches!(err, GridScaleError::Parsing(_)));
    }

    #[tokio::test]
    async fn stop_uses_configured_binary() {
        let executor = Arc::new(FakeExecutor::new());
        let cli = PipeCli::new(executor.clone()).with_binary("/opt/pipe/pipe");
        cli.stop("4242").await.unwrap();
        assert_eq!(executor.calls(), ["/opt/pipe/pipe stop --yes 4242"]);
    }

    #[test]
    fn run_id_is_last_numeric_line() {
        assert_eq!(parse_run_id("12\n").unwrap(), "12");
        assert_eq!(parse_run_id("warning\n\n 77 \n\n").unwrap(), "77");
        assert!(parse_run_id("").is_err());
    }
}
