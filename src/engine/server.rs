use crate::model::RunConfig;
use anyhow::{Context, Result};
use reqwest::Url;
use std::time::Duration;

/// HTTP client for the test server endpoints. Transfer traffic goes to
/// `base_url`; latency probes go to the dedicated `ping_base` so probe
/// scheduling never competes with transfer sockets for a connection.
#[derive(Clone)]
pub struct TestServerClient {
    pub base_url: Url,
    pub ping_base: Url,
    pub meas_id: String,
    pub http: reqwest::Client,
}

impl TestServerClient {
    pub fn new(cfg: &RunConfig) -> Result<Self> {
        let base_url = Url::parse(&cfg.base_url).context("invalid base_url")?;
        let ping_base = Url::parse(cfg.ping_base()).context("invalid ping_base_url")?;

        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(15))
            .build()
            .context("failed to build http client")?;

        Ok(Self {
            base_url,
            ping_base,
            meas_id: cfg.meas_id.clone(),
            http,
        })
    }

    pub fn download_url(&self) -> Url {
        self.base_url.join("/download").expect("join /download")
    }

    pub fn upload_url(&self) -> Url {
        self.base_url.join("/upload").expect("join /upload")
    }

    pub fn ping_url(&self) -> Url {
        self.ping_base.join("/ping").expect("join /ping")
    }

    /// Point latency probes at a different server without rebuilding the
    /// transfer client.
    pub fn with_ping_base(&self, base: &str) -> Result<Self> {
        let ping_base = Url::parse(base).context("invalid ping base")?;
        Ok(Self {
            ping_base,
            ..self.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PhaseDurations, ProbeConfig, WarmupConfig};

    fn test_config(base: &str, ping: Option<&str>) -> RunConfig {
        RunConfig {
            base_url: base.to_string(),
            ping_base_url: ping.map(|s| s.to_string()),
            meas_id: "1234".into(),
            user_agent: "bufferbloat-cli/test".into(),
            phases: PhaseDurations::default(),
            warmup: WarmupConfig::default(),
            probe: ProbeConfig::default(),
        }
    }

    #[test]
    fn urls_join_expected_paths() {
        let c = TestServerClient::new(&test_config("http://127.0.0.1:8080", None)).unwrap();
        assert_eq!(c.download_url().path(), "/download");
        assert_eq!(c.upload_url().path(), "/upload");
        assert_eq!(c.ping_url().path(), "/ping");
        // Without a dedicated ping host, probes share the transfer host.
        assert_eq!(c.ping_url().host_str(), c.download_url().host_str());
    }

    #[test]
    fn dedicated_ping_host_is_used() {
        let c = TestServerClient::new(&test_config(
            "http://127.0.0.1:8080",
            Some("http://127.0.0.1:9090"),
        ))
        .unwrap();
        assert_eq!(c.ping_url().port(), Some(9090));
        assert_eq!(c.download_url().port(), Some(8080));
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        assert!(TestServerClient::new(&test_config("not a url", None)).is_err());
    }
}
