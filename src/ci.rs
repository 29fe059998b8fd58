//! HTTP access to the CI server.
//!
//! Every request resolves the server URL from the live configuration snapshot, so once the SSH
//! tunnel rewrites the URL all traffic (including the liveness checks) flows through the tunnel.

use crate::config::{Config, SharedConfig};
use crate::errors;
use anyhow::{Context, Result};
use regex::Regex;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use std::sync::LazyLock;
use std::time::SystemTime;
use tokio::sync::OnceCell;

const NODE_STATUS_PATH: &str = "computer/{name}/api/xml";
const NODE_CONFIG_PATH: &str = "computer/{name}/config.xml";
const NODE_PAGE_PATH: &str = "computer/{name}/";
const NODE_DESCRIPTOR_PATH: &str = "computer/{name}/slave-agent.jnlp";
const NODE_SCRIPT_PATH: &str = "computer/{name}/scriptText";
const COMPUTERS_PATH: &str = "computer/api/xml";
const CREATE_NODE_PATH: &str = "computer/doCreateItem";
const JNLP_LISTENER_PATH: &str = "tcpSlaveAgentListener/";
const CRUMB_PATH: &str = "crumbIssuer/api/xml?xpath=concat(//crumbRequestField,%22:%22,//crumb)";

pub const FULL_GC_SCRIPT: &str = "3.times{ System.gc() }";

const EXPECTED_NODE_TYPE: &str = "hudson.slaves.DumbSlave$DescriptorImpl";
const EXPECTED_NODE_LAUNCHER: &str = "hudson.slaves.JNLPLauncher";

static SECRET_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<pre>.*-secret ([A-F0-9]+)[^A-F0-9]*</pre>").expect("valid secret pattern")
});

static COMPUTER_NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<computer(?:\s[^>]*)?>.*?<displayName>(.*?)</displayName>")
        .expect("valid computer pattern")
});

/// The node as the CI server sees it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStatus {
    pub display_name: String,
    pub idle: bool,
    pub offline: bool,
    pub temporarily_offline: bool,
}

impl NodeStatus {
    pub fn parse(xml: &str) -> Self {
        Self {
            display_name: xml_tag_value(xml, "displayName").unwrap_or_default(),
            idle: xml_tag_value(xml, "idle").is_some_and(|v| v.trim() == "true"),
            offline: xml_tag_value(xml, "offline").is_some_and(|v| v.trim() == "true"),
            temporarily_offline: xml_tag_value(xml, "temporarilyOffline")
                .is_some_and(|v| v.trim() == "true"),
        }
    }
}

pub struct CiClient {
    http: reqwest::Client,
    config: SharedConfig,
    crumb: OnceCell<Option<(String, String)>>,
}

impl CiClient {
    pub fn new(config: SharedConfig) -> Result<Self> {
        let snapshot = config.load();
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(snapshot.ci.accept_any_cert)
            .timeout(snapshot.ci.request_timeout())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            config: config.clone(),
            crumb: OnceCell::new(),
        })
    }

    fn url_for(config: &Config, path: &str) -> String {
        format!(
            "{}/{}",
            config.ci.url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn node_path(template: &str, config: &Config) -> String {
        template.replace("{name}", &encode_path_segment(&config.client.name))
    }

    fn authenticated(&self, method: Method, path: &str) -> RequestBuilder {
        let config = self.config.load();
        let builder = self.http.request(method, Self::url_for(&config, path));
        if config.ci.auth.is_set() {
            builder.basic_auth(&config.ci.auth.user, Some(&config.ci.auth.password))
        } else {
            builder
        }
    }

    /// Builds a request with basic auth and, for state-changing methods, the CSRF crumb.
    pub async fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut builder = self.authenticated(method.clone(), path);

        if method != Method::GET
            && let Some((header, value)) = self.crumb().await
        {
            builder = builder.header(header.as_str(), value.as_str());
        }

        builder
    }

    pub async fn get(&self, path: &str) -> Result<Response> {
        self.request(Method::GET, path)
            .await
            .send()
            .await
            .with_context(|| format!("GET {} failed", path))
    }

    async fn crumb(&self) -> Option<(String, String)> {
        self.crumb
            .get_or_init(|| async {
                match self.fetch_crumb().await {
                    Ok(crumb) => {
                        if let Some((header, value)) = &crumb {
                            tracing::debug!(group = "security", "{}: {}", header, value);
                        }
                        crumb
                    }
                    Err(e) => {
                        tracing::debug!(group = "security", "No CSRF crumb available: {}", e);
                        None
                    }
                }
            })
            .await
            .clone()
    }

    async fn fetch_crumb(&self) -> Result<Option<(String, String)>> {
        let response = self
            .authenticated(Method::GET, CRUMB_PATH)
            .send()
            .await
            .with_context(|| format!("GET {} failed", CRUMB_PATH))?;
        if response.status() != StatusCode::OK {
            return Ok(None);
        }
        let content = response.text().await?;
        Ok(content
            .trim()
            .split_once(':')
            .map(|(header, value)| (header.to_string(), value.to_string())))
    }

    pub async fn node_status(&self) -> Result<NodeStatus> {
        let path = Self::node_path(NODE_STATUS_PATH, &self.config.load());
        let response = self.get(&path).await?;
        let status = response.status();
        anyhow::ensure!(
            status == StatusCode::OK,
            errors::ci::request_failed(&path, &status.to_string())
        );
        Ok(NodeStatus::parse(&response.text().await?))
    }

    pub async fn registered_nodes(&self) -> Result<Vec<String>> {
        let response = self.get(COMPUTERS_PATH).await?;
        let status = response.status();
        anyhow::ensure!(
            status == StatusCode::OK,
            errors::ci::request_failed(COMPUTERS_PATH, &status.to_string())
        );
        Ok(parse_computer_names(&response.text().await?))
    }

    /// Returns the port of the agent listener announced by the server.
    pub async fn jnlp_port(&self) -> Result<u16> {
        let response = self.get(JNLP_LISTENER_PATH).await?;
        let status = response.status();

        let port = if status == StatusCode::OK {
            ["X-Jenkins-JNLP-Port", "X-Hudson-JNLP-Port"]
                .iter()
                .find_map(|name| response.headers().get(*name))
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u16>().ok())
        } else {
            None
        };

        port.ok_or_else(|| anyhow::anyhow!(errors::tunnel::no_jnlp_port(&status.to_string())))
    }

    pub async fn node_config(&self) -> Result<String> {
        let path = Self::node_path(NODE_CONFIG_PATH, &self.config.load());
        let response = self.get(&path).await?;
        let status = response.status();
        anyhow::ensure!(
            status == StatusCode::OK,
            errors::ci::request_failed(&path, &status.to_string())
        );
        Ok(response.text().await?)
    }

    /// The JNLP descriptor the server hands out to agents of this node.
    pub async fn agent_descriptor(&self) -> Result<String> {
        let path = Self::node_path(NODE_DESCRIPTOR_PATH, &self.config.load());
        let response = self.get(&path).await?;
        let status = response.status();
        anyhow::ensure!(
            status == StatusCode::OK,
            errors::ci::request_failed(&path, &status.to_string())
        );
        Ok(response.text().await?)
    }

    pub async fn update_node_config(&self, xml: String) -> Result<()> {
        let path = Self::node_path(NODE_CONFIG_PATH, &self.config.load());
        let response = self
            .request(Method::POST, &path)
            .await
            .header(reqwest::header::CONTENT_TYPE, "application/xml")
            .body(xml)
            .send()
            .await
            .with_context(|| format!("POST {} failed", path))?;
        let status = response.status();
        anyhow::ensure!(
            status == StatusCode::OK,
            errors::ci::request_failed(&path, &status.to_string())
        );
        Ok(())
    }

    /// Reads the agent secret from the node page, `None` if the page does not show one.
    pub async fn fetch_secret(&self) -> Result<Option<String>> {
        let path = Self::node_path(NODE_PAGE_PATH, &self.config.load());
        let response = self.get(&path).await?;
        let status = response.status();
        anyhow::ensure!(
            status == StatusCode::OK,
            errors::ci::request_failed(&path, &status.to_string())
        );
        Ok(extract_secret(&response.text().await?))
    }

    pub async fn invoke_gc(&self) -> Result<()> {
        let path = Self::node_path(NODE_SCRIPT_PATH, &self.config.load());
        let response = self
            .request(Method::POST, &path)
            .await
            .form(&[("script", FULL_GC_SCRIPT)])
            .send()
            .await
            .with_context(|| format!("POST {} failed", path))?;
        let status = response.status();
        anyhow::ensure!(
            status == StatusCode::OK,
            errors::ci::request_failed(&path, &status.to_string())
        );
        Ok(())
    }

    pub async fn create_node(&self, name: &str, remote_fs: &str) -> Result<()> {
        let descriptor = serde_json::json!({
            "name": name,
            "nodeDescription": format!("Launcher auto generated node '{}'.", name),
            "numExecutors": 1,
            "remoteFS": remote_fs,
            "labelString": format!("launcher {} {}", std::env::consts::OS, std::env::consts::ARCH),
            "mode": "EXCLUSIVE",
            "type": EXPECTED_NODE_TYPE,
            "retentionStrategy": { "stapler-class": "hudson.slaves.RetentionStrategy$Always" },
            "nodeProperties": { "stapler-class-bag": true },
            "launcher": { "stapler-class": EXPECTED_NODE_LAUNCHER },
        });

        let response = self
            .request(Method::POST, CREATE_NODE_PATH)
            .await
            .query(&[
                ("name", name.to_string()),
                ("type", EXPECTED_NODE_TYPE.to_string()),
                ("json", descriptor.to_string()),
            ])
            .send()
            .await
            .context("Create node request failed")?;
        let status = response.status();
        anyhow::ensure!(
            status == StatusCode::OK,
            errors::ci::request_failed(CREATE_NODE_PATH, &status.to_string())
        );
        Ok(())
    }

    /// Downloads `path`, returning `None` when the server reports the local copy is current.
    pub async fn download(
        &self,
        path: &str,
        if_modified_since: Option<SystemTime>,
    ) -> Result<Option<Response>> {
        let mut builder = self.request(Method::GET, path).await;
        if let Some(modified) = if_modified_since {
            builder = builder.header(reqwest::header::IF_MODIFIED_SINCE, http_date(modified));
        }

        let response = builder
            .send()
            .await
            .with_context(|| format!("GET {} failed", path))?;

        match response.status() {
            StatusCode::NOT_MODIFIED => Ok(None),
            StatusCode::OK => Ok(Some(response)),
            status => Err(anyhow::anyhow!(errors::ci::request_failed(
                path,
                &status.to_string()
            ))),
        }
    }
}

pub fn http_date(time: SystemTime) -> String {
    chrono::DateTime::<chrono::Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

pub fn extract_secret(content: &str) -> Option<String> {
    SECRET_PATTERN
        .captures(content)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn parse_computer_names(xml: &str) -> Vec<String> {
    COMPUTER_NAME_PATTERN
        .captures_iter(xml)
        .filter_map(|captures| captures.get(1))
        .map(|m| xml_unescape(m.as_str()))
        .collect()
}

/// Percent-encodes `value` for use as one URL path segment.
pub fn encode_path_segment(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

/// Returns the text of the first `<tag>` element in `xml`.
pub fn xml_tag_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml_unescape(&xml[start..end]))
}

pub fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&#34;")
        .replace('\'', "&#39;")
}

pub fn xml_unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#34;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::shared;
    use crate::testing::{FakeCiServer, Route};

    fn client_for(server: &FakeCiServer) -> CiClient {
        let mut config = Config::default();
        config.ci.url = server.url.clone();
        config.client.name = "node-1".to_string();
        config.ci.auth.user = "bob".to_string();
        config.ci.auth.password = "pw".to_string();
        CiClient::new(shared(config)).unwrap()
    }

    const NODE_PAGE_HTML: &str = r#"
<li><p>Run from agent command line:</p>
<pre>java -jar <a href="/ci/jnlpJars/agent.jar">agent.jar</a> -jnlpUrl https://jenkins/ci/computer/it-s-w2k12-x64-en/slave-agent.jnlp -secret 6319B6E88BE1A62708E903FA422540FA58C2228AEB72161BDAF3B</pre></li>
"#;

    #[test]
    fn test_extract_secret() {
        assert_eq!(
            extract_secret(NODE_PAGE_HTML).as_deref(),
            Some("6319B6E88BE1A62708E903FA422540FA58C2228AEB72161BDAF3B")
        );
    }

    #[test]
    fn test_extract_secret_missing() {
        assert!(extract_secret("<html><body>no secret</body></html>").is_none());
    }

    #[test]
    fn test_parse_node_status() {
        let xml = r#"<slave _class="hudson.slaves.SlaveComputer"><displayName>node-1</displayName><executor/><idle>false</idle><offline>true</offline><temporarilyOffline>false</temporarilyOffline></slave>"#;
        let status = NodeStatus::parse(xml);
        assert_eq!(status.display_name, "node-1");
        assert!(!status.idle);
        assert!(status.offline);
        assert!(!status.temporarily_offline);
    }

    #[test]
    fn test_parse_computer_names() {
        let xml = r#"<computerSet _class="hudson.model.ComputerSet"><busyExecutors>0</busyExecutors><computer _class="hudson.model.Hudson$MasterComputer"><displayName>master</displayName></computer><computer _class="hudson.slaves.SlaveComputer"><displayName>build&amp;test</displayName></computer><displayName>Nodes</displayName></computerSet>"#;
        assert_eq!(parse_computer_names(xml), vec!["master", "build&test"]);
    }

    #[test]
    fn test_xml_escape_round_trip_of_special_chars() {
        let escaped = xml_escape("a<b>&\"c'");
        assert_eq!(escaped, "a&lt;b&gt;&amp;&#34;c&#39;");
        assert_eq!(xml_unescape(&escaped), "a<b>&\"c'");
    }

    #[test]
    fn test_node_paths_encode_the_name() {
        let mut config = Config::default();
        config.client.name = "build #1/x?y".to_string();
        assert_eq!(
            CiClient::node_path(NODE_STATUS_PATH, &config),
            "computer/build%20%231%2Fx%3Fy/api/xml"
        );

        config.client.name = "build01.example.com".to_string();
        assert_eq!(
            CiClient::node_path(NODE_CONFIG_PATH, &config),
            "computer/build01.example.com/config.xml"
        );
    }

    #[test]
    fn test_http_date_format() {
        let time = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(784111777);
        assert_eq!(http_date(time), "Sun, 06 Nov 1994 08:49:37 GMT");
    }

    #[tokio::test]
    async fn test_crumb_is_fetched_once_and_sent_with_posts() {
        let server = FakeCiServer::start(vec![
            Route::new("GET", "/crumbIssuer/api/xml").body("Jenkins-Crumb:abc123"),
            Route::new("POST", "/computer/node-1/scriptText"),
            Route::new("GET", "/computer/node-1/api/xml")
                .body("<slave><idle>true</idle><offline>false</offline></slave>"),
        ])
        .await;
        let ci = client_for(&server);

        assert!(ci.node_status().await.unwrap().idle);
        ci.invoke_gc().await.unwrap();
        ci.invoke_gc().await.unwrap();

        assert_eq!(server.count("GET", "/crumbIssuer"), 1);
        let posts: Vec<_> = server
            .requests()
            .into_iter()
            .filter(|r| r.method == "POST")
            .collect();
        assert_eq!(posts.len(), 2);
        for post in &posts {
            assert_eq!(post.header("Jenkins-Crumb"), Some("abc123"));
            assert!(post.header("Authorization").unwrap().starts_with("Basic "));
            assert!(post.body.starts_with("script="));
        }

        let status_request = server
            .requests()
            .into_iter()
            .find(|r| r.path.starts_with("/computer/node-1/api/xml"))
            .unwrap();
        assert!(status_request.header("Jenkins-Crumb").is_none());
    }

    #[tokio::test]
    async fn test_missing_crumb_issuer_is_remembered() {
        let server = FakeCiServer::start(vec![Route::new(
            "POST",
            "/computer/node-1/config.xml",
        )])
        .await;
        let ci = client_for(&server);

        ci.update_node_config("<slave/>".to_string()).await.unwrap();
        ci.update_node_config("<slave/>".to_string()).await.unwrap();

        assert_eq!(server.count("GET", "/crumbIssuer"), 1);
        assert_eq!(server.count("POST", "/computer/node-1/config.xml"), 2);
    }

    #[tokio::test]
    async fn test_jnlp_port_from_header() {
        let server = FakeCiServer::start(vec![
            Route::new("GET", "/tcpSlaveAgentListener/").header("X-Hudson-JNLP-Port", "50000"),
        ])
        .await;
        assert_eq!(client_for(&server).jnlp_port().await.unwrap(), 50000);
    }

    #[tokio::test]
    async fn test_agent_descriptor_requires_ok_status() {
        let server = FakeCiServer::start(vec![
            Route::new("GET", "/computer/node-1/slave-agent.jnlp").body("<jnlp/>"),
        ])
        .await;
        let client = client_for(&server);
        assert_eq!(client.agent_descriptor().await.unwrap(), "<jnlp/>");

        let missing = FakeCiServer::start(Vec::new()).await;
        assert!(client_for(&missing).agent_descriptor().await.is_err());
    }
}
