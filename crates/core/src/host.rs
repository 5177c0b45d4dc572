use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use reqwest::header::{HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::signing::RequestSigner;

const OCS_APP_API: &str = "/ocs/v1.php/apps/app_api/api/v1";
const OCS_APP_STATUS: &str = "/ocs/v1.php/apps/app_api/apps/status";
const FILE_ACTIONS_MENU: &str = "/ui/files-actions-menu";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Severity understood by the host's central log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Debug => 0,
            Self::Info => 1,
            Self::Warning => 2,
            Self::Error => 3,
            Self::Fatal => 4,
        }
    }
}

/// Entry in the host's file-actions dropdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileActionMenuEntry {
    pub name: String,
    pub display_name: String,
    pub action_handler: String,
    pub icon: String,
    pub mime: String,
    pub permissions: u32,
    pub order: i32,
}

impl FileActionMenuEntry {
    pub fn new(name: &str, display_name: &str, action_handler: &str) -> Self {
        Self {
            name: name.to_string(),
            display_name: display_name.to_string(),
            action_handler: action_handler.to_string(),
            icon: String::new(),
            mime: "file".to_string(),
            permissions: 31,
            order: 0,
        }
    }

    pub fn with_mime(mut self, mime: &str) -> Self {
        self.mime = mime.to_string();
        self
    }
}

#[derive(Debug, Deserialize)]
struct OcsEnvelope {
    ocs: OcsBody,
}

#[derive(Debug, Deserialize)]
struct OcsBody {
    meta: OcsMeta,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct OcsMeta {
    #[serde(default)]
    status: String,
    statuscode: u16,
    #[serde(default)]
    message: Option<String>,
}

/// Signed client for the host's OCS and WebDAV APIs.
#[derive(Debug, Clone)]
pub struct HostClient {
    base_url: Url,
    signer: RequestSigner,
    client: reqwest::Client,
}

impl HostClient {
    pub fn new(base_url: Url, signer: RequestSigner) -> Result<Self> {
        if base_url.cannot_be_a_base() {
            bail!("host URL cannot be used as a base: {base_url}");
        }

        let identity = signer.identity();
        let client = reqwest::Client::builder()
            .user_agent(format!(
                "ExApp/{}/{} (reqwest)",
                identity.app_id, identity.app_version
            ))
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            base_url,
            signer,
            client,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn signer(&self) -> &RequestSigner {
        &self.signer
    }

    fn ocs_url(&self, path: &str) -> Result<Url> {
        let base = self.base_url.as_str().trim_end_matches('/');
        Url::parse(&format!("{base}{path}"))
            .with_context(|| format!("failed to build URL for path: {path}"))
    }

    /// `/remote.php/dav/files/<user>/<path>` with each segment percent-encoded.
    pub fn dav_url(&self, user: &str, path: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| anyhow!("host URL cannot be used as a base"))?;
            segments.pop_if_empty();
            segments.extend(["remote.php", "dav", "files", user]);
            segments.extend(path.split('/').filter(|segment| !segment.is_empty()));
        }
        Ok(url)
    }

    async fn ocs<T: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        user: &str,
        body: &T,
    ) -> Result<serde_json::Value> {
        let url = self.ocs_url(path)?;
        let resp = self
            .client
            .request(method.clone(), url)
            .headers(self.signer.sign(user))
            .header("OCS-APIRequest", HeaderValue::from_static("true"))
            .header(ACCEPT, HeaderValue::from_static("application/json"))
            .json(body)
            .send()
            .await
            .with_context(|| format!("failed to reach host for {method} {path}"))?;

        let status = resp.status();
        let raw = resp
            .bytes()
            .await
            .with_context(|| format!("failed to read response of {method} {path}"))?;
        let envelope = serde_json::from_slice::<OcsEnvelope>(&raw).ok();

        if !status.is_success() {
            let message = envelope
                .as_ref()
                .and_then(|env| env.ocs.meta.message.clone())
                .unwrap_or_default();
            bail!(
                "host {method} {path} returned HTTP {}{}",
                status.as_u16(),
                if message.is_empty() {
                    String::new()
                } else {
                    format!(": {message}")
                }
            );
        }

        let Some(envelope) = envelope else {
            bail!("host {method} {path} returned a non-OCS response body");
        };

        let meta = envelope.ocs.meta;
        if !matches!(meta.statuscode, 100 | 200) {
            bail!(
                "host {method} {path} failed with OCS status {} ({}): {}",
                meta.statuscode,
                meta.status,
                meta.message.unwrap_or_default()
            );
        }

        Ok(envelope.ocs.data)
    }

    /// Write `message` to the host's central log.
    pub async fn log(&self, user: &str, level: LogLevel, message: &str) -> Result<()> {
        let body = serde_json::json!({
            "level": level.as_i32(),
            "message": message,
        });
        self.ocs(Method::POST, &format!("{OCS_APP_API}/log"), user, &body)
            .await?;
        Ok(())
    }

    /// Create a notification for `user`; returns the generated object id.
    pub async fn notify(&self, user: &str, subject: &str, message: &str) -> Result<String> {
        let object_id = Uuid::new_v4().simple().to_string();
        let body = serde_json::json!({
            "params": {
                "object": "app_api",
                "object_id": object_id,
                "subject_type": "app_api_ex_app",
                "subject_params": {
                    "rich_subject": subject,
                    "rich_subject_params": {},
                    "rich_message": message,
                    "rich_message_params": {},
                },
            }
        });
        self.ocs(
            Method::POST,
            &format!("{OCS_APP_API}/notification"),
            user,
            &body,
        )
        .await?;
        Ok(object_id)
    }

    pub async fn register_file_action(&self, user: &str, entry: &FileActionMenuEntry) -> Result<()> {
        self.ocs(
            Method::POST,
            &format!("{OCS_APP_API}{FILE_ACTIONS_MENU}"),
            user,
            entry,
        )
        .await
        .with_context(|| format!("failed to register file action '{}'", entry.name))?;
        Ok(())
    }

    pub async fn unregister_file_action(&self, user: &str, name: &str) -> Result<()> {
        let body = serde_json::json!({ "name": name });
        self.ocs(
            Method::DELETE,
            &format!("{OCS_APP_API}{FILE_ACTIONS_MENU}"),
            user,
            &body,
        )
        .await
        .with_context(|| format!("failed to unregister file action '{name}'"))?;
        Ok(())
    }

    /// Report setup progress (0..=100) to the host's status API.
    pub async fn set_init_status(&self, progress: u8, error: Option<&str>) -> Result<()> {
        let app_id = &self.signer.identity().app_id;
        let body = serde_json::json!({
            "progress": progress.min(100),
            "error": error.unwrap_or_default(),
        });
        self.ocs(
            Method::PUT,
            &format!("{OCS_APP_STATUS}/{app_id}"),
            "",
            &body,
        )
        .await?;
        Ok(())
    }

    /// Fetch a user's file over WebDAV.
    pub async fn download(&self, user: &str, path: &str) -> Result<Vec<u8>> {
        let url = self.dav_url(user, path)?;
        let resp = self
            .client
            .get(url)
            .headers(self.signer.sign(user))
            .send()
            .await
            .with_context(|| format!("failed to download {path}"))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            bail!("file not found: {path}");
        }
        if !status.is_success() {
            bail!("WebDAV GET {path} returned HTTP {}", status.as_u16());
        }

        let bytes = resp
            .bytes()
            .await
            .with_context(|| format!("failed to read body of {path}"))?;
        Ok(bytes.to_vec())
    }

    /// Store `data` at `path`, replacing any existing file.
    pub async fn upload(&self, user: &str, path: &str, data: Vec<u8>) -> Result<()> {
        let url = self.dav_url(user, path)?;
        let content_type = mime_guess::from_path(path).first_or_octet_stream();
        let resp = self
            .client
            .put(url)
            .headers(self.signer.sign(user))
            .header(CONTENT_TYPE, content_type.essence_str())
            .body(data)
            .send()
            .await
            .with_context(|| format!("failed to upload {path}"))?;

        let status = resp.status();
        if !status.is_success() {
            bail!("WebDAV PUT {path} returned HTTP {}", status.as_u16());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use wiremock::matchers::{body_json, body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::signing::ExAppIdentity;

    fn signer() -> RequestSigner {
        RequestSigner::new(ExAppIdentity {
            app_id: "upscaler".to_string(),
            app_version: "1.0.0".to_string(),
            app_secret: "secret123".to_string(),
            aa_version: "2.3.0".to_string(),
        })
    }

    fn client_for(server: &MockServer) -> HostClient {
        HostClient::new(Url::parse(&server.uri()).unwrap(), signer()).unwrap()
    }

    fn ocs_ok() -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ocs": {"meta": {"status": "ok", "statuscode": 200, "message": "OK"}, "data": []}
        }))
    }

    #[test]
    fn dav_url_encodes_segments() {
        let client = HostClient::new(Url::parse("http://nc.local/").unwrap(), signer()).unwrap();
        let url = client.dav_url("alice", "/My Photos/photo #1.jpg").unwrap();
        assert_eq!(
            url.as_str(),
            "http://nc.local/remote.php/dav/files/alice/My%20Photos/photo%20%231.jpg"
        );
    }

    #[test]
    fn dav_url_keeps_subdirectory_install() {
        let client =
            HostClient::new(Url::parse("https://cloud.example/nc").unwrap(), signer()).unwrap();
        let url = client.dav_url("bob", "a/b.png").unwrap();
        assert_eq!(
            url.as_str(),
            "https://cloud.example/nc/remote.php/dav/files/bob/a/b.png"
        );
        let ocs = client.ocs_url("/ocs/v1.php/x").unwrap();
        assert_eq!(ocs.as_str(), "https://cloud.example/nc/ocs/v1.php/x");
    }

    #[test]
    fn log_levels_match_host_numbering() {
        assert_eq!(LogLevel::Debug.as_i32(), 0);
        assert_eq!(LogLevel::Warning.as_i32(), 2);
        assert_eq!(LogLevel::Error.as_i32(), 3);
        assert_eq!(LogLevel::Fatal.as_i32(), 4);
    }

    #[tokio::test]
    async fn log_sends_signed_ocs_request() {
        let server = MockServer::start().await;
        let expected_auth = BASE64.encode("alice:secret123");
        Mock::given(method("POST"))
            .and(path("/ocs/v1.php/apps/app_api/api/v1/log"))
            .and(header("OCS-APIRequest", "true"))
            .and(header("EX-APP-ID", "upscaler"))
            .and(header("EX-APP-VERSION", "1.0.0"))
            .and(header("AA-VERSION", "2.3.0"))
            .and(header("AUTHORIZATION-APP-API", expected_auth.as_str()))
            .and(body_json(serde_json::json!({"level": 3, "message": "boom"})))
            .respond_with(ocs_ok())
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server)
            .log("alice", LogLevel::Error, "boom")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn notify_posts_rich_subject_and_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ocs/v1.php/apps/app_api/api/v1/notification"))
            .and(body_partial_json(serde_json::json!({
                "params": {
                    "object": "app_api",
                    "subject_type": "app_api_ex_app",
                    "subject_params": {
                        "rich_subject": "Done",
                        "rich_message": "/x.png is ready."
                    }
                }
            })))
            .respond_with(ocs_ok())
            .expect(1)
            .mount(&server)
            .await;

        let object_id = client_for(&server)
            .notify("alice", "Done", "/x.png is ready.")
            .await
            .unwrap();
        assert_eq!(object_id.len(), 32);
    }

    #[tokio::test]
    async fn ocs_failure_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ocs": {"meta": {"status": "failure", "statuscode": 997, "message": "not allowed"}, "data": []}
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .register_file_action("", &FileActionMenuEntry::new("upscale", "Upscale", "/gfpgan_upscale"))
            .await
            .unwrap_err();
        let rendered = format!("{err:#}");
        assert!(rendered.contains("failed to register file action 'upscale'"), "{rendered}");
        assert!(rendered.contains("997"), "{rendered}");
        assert!(rendered.contains("not allowed"), "{rendered}");
    }

    #[tokio::test]
    async fn ocs_http_error_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .unregister_file_action("", "restore")
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("HTTP 401"));
    }

    #[tokio::test]
    async fn register_file_action_sends_menu_entry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ocs/v1.php/apps/app_api/api/v1/ui/files-actions-menu"))
            .and(body_partial_json(serde_json::json!({
                "name": "upscale",
                "displayName": "Upscale",
                "actionHandler": "/gfpgan_upscale",
                "mime": "image"
            })))
            .respond_with(ocs_ok())
            .expect(1)
            .mount(&server)
            .await;

        let entry = FileActionMenuEntry::new("upscale", "Upscale", "/gfpgan_upscale").with_mime("image");
        client_for(&server)
            .register_file_action("", &entry)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn init_status_targets_app_id() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/ocs/v1.php/apps/app_api/apps/status/upscaler"))
            .and(body_partial_json(serde_json::json!({"progress": 100})))
            .respond_with(ocs_ok())
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server).set_init_status(100, None).await.unwrap();
    }

    #[tokio::test]
    async fn download_returns_body_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/remote.php/dav/files/alice/Photos/photo.jpg"))
            .and(header("EX-APP-ID", "upscaler"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"jpeg-bytes".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let bytes = client_for(&server)
            .download("alice", "/Photos/photo.jpg")
            .await
            .unwrap();
        assert_eq!(bytes, b"jpeg-bytes");
    }

    #[tokio::test]
    async fn download_missing_file_reports_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .download("alice", "/Photos/gone.jpg")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("file not found: /Photos/gone.jpg"));
    }

    #[tokio::test]
    async fn upload_puts_bytes_with_guessed_content_type() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/remote.php/dav/files/alice/Photos/photo_upscaled.png"))
            .and(header("content-type", "image/png"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server)
            .upload("alice", "/Photos/photo_upscaled.png", b"png".to_vec())
            .await
            .unwrap();

        let received = server.received_requests().await.unwrap();
        assert_eq!(received[0].body, b"png");
    }

    #[tokio::test]
    async fn upload_failure_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(507))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .upload("alice", "/full.jpg", vec![1, 2, 3])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("HTTP 507"));
    }
}
