//! Transport seam between the session layer and a XAPI endpoint.
//!
//! [`XenApiTransport`] carries one XML-RPC call and returns the raw result
//! value (still wrapped in the XenAPI envelope). [`HttpTransport`] POSTs
//! `methodCall` documents over HTTP(S); the in-memory
//! [`SimulatedXapi`](crate::simulated::SimulatedXapi) implements the same trait.

use crate::config::XenApiConfig;
use crate::error::{XenApiError, XenApiResult};
use crate::xmlrpc::{self, Value};

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response};
use std::time::Duration;

/// Carries XML-RPC calls to XAPI.
///
/// Implementations must be `Send + Sync` so one transport can back many
/// sessions behind an `Arc`.
#[async_trait::async_trait]
pub trait XenApiTransport: Send + Sync {
    /// Invoke `method` with positional `params`; returns the envelope value.
    async fn request(&self, method: &str, params: Vec<Value>) -> XenApiResult<Value>;

    /// Endpoint description for log lines.
    fn endpoint(&self) -> &str;
}

/// XML-RPC over HTTP(S).
pub struct HttpTransport {
    client: Client,
    url: String,
}

impl HttpTransport {
    /// Build a new transport from config (does NOT log in).
    pub fn new(config: &XenApiConfig) -> XenApiResult<Self> {
        let url = config.endpoint()?;

        let client = Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| XenApiError::transport(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    async fn check_status(resp: Response) -> XenApiResult<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let code = status.as_u16();
        let body = resp.text().await.unwrap_or_default();
        let excerpt: String = body.chars().take(500).collect();
        Err(XenApiError::http(
            code,
            format!("XAPI returned HTTP {code}: {excerpt}"),
        ))
    }
}

#[async_trait::async_trait]
impl XenApiTransport for HttpTransport {
    async fn request(&self, method: &str, params: Vec<Value>) -> XenApiResult<Value> {
        let body = xmlrpc::encode_call(method, &params)?;

        let resp = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "text/xml")
            .body(body)
            .send()
            .await?;
        let resp = Self::check_status(resp).await?;

        let text = resp.text().await.map_err(|e| {
            XenApiError::transport(format!("Failed to read response body: {e}"))
        })?;
        xmlrpc::decode_response(&text)
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::XenApiErrorKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve exactly one HTTP exchange, returning the raw request.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                if String::from_utf8_lossy(&request).contains("</methodCall>") {
                    break;
                }
            }
            let reply = format!(
                "HTTP/1.1 {status}\r\nContent-Type: text/xml\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&request).into_owned()
        });
        (format!("http://{addr}/"), handle)
    }

    #[tokio::test]
    async fn posts_method_call_and_decodes_envelope() {
        let (url, server) = serve_once(
            "200 OK",
            "<?xml version='1.0'?><methodResponse><params><param><value><struct>\
             <member><name>Status</name><value>Success</value></member>\
             <member><name>Value</name><value>OpaqueRef:session</value></member>\
             </struct></value></param></params></methodResponse>",
        )
        .await;

        let transport = HttpTransport::new(&XenApiConfig::new(url, "root", "pw")).unwrap();
        let value = transport
            .request(
                "session.login_with_password",
                vec![Value::from("root"), Value::from("pw")],
            )
            .await
            .unwrap();
        let value = xmlrpc::unwrap_envelope("session.login_with_password", value).unwrap();
        assert_eq!(value, Value::from("OpaqueRef:session"));

        let request = server.await.unwrap();
        assert!(request.starts_with("POST / HTTP/1.1"));
        assert!(request.to_ascii_lowercase().contains("content-type: text/xml"));
        assert!(request.contains("<methodName>session.login_with_password</methodName>"));
    }

    #[tokio::test]
    async fn http_error_status_is_reported() {
        let (url, server) = serve_once("500 Internal Server Error", "boom").await;
        let transport = HttpTransport::new(&XenApiConfig::new(url, "root", "pw")).unwrap();
        let err = transport.request("SR.get_all", Vec::new()).await.unwrap_err();
        assert_eq!(err.kind, XenApiErrorKind::Http(500));
        assert!(err.message.contains("boom"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport =
            HttpTransport::new(&XenApiConfig::new(format!("http://{addr}/"), "root", "pw")).unwrap();
        let err = transport.request("SR.get_all", Vec::new()).await.unwrap_err();
        assert!(matches!(
            err.kind,
            XenApiErrorKind::Transport | XenApiErrorKind::Timeout
        ));
    }

    #[test]
    fn rejects_bad_url() {
        assert!(HttpTransport::new(&XenApiConfig::new("xs.local", "root", "pw")).is_err());
    }
}
