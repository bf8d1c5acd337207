//! OAuth endpoint discovery for remote servers.
//!
//! 1. Probe the server with `initialize`; a 401 may point at its protected
//!    resource metadata through `WWW-Authenticate: ... resource_metadata="..."`.
//! 2. Fetch protected resource metadata (RFC 9728) to find the
//!    authorization server, trying the path-inserted location before the
//!    origin root and defaulting to the server's own origin.
//! 3. Fetch authorization server metadata (RFC 8414), falling back to
//!    OpenID Connect discovery.
//! 4. Register a client dynamically (RFC 7591) when the server allows it
//!    and no client id is configured. Registration failure is not fatal.

use crate::error::{McpError, McpResult};
use crate::protocol::Request;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use url::Url;

/// What discovery found.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthDiscovery {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    /// Resource indicator (RFC 8707) to request tokens for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes_supported: Vec<String>,
    /// Filled by dynamic registration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_access_token: Option<String>,
}

/// Inputs for [`discover`].
#[derive(Debug, Clone)]
pub struct DiscoveryOptions<'a> {
    pub redirect_uri: &'a str,
    pub client_name: &'a str,
    /// Skip registration when a client id already exists.
    pub client_id: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ProtectedResourceMetadata {
    #[serde(default)]
    resource: Option<String>,
    #[serde(default)]
    authorization_servers: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AuthorizationServerMetadata {
    #[serde(default)]
    issuer: Option<String>,
    #[serde(default)]
    authorization_endpoint: Option<String>,
    #[serde(default)]
    token_endpoint: Option<String>,
    #[serde(default)]
    registration_endpoint: Option<String>,
    #[serde(default)]
    scopes_supported: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RegistrationResponse {
    client_id: String,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    registration_access_token: Option<String>,
}

/// Discover the OAuth endpoints protecting `server_url`.
pub async fn discover(
    http: &Client,
    server_url: &str,
    options: DiscoveryOptions<'_>,
) -> McpResult<AuthDiscovery> {
    let server = Url::parse(server_url)
        .map_err(|e| McpError::DiscoveryFailed(format!("Invalid server url '{server_url}': {e}")))?;

    let mut candidates = Vec::with_capacity(3);
    if let Some(url) = probe(http, &server).await {
        candidates.push(url);
    }
    for url in [
        well_known(&server, "oauth-protected-resource"),
        well_known(&origin(&server), "oauth-protected-resource"),
    ] {
        if !candidates.contains(&url) {
            candidates.push(url);
        }
    }

    let mut resource_metadata = None;
    for url in &candidates {
        if let Some(meta) = get_json::<ProtectedResourceMetadata>(http, url).await {
            resource_metadata = Some(meta);
            break;
        }
    }

    let (resource, issuer) = match resource_metadata {
        Some(meta) => {
            let issuer = meta
                .authorization_servers
                .first()
                .and_then(|s| Url::parse(s).ok())
                .unwrap_or_else(|| origin(&server));
            (meta.resource, issuer)
        }
        None => (None, origin(&server)),
    };
    debug!(issuer = %issuer, "Resolved authorization server");

    let metadata = match get_json::<AuthorizationServerMetadata>(
        http,
        &well_known(&issuer, "oauth-authorization-server"),
    )
    .await
    {
        Some(meta) => meta,
        None => get_json(http, &openid_configuration(&issuer))
            .await
            .ok_or_else(|| {
                McpError::DiscoveryFailed(format!("No authorization server metadata at {issuer}"))
            })?,
    };

    let (Some(authorization_endpoint), Some(token_endpoint)) =
        (metadata.authorization_endpoint, metadata.token_endpoint)
    else {
        return Err(McpError::DiscoveryFailed(format!(
            "Authorization server {issuer} does not advertise authorization and token endpoints"
        )));
    };

    let mut discovery = AuthDiscovery {
        authorization_endpoint,
        token_endpoint,
        registration_endpoint: metadata.registration_endpoint,
        issuer: metadata.issuer,
        resource,
        scopes_supported: metadata.scopes_supported,
        ..Default::default()
    };

    if options.client_id.is_none() {
        if let Some(endpoint) = discovery.registration_endpoint.clone() {
            match register_client(http, &endpoint, &options).await {
                Ok(registered) => {
                    info!(endpoint = %endpoint, "Registered OAuth client");
                    discovery.client_id = Some(registered.client_id);
                    discovery.client_secret = registered.client_secret;
                    discovery.registration_access_token = registered.registration_access_token;
                }
                Err(e) => warn!(endpoint = %endpoint, error = %e, "Dynamic client registration failed"),
            }
        }
    }

    Ok(discovery)
}

/// POST `initialize` and look for a resource metadata pointer on 401.
async fn probe(http: &Client, server: &Url) -> Option<Url> {
    let body = Request::initialize(0);
    let response = match http
        .post(server.as_str())
        .header("Accept", "application/json, text/event-stream")
        .json(&body)
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            debug!(error = %e, "Discovery probe failed");
            return None;
        }
    };

    if response.status() != StatusCode::UNAUTHORIZED {
        return None;
    }
    response
        .headers()
        .get_all("www-authenticate")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(resource_metadata_param)
        .and_then(|u| Url::parse(&u).ok())
}

/// Extract `resource_metadata` from a `WWW-Authenticate` value.
fn resource_metadata_param(header: &str) -> Option<String> {
    let start = header.find("resource_metadata=")? + "resource_metadata=".len();
    let rest = &header[start..];
    let value = match rest.strip_prefix('"') {
        Some(quoted) => quoted.split('"').next()?,
        None => rest.split([',', ' ']).next()?,
    };
    (!value.is_empty()).then(|| value.to_string())
}

async fn get_json<T: serde::de::DeserializeOwned>(http: &Client, url: &Url) -> Option<T> {
    let response = http
        .get(url.as_str())
        .header("Accept", "application/json")
        .send()
        .await
        .ok()?;
    if !response.status().is_success() {
        debug!(url = %url, status = %response.status(), "Metadata not available");
        return None;
    }
    match response.json().await {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(url = %url, error = %e, "Malformed metadata document");
            None
        }
    }
}

async fn register_client(
    http: &Client,
    endpoint: &str,
    options: &DiscoveryOptions<'_>,
) -> McpResult<RegistrationResponse> {
    let metadata = json!({
        "client_name": options.client_name,
        "redirect_uris": [options.redirect_uri],
        "grant_types": ["authorization_code", "refresh_token"],
        "response_types": ["code"],
        "token_endpoint_auth_method": "none",
    });

    let response = http
        .post(endpoint)
        .json(&metadata)
        .send()
        .await
        .map_err(|e| McpError::RegistrationFailed(e.to_string()))?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return Err(McpError::RegistrationFailed(format!("{status}: {text}")));
    }

    response
        .json()
        .await
        .map_err(|e| McpError::RegistrationFailed(format!("Invalid registration response: {e}")))
}

fn origin(url: &Url) -> Url {
    let mut origin = url.clone();
    origin.set_path("/");
    origin.set_query(None);
    origin.set_fragment(None);
    origin
}

/// RFC 8414 style: the well-known segment goes before the issuer path.
fn well_known(base: &Url, suffix: &str) -> Url {
    let path = base.path().trim_end_matches('/');
    let mut url = origin(base);
    url.set_path(&format!("/.well-known/{suffix}{path}"));
    url
}

/// OpenID style: the well-known segment is appended to the issuer.
fn openid_configuration(issuer: &Url) -> Url {
    let path = issuer.path().trim_end_matches('/');
    let mut url = origin(issuer);
    url.set_path(&format!("{path}/.well-known/openid-configuration"));
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn options() -> DiscoveryOptions<'static> {
        DiscoveryOptions {
            redirect_uri: "http://127.0.0.1:19876/mcp/oauth/callback",
            client_name: "Conduit",
            client_id: None,
        }
    }

    #[test]
    fn test_resource_metadata_param() {
        assert_eq!(
            resource_metadata_param(
                r#"Bearer error="invalid_token", resource_metadata="https://x.example/.well-known/oauth-protected-resource""#
            )
            .as_deref(),
            Some("https://x.example/.well-known/oauth-protected-resource")
        );
        assert_eq!(
            resource_metadata_param("Bearer resource_metadata=https://y.example/m, realm=x").as_deref(),
            Some("https://y.example/m")
        );
        assert!(resource_metadata_param("Bearer realm=\"api\"").is_none());
    }

    #[test]
    fn test_well_known_urls() {
        let issuer = Url::parse("https://auth.example.com/tenant/").unwrap();
        assert_eq!(
            well_known(&issuer, "oauth-authorization-server").as_str(),
            "https://auth.example.com/.well-known/oauth-authorization-server/tenant"
        );
        assert_eq!(
            openid_configuration(&issuer).as_str(),
            "https://auth.example.com/tenant/.well-known/openid-configuration"
        );

        let root = Url::parse("https://auth.example.com").unwrap();
        assert_eq!(
            well_known(&root, "oauth-protected-resource").as_str(),
            "https://auth.example.com/.well-known/oauth-protected-resource"
        );
    }

    #[tokio::test]
    async fn test_full_discovery_with_registration() {
        let server = MockServer::start().await;
        let base = server.uri();

        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(401).insert_header(
                "WWW-Authenticate",
                format!(r#"Bearer resource_metadata="{base}/meta/resource""#).as_str(),
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/meta/resource"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "resource": format!("{base}/mcp"),
                "authorization_servers": [format!("{base}/auth")]
            })))
            .mount(&server)
            .await;
        // RFC 8414 location is missing, OpenID location answers.
        Mock::given(method("GET"))
            .and(path("/auth/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "issuer": format!("{base}/auth"),
                "authorization_endpoint": format!("{base}/auth/authorize"),
                "token_endpoint": format!("{base}/auth/token"),
                "registration_endpoint": format!("{base}/auth/register"),
                "scopes_supported": ["mcp"]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/register"))
            .and(body_partial_json(json!({
                "client_name": "Conduit",
                "token_endpoint_auth_method": "none",
                "redirect_uris": ["http://127.0.0.1:19876/mcp/oauth/callback"]
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "client_id": "dyn-client",
                "registration_access_token": "rat"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let found = discover(&Client::new(), &format!("{base}/mcp"), options())
            .await
            .unwrap();
        assert_eq!(found.authorization_endpoint, format!("{base}/auth/authorize"));
        assert_eq!(found.token_endpoint, format!("{base}/auth/token"));
        assert_eq!(found.resource, Some(format!("{base}/mcp")));
        assert_eq!(found.client_id.as_deref(), Some("dyn-client"));
        assert_eq!(found.registration_access_token.as_deref(), Some("rat"));
        assert_eq!(found.scopes_supported, vec!["mcp"]);
    }

    #[tokio::test]
    async fn test_registration_failure_is_not_fatal() {
        let server = MockServer::start().await;
        let base = server.uri();

        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-authorization-server"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "authorization_endpoint": format!("{base}/authorize"),
                "token_endpoint": format!("{base}/token"),
                "registration_endpoint": format!("{base}/register")
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/register"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let found = discover(&Client::new(), &format!("{base}/mcp"), options())
            .await
            .unwrap();
        assert_eq!(found.token_endpoint, format!("{base}/token"));
        assert!(found.client_id.is_none());
    }

    #[tokio::test]
    async fn test_configured_client_skips_registration() {
        let server = MockServer::start().await;
        let base = server.uri();

        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-authorization-server"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "authorization_endpoint": format!("{base}/authorize"),
                "token_endpoint": format!("{base}/token"),
                "registration_endpoint": format!("{base}/register")
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/register"))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&server)
            .await;

        let found = discover(
            &Client::new(),
            &format!("{base}/mcp"),
            DiscoveryOptions {
                client_id: Some("preset"),
                ..options()
            },
        )
        .await
        .unwrap();
        assert!(found.client_id.is_none());
    }

    #[tokio::test]
    async fn test_no_metadata_fails() {
        let server = MockServer::start().await;
        let err = discover(&Client::new(), &format!("{}/mcp", server.uri()), options())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::DiscoveryFailed(_)));
    }
}
