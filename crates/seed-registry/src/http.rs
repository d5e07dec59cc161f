//! Docker Registry HTTP API v2 client (read-only).

use crate::{Credentials, RegistryConfig, RepositoryCatalog, TagLister, TagSet};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{LINK, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use seed_core::{Result, SeedError};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;

const DOCKER_HUB_HOST: &str = "docker.io";
const DOCKER_HUB_API: &str = "https://registry-1.docker.io";
const DOCKER_HUB_ALIASES: &[&str] = &[
    "docker.io",
    "index.docker.io",
    "registry-1.docker.io",
    "registry.hub.docker.com",
];
const MAX_PAGES: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEndpoint {
    /// Host used in image references (`localhost:5000`, `docker.io`).
    pub host: String,
    /// Base URL of the v2 API, without trailing slash.
    pub base_url: String,
}

/// Map a user-supplied registry (`host`, `host:port` or a URL) to the host
/// used in image names and the API base URL. Loopback registries default to
/// plain HTTP, everything else to HTTPS.
pub fn registry_endpoint(registry: &str) -> RegistryEndpoint {
    let trimmed = registry.trim();
    let (scheme, rest) = if let Some(rest) = trimmed.strip_prefix("https://") {
        (Some("https"), rest)
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        (Some("http"), rest)
    } else {
        (None, trimmed)
    };
    let host = rest.trim_end_matches('/');
    if host.is_empty() || DOCKER_HUB_ALIASES.contains(&host) {
        return RegistryEndpoint {
            host: DOCKER_HUB_HOST.to_string(),
            base_url: DOCKER_HUB_API.to_string(),
        };
    }
    let scheme = scheme.unwrap_or(
        if host.starts_with("localhost") || host.starts_with("127.0.0.1") {
            "http"
        } else {
            "https"
        },
    );
    RegistryEndpoint {
        host: host.to_string(),
        base_url: format!("{}://{}", scheme, host),
    }
}

/// A parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub scheme: String,
    pub params: BTreeMap<String, String>,
}

pub fn parse_challenge(header: &str) -> Option<Challenge> {
    let header = header.trim();
    let (scheme, rest) = header.split_once(' ').unwrap_or((header, ""));
    if scheme.is_empty() {
        return None;
    }
    let mut params = BTreeMap::new();
    let mut chars = rest.chars().peekable();
    loop {
        while matches!(chars.peek(), Some(c) if *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' {
                break;
            }
            key.push(c);
            chars.next();
        }
        if key.is_empty() || chars.next() != Some('=') {
            break;
        }
        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    _ => value.push(c),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
        }
        params.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
    }
    Some(Challenge {
        scheme: scheme.to_ascii_lowercase(),
        params,
    })
}

/// Target of the `rel="next"` entry of an RFC 5988 `Link` header.
fn next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        let is_next = params
            .split(';')
            .any(|p| p.trim().replace(' ', "") == "rel=\"next\"");
        if !is_next {
            return None;
        }
        let target = target.trim();
        target
            .strip_prefix('<')
            .and_then(|t| t.strip_suffix('>'))
            .map(str::to_string)
    })
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsPage {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct CatalogPage {
    #[serde(default)]
    repositories: Option<Vec<String>>,
}

pub struct HttpRegistry {
    endpoint: RegistryEndpoint,
    credentials: Option<Credentials>,
    client: Client,
}

impl HttpRegistry {
    pub fn new(config: &RegistryConfig) -> Result<Self> {
        let endpoint = registry_endpoint(&config.registry);
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SeedError::RegistryUnavailable {
                registry: endpoint.host.clone(),
                reason: format!("could not create HTTP client: {}", e),
            })?;
        Ok(Self {
            endpoint,
            credentials: config.credentials.clone(),
            client,
        })
    }

    pub fn endpoint(&self) -> &RegistryEndpoint {
        &self.endpoint
    }

    fn unavailable(&self, reason: impl Into<String>) -> SeedError {
        SeedError::RegistryUnavailable {
            registry: self.endpoint.host.clone(),
            reason: reason.into(),
        }
    }

    fn send(&self, request: RequestBuilder) -> Result<Response> {
        request.send().map_err(|e| self.unavailable(e.to_string()))
    }

    /// Docker Hub keeps official images under `library/`.
    fn api_repository(&self, repository: &str) -> String {
        if self.endpoint.host == DOCKER_HUB_HOST && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository.to_string()
        }
    }

    fn absolute(&self, target: &str) -> String {
        if target.starts_with("http://") || target.starts_with("https://") {
            target.to_string()
        } else {
            format!("{}{}", self.endpoint.base_url, target)
        }
    }

    /// GET `url`, answering one auth challenge. `Ok(None)` means 404.
    fn get(&self, url: &str, scope: &str) -> Result<Option<Response>> {
        let mut response = self.send(self.client.get(url))?;
        if response.status() == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_challenge);
            debug!(url, challenge = ?challenge, "registry requested authentication");
            let retry = self.authorize(self.client.get(url), challenge.as_ref(), scope)?;
            response = self.send(retry)?;
        }
        match response.status() {
            status if status.is_success() => Ok(Some(response)),
            StatusCode::NOT_FOUND => Ok(None),
            status @ (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) => {
                Err(self.unavailable(format!("authentication failed ({}) for {}", status, url)))
            }
            status => Err(self.unavailable(format!("unexpected status {} for {}", status, url))),
        }
    }

    fn authorize(
        &self,
        request: RequestBuilder,
        challenge: Option<&Challenge>,
        scope: &str,
    ) -> Result<RequestBuilder> {
        match challenge {
            Some(c) if c.scheme == "bearer" => {
                let token = self.fetch_token(c, scope)?;
                Ok(request.bearer_auth(token))
            }
            Some(c) if c.scheme != "basic" => Err(self.unavailable(format!(
                "unsupported authentication scheme '{}'",
                c.scheme
            ))),
            _ => match &self.credentials {
                Some(creds) => Ok(request.basic_auth(&creds.username, Some(&creds.password))),
                None => Err(self.unavailable(
                    "registry requires authentication; supply a username and password",
                )),
            },
        }
    }

    fn fetch_token(&self, challenge: &Challenge, scope: &str) -> Result<String> {
        let realm = challenge
            .params
            .get("realm")
            .ok_or_else(|| self.unavailable("bearer challenge without realm"))?;
        let mut query: Vec<(&str, &str)> = Vec::new();
        if let Some(service) = challenge.params.get("service") {
            query.push(("service", service.as_str()));
        }
        let scope = challenge
            .params
            .get("scope")
            .map(String::as_str)
            .unwrap_or(scope);
        query.push(("scope", scope));

        let mut request = self.client.get(realm.as_str()).query(&query);
        if let Some(creds) = &self.credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }
        let response = self.send(request)?;
        if !response.status().is_success() {
            return Err(self.unavailable(format!(
                "token request to {} returned {}",
                realm,
                response.status()
            )));
        }
        let body: TokenResponse = response
            .json()
            .map_err(|e| self.unavailable(format!("invalid token response: {}", e)))?;
        body.token
            .or(body.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| self.unavailable("token response carried no token"))
    }

    /// Every page of a paginated listing. `Ok(None)` when the first page is
    /// a 404.
    fn get_pages<T: DeserializeOwned>(&self, path: &str, scope: &str) -> Result<Option<Vec<T>>> {
        let mut pages = Vec::new();
        let mut next = Some(self.absolute(path));
        while let Some(url) = next.take() {
            let Some(response) = self.get(&url, scope)? else {
                if pages.is_empty() {
                    return Ok(None);
                }
                // A partial list would hide tags that exist.
                return Err(self.unavailable(format!(
                    "{} disappeared after {} page(s)",
                    url,
                    pages.len()
                )));
            };
            next = response
                .headers()
                .get(LINK)
                .and_then(|v| v.to_str().ok())
                .and_then(next_link)
                .map(|target| self.absolute(&target));
            let page: T = response
                .json()
                .map_err(|e| self.unavailable(format!("invalid response from {}: {}", url, e)))?;
            pages.push(page);
            if pages.len() >= MAX_PAGES && next.is_some() {
                return Err(self.unavailable(format!("more than {} pages from {}", MAX_PAGES, path)));
            }
        }
        Ok(Some(pages))
    }
}

impl TagLister for HttpRegistry {
    fn registry(&self) -> &str {
        &self.endpoint.host
    }

    fn list_tags(&self, repository: &str) -> Result<TagSet> {
        let repository = self.api_repository(repository);
        let path = format!("/v2/{}/tags/list", repository);
        let scope = format!("repository:{}:pull", repository);
        let tags: TagSet = match self.get_pages::<TagsPage>(&path, &scope)? {
            Some(pages) => pages
                .into_iter()
                .flat_map(|p| p.tags.unwrap_or_default())
                .collect(),
            None => TagSet::default(),
        };
        debug!(
            registry = %self.endpoint.host,
            repository = %repository,
            count = tags.len(),
            "listed registry tags"
        );
        Ok(tags)
    }
}

impl RepositoryCatalog for HttpRegistry {
    fn list_repositories(&self) -> Result<Vec<String>> {
        let pages = self
            .get_pages::<CatalogPage>("/v2/_catalog", "registry:catalog:*")?
            .unwrap_or_default();
        Ok(pages
            .into_iter()
            .flat_map(|p| p.repositories.unwrap_or_default())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;
    use tiny_http::{Header, Request, Response as HttpResponse, ResponseBox, Server};

    fn header(name: &str, value: &str) -> Header {
        Header::from_bytes(name.as_bytes(), value.as_bytes()).expect("header")
    }

    fn json_response(status: u16, body: &str) -> ResponseBox {
        HttpResponse::from_string(body)
            .with_status_code(status)
            .with_header(header("Content-Type", "application/json"))
            .boxed()
    }

    fn authorization(request: &Request) -> Option<String> {
        request
            .headers()
            .iter()
            .find(|h| h.field.equiv("Authorization"))
            .map(|h| h.value.as_str().to_string())
    }

    /// Serve requests until the server sits idle for half a second.
    fn serve<F>(handler: F) -> String
    where
        F: Fn(&Request, &str) -> ResponseBox + Send + 'static,
    {
        let server = Server::http("127.0.0.1:0").expect("bind");
        let addr = server.server_addr().to_ip().expect("ip listener");
        let base = format!("http://{}", addr);
        let base_for_thread = base.clone();
        thread::spawn(move || {
            while let Ok(Some(request)) = server.recv_timeout(Duration::from_millis(500)) {
                let response = handler(&request, &base_for_thread);
                let _ = request.respond(response);
            }
        });
        base
    }

    fn registry(base: &str, credentials: Option<Credentials>) -> HttpRegistry {
        HttpRegistry::new(&RegistryConfig {
            registry: base.to_string(),
            credentials,
            timeout: Duration::from_secs(5),
        })
        .expect("client")
    }

    #[test]
    fn endpoint_normalisation() {
        assert_eq!(
            registry_endpoint(""),
            RegistryEndpoint {
                host: "docker.io".into(),
                base_url: "https://registry-1.docker.io".into()
            }
        );
        assert_eq!(registry_endpoint("index.docker.io").host, "docker.io");
        assert_eq!(
            registry_endpoint("localhost:5000").base_url,
            "http://localhost:5000"
        );
        assert_eq!(
            registry_endpoint("registry.example.com/").base_url,
            "https://registry.example.com"
        );
        let explicit = registry_endpoint("http://10.0.0.5:5000");
        assert_eq!(explicit.host, "10.0.0.5:5000");
        assert_eq!(explicit.base_url, "http://10.0.0.5:5000");
    }

    #[test]
    fn challenge_parsing_handles_quoted_commas() {
        let c = parse_challenge(
            r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:org/foo:pull,push""#,
        )
        .expect("challenge");
        assert_eq!(c.scheme, "bearer");
        assert_eq!(c.params["realm"], "https://auth.example.com/token");
        assert_eq!(c.params["service"], "registry.example.com");
        assert_eq!(c.params["scope"], "repository:org/foo:pull,push");

        let basic = parse_challenge(r#"Basic realm="Registry Realm""#).expect("basic");
        assert_eq!(basic.scheme, "basic");
        assert_eq!(basic.params["realm"], "Registry Realm");
        assert!(parse_challenge("").is_none());
    }

    #[test]
    fn next_link_extraction() {
        assert_eq!(
            next_link(r#"</v2/foo/tags/list?n=2&last=b>; rel="next""#).as_deref(),
            Some("/v2/foo/tags/list?n=2&last=b")
        );
        assert_eq!(next_link(r#"</v2/foo>; rel="prev""#), None);
    }

    #[test]
    fn lists_tags_anonymously() {
        let base = serve(|request, _| {
            assert_eq!(request.url(), "/v2/org/foo-1.0.0-seed/tags/list");
            assert!(authorization(request).is_none());
            json_response(200, r#"{"name":"org/foo-1.0.0-seed","tags":["1.0.0","1.1.0"]}"#)
        });
        let tags = registry(&base, None)
            .list_tags("org/foo-1.0.0-seed")
            .expect("tags");
        assert!(tags.contains("1.0.0"));
        assert!(tags.contains("1.1.0"));
        assert_eq!(tags.len(), 2);
    }

    #[test]
    fn unknown_repository_is_an_empty_set() {
        let base = serve(|_, _| {
            json_response(404, r#"{"errors":[{"code":"NAME_UNKNOWN","message":"repository name not known to registry"}]}"#)
        });
        let tags = registry(&base, None).list_tags("org/missing").expect("empty");
        assert!(tags.is_empty());
    }

    #[test]
    fn null_tag_list_is_empty() {
        let base = serve(|_, _| json_response(200, r#"{"name":"org/foo","tags":null}"#));
        let tags = registry(&base, None).list_tags("org/foo").expect("empty");
        assert!(tags.is_empty());
    }

    #[test]
    fn follows_pagination_links() {
        let base = serve(|request, _| {
            if request.url().contains("last=") {
                json_response(200, r#"{"tags":["1.1.0"]}"#)
            } else {
                HttpResponse::from_string(r#"{"tags":["1.0.0"]}"#)
                    .with_header(header("Content-Type", "application/json"))
                    .with_header(header(
                        "Link",
                        r#"</v2/org/foo/tags/list?n=1&last=1.0.0>; rel="next""#,
                    ))
                    .boxed()
            }
        });
        let tags = registry(&base, None).list_tags("org/foo").expect("tags");
        assert_eq!(tags.iter().collect::<Vec<_>>(), vec!["1.0.0", "1.1.0"]);
    }

    #[test]
    fn missing_later_page_is_unavailable() {
        let base = serve(|request, _| {
            if request.url().contains("last=") {
                json_response(404, r#"{"errors":[{"code":"NAME_UNKNOWN"}]}"#)
            } else {
                HttpResponse::from_string(r#"{"tags":["1.0.0"]}"#)
                    .with_header(header("Content-Type", "application/json"))
                    .with_header(header(
                        "Link",
                        r#"</v2/org/foo/tags/list?n=1&last=1.0.0>; rel="next""#,
                    ))
                    .boxed()
            }
        });
        let err = registry(&base, None)
            .list_tags("org/foo")
            .expect_err("truncated listing");
        assert!(
            matches!(err, SeedError::RegistryUnavailable { .. }),
            "{}",
            err
        );
    }

    #[test]
    fn basic_challenge_uses_credentials() {
        let base = serve(|request, _| match authorization(request).as_deref() {
            Some("Basic YWxpY2U6c2VjcmV0") => json_response(200, r#"{"tags":["1.0.0"]}"#),
            _ => json_response(401, r#"{"errors":[]}"#)
                .with_header(header("WWW-Authenticate", r#"Basic realm="test""#))
                .boxed(),
        });
        let creds = Credentials::from_parts(Some("alice".into()), Some("secret".into()));
        let tags = registry(&base, creds).list_tags("org/foo").expect("tags");
        assert!(tags.contains("1.0.0"));
    }

    #[test]
    fn authentication_required_without_credentials_is_unavailable() {
        let base = serve(|_, _| {
            json_response(401, r#"{"errors":[]}"#)
                .with_header(header("WWW-Authenticate", r#"Basic realm="test""#))
                .boxed()
        });
        let err = registry(&base, None)
            .list_tags("org/foo")
            .expect_err("auth required");
        match err {
            SeedError::RegistryUnavailable { reason, .. } => {
                assert!(reason.contains("requires authentication"), "{}", reason)
            }
            other => panic!("expected registry unavailable, got {}", other),
        }
    }

    #[test]
    fn bearer_challenge_exchanges_token() {
        let base = serve(|request, base| {
            let url = request.url().to_string();
            if url.starts_with("/token") {
                assert!(url.contains("service=test-registry"), "{}", url);
                assert!(url.contains("scope=repository%3Aorg%2Ffoo%3Apull"), "{}", url);
                return json_response(200, r#"{"token":"abc123"}"#);
            }
            match authorization(request).as_deref() {
                Some("Bearer abc123") => json_response(200, r#"{"tags":["2.0.0"]}"#),
                _ => json_response(401, r#"{"errors":[]}"#)
                    .with_header(header(
                        "WWW-Authenticate",
                        &format!(
                            r#"Bearer realm="{}/token",service="test-registry",scope="repository:org/foo:pull""#,
                            base
                        ),
                    ))
                    .boxed(),
            }
        });
        let tags = registry(&base, None).list_tags("org/foo").expect("tags");
        assert!(tags.contains("2.0.0"));
    }

    #[test]
    fn unreachable_registry_is_unavailable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        let err = registry(&format!("http://{}", addr), None)
            .list_tags("org/foo")
            .expect_err("connection refused");
        assert!(
            matches!(err, SeedError::RegistryUnavailable { .. }),
            "{}",
            err
        );
    }

    #[test]
    fn server_errors_are_not_treated_as_empty() {
        let base = serve(|_, _| json_response(500, "{}"));
        let err = registry(&base, None)
            .list_tags("org/foo")
            .expect_err("500 is fatal");
        assert!(err.to_string().contains("500"), "{}", err);
    }

    #[test]
    fn catalog_lists_repositories() {
        let base = serve(|request, _| {
            assert_eq!(request.url(), "/v2/_catalog");
            json_response(200, r#"{"repositories":["org/foo-1.0.0-seed","org/bar","other/baz-2.0.0-seed"]}"#)
        });
        let repos = registry(&base, None).list_repositories().expect("catalog");
        assert_eq!(repos.len(), 3);
        assert_eq!(repos[0], "org/foo-1.0.0-seed");
    }
}
