use crate::context::RegistryContext;
use crate::manifest::{accept_header, RawManifest};
use crate::{ImageRepository, RegistryError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::HashMap;
use std::io::Read;
use std::sync::{Mutex, PoisonError};
use tracing::debug;
use ureq::http::Response;
use ureq::Body;

/// Registry v2 (OCI distribution) client for one registry host.
///
/// The first request probes `GET /v2/` to pick the scheme and learn the
/// authentication challenge. Bearer tokens are fetched per repository and
/// cached until the registry answers 401.
pub struct HttpRegistry {
    host: String,
    context: RegistryContext,
    agent: ureq::Agent,
    endpoint: Mutex<Option<Endpoint>>,
    tokens: Mutex<HashMap<String, String>>,
}

#[derive(Debug, Clone)]
struct Endpoint {
    base: String,
    challenge: Challenge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Challenge {
    Anonymous,
    Basic,
    Bearer { realm: String, service: String },
}

impl HttpRegistry {
    pub fn new(host: &str, context: RegistryContext) -> Result<Self, RegistryError> {
        let host = host.trim().trim_end_matches('/');
        if host.is_empty() {
            return Err(RegistryError::Config("registry host must not be empty".to_owned()));
        }
        Ok(Self {
            host: host.to_owned(),
            agent: build_agent(&context),
            context,
            endpoint: Mutex::new(None),
            tokens: Mutex::new(HashMap::new()),
        })
    }

    fn endpoint(&self) -> Result<Endpoint, RegistryError> {
        if let Some(endpoint) = self
            .endpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Ok(endpoint);
        }
        let endpoint = self.probe()?;
        *self.endpoint.lock().unwrap_or_else(PoisonError::into_inner) = Some(endpoint.clone());
        Ok(endpoint)
    }

    fn probe(&self) -> Result<Endpoint, RegistryError> {
        let schemes: &[&str] = if self.context.plain_http {
            &["http"]
        } else if self.context.insecure_skip_tls_verify {
            &["https", "http"]
        } else {
            &["https"]
        };

        let mut last_error = None;
        for scheme in schemes {
            let base = format!("{scheme}://{}", self.host);
            let url = format!("{base}/v2/");
            debug!("GET {url}");
            let response = match self.agent.get(&url).call() {
                Ok(r) => r,
                Err(e) => {
                    debug!("probe of {url} failed: {e}");
                    last_error = Some(RegistryError::Http(format!("failed to reach {url}: {e}")));
                    continue;
                }
            };
            let challenge = match response.status().as_u16() {
                200 => Challenge::Anonymous,
                401 => {
                    let header = response
                        .headers()
                        .get("www-authenticate")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default();
                    parse_challenge(header)
                }
                code => {
                    return Err(RegistryError::Http(format!(
                        "HTTP {code} from {url} (expected 200 or 401)"
                    )));
                }
            };
            debug!("{} speaks {scheme}, auth {challenge:?}", self.host);
            return Ok(Endpoint { base, challenge });
        }
        Err(last_error
            .unwrap_or_else(|| RegistryError::Http(format!("no scheme to probe {}", self.host))))
    }

    fn basic_auth(&self) -> Option<String> {
        self.context.credentials.as_ref().map(|c| {
            let encoded = STANDARD.encode(format!("{}:{}", c.username, c.password));
            format!("Basic {encoded}")
        })
    }

    fn authorization(
        &self,
        endpoint: &Endpoint,
        repository: &str,
    ) -> Result<Option<String>, RegistryError> {
        match &endpoint.challenge {
            Challenge::Anonymous => Ok(None),
            Challenge::Basic => Ok(self.basic_auth()),
            Challenge::Bearer { realm, service } => {
                if let Some(token) = self
                    .tokens
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(repository)
                {
                    return Ok(Some(format!("Bearer {token}")));
                }
                let token = self.fetch_token(realm, service, repository)?;
                let header = format!("Bearer {token}");
                self.tokens
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(repository.to_owned(), token);
                Ok(Some(header))
            }
        }
    }

    fn fetch_token(
        &self,
        realm: &str,
        service: &str,
        repository: &str,
    ) -> Result<String, RegistryError> {
        let url = if service.is_empty() {
            format!("{realm}?scope=repository:{repository}:pull,push")
        } else {
            format!("{realm}?service={service}&scope=repository:{repository}:pull,push")
        };
        debug!("GET {url}");
        let mut request = self.agent.get(&url);
        if let Some(basic) = self.basic_auth() {
            request = request.header("Authorization", &basic);
        }
        let response = request
            .call()
            .map_err(|e| RegistryError::Http(format!("token request to {realm} failed: {e}")))?;
        let status = response.status().as_u16();
        let body = read_string(response)?;
        if status != 200 {
            return Err(RegistryError::Http(format!(
                "HTTP {status} from token endpoint {realm}: {body}"
            )));
        }
        let value: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| RegistryError::Http(format!("invalid token response: {e}")))?;
        value
            .get("token")
            .or_else(|| value.get("access_token"))
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| RegistryError::Http("token response missing 'token' field".to_owned()))
    }

    fn forget_token(&self, repository: &str) {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(repository);
    }

    fn url(endpoint: &Endpoint, repository: &str, tail: &str) -> String {
        format!("{}/v2/{repository}/{tail}", endpoint.base)
    }

    fn authorized<B>(
        request: ureq::RequestBuilder<B>,
        auth: Option<&str>,
    ) -> ureq::RequestBuilder<B> {
        match auth {
            Some(auth) => request.header("Authorization", auth),
            None => request,
        }
    }

    /// Pass 2xx responses through; turn anything else into an error carrying
    /// the response body.
    fn check(
        &self,
        response: Response<Body>,
        repository: &str,
        what: &str,
    ) -> Result<Response<Body>, RegistryError> {
        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            return Ok(response);
        }
        if status == 401 {
            self.forget_token(repository);
        }
        let body = read_string(response).unwrap_or_default();
        if status == 404 {
            return Err(RegistryError::NotFound(format!("{what}: {body}")));
        }
        Err(RegistryError::Http(format!("HTTP {status} for {what}: {body}")))
    }

    fn send_error(url: &str, e: &ureq::Error) -> RegistryError {
        RegistryError::Http(format!("{url}: {e}"))
    }
}

impl ImageRepository for HttpRegistry {
    fn name(&self) -> &str {
        &self.host
    }

    fn get_manifest(&self, repository: &str, reference: &str) -> Result<RawManifest, RegistryError> {
        let endpoint = self.endpoint()?;
        let auth = self.authorization(&endpoint, repository)?;
        let url = Self::url(&endpoint, repository, &format!("manifests/{reference}"));
        debug!("GET {url}");
        let request = self
            .agent
            .get(&url)
            .header("Accept", &accept_header(self.context.accept_legacy_manifests));
        let response = Self::authorized(request, auth.as_deref())
            .call()
            .map_err(|e| Self::send_error(&url, &e))?;
        let response = self.check(response, repository, &format!("GET {url}"))?;
        let media_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let data = read_bytes(response)?;
        Ok(RawManifest::from_served(media_type.as_deref(), data))
    }

    fn put_manifest(
        &self,
        repository: &str,
        reference: &str,
        manifest: &RawManifest,
    ) -> Result<(), RegistryError> {
        let endpoint = self.endpoint()?;
        let auth = self.authorization(&endpoint, repository)?;
        let url = Self::url(&endpoint, repository, &format!("manifests/{reference}"));
        debug!("PUT {url} ({} bytes)", manifest.data.len());
        let request = self
            .agent
            .put(&url)
            .header("Content-Type", &manifest.media_type);
        let response = Self::authorized(request, auth.as_deref())
            .send(manifest.data.as_slice())
            .map_err(|e| Self::send_error(&url, &e))?;
        self.check(response, repository, &format!("PUT {url}"))?;
        Ok(())
    }

    fn has_blob(&self, repository: &str, digest: &str) -> Result<bool, RegistryError> {
        let endpoint = self.endpoint()?;
        let auth = self.authorization(&endpoint, repository)?;
        let url = Self::url(&endpoint, repository, &format!("blobs/{digest}"));
        debug!("HEAD {url}");
        let response = Self::authorized(self.agent.head(&url), auth.as_deref())
            .call()
            .map_err(|e| Self::send_error(&url, &e))?;
        match response.status().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            _ => self
                .check(response, repository, &format!("HEAD {url}"))
                .map(|_| false),
        }
    }

    fn get_blob(&self, repository: &str, digest: &str) -> Result<Vec<u8>, RegistryError> {
        let endpoint = self.endpoint()?;
        let auth = self.authorization(&endpoint, repository)?;
        let url = Self::url(&endpoint, repository, &format!("blobs/{digest}"));
        debug!("GET {url}");
        let response = Self::authorized(self.agent.get(&url), auth.as_deref())
            .call()
            .map_err(|e| Self::send_error(&url, &e))?;
        let response = self.check(response, repository, &format!("GET {url}"))?;
        read_bytes(response)
    }

    fn put_blob(&self, repository: &str, digest: &str, data: &[u8]) -> Result<(), RegistryError> {
        let endpoint = self.endpoint()?;
        let auth = self.authorization(&endpoint, repository)?;

        let start_url = Self::url(&endpoint, repository, "blobs/uploads/");
        debug!("POST {start_url}");
        let response = Self::authorized(self.agent.post(&start_url), auth.as_deref())
            .send_empty()
            .map_err(|e| Self::send_error(&start_url, &e))?;
        let response = self.check(response, repository, &format!("POST {start_url}"))?;
        let location = response
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                RegistryError::Http(format!("upload to {start_url} returned no Location"))
            })?;
        let (location, same_origin) = resolve_upload_location(&endpoint.base, location);
        let separator = if location.contains('?') { '&' } else { '?' };
        let url = format!("{location}{separator}digest={digest}");
        let upload_auth = if same_origin {
            auth.as_deref()
        } else {
            debug!("upload location {location} is on another origin, sending no credentials");
            None
        };

        debug!("PUT {url} ({} bytes)", data.len());
        let request = self
            .agent
            .put(&url)
            .header("Content-Type", "application/octet-stream");
        let response = Self::authorized(request, upload_auth)
            .send(data)
            .map_err(|e| Self::send_error(&url, &e))?;
        self.check(response, repository, &format!("PUT {url}"))?;
        Ok(())
    }
}

fn build_agent(context: &RegistryContext) -> ureq::Agent {
    let mut config = ureq::Agent::config_builder().http_status_as_error(false);
    if let Some(timeout) = context.request_timeout {
        config = config.timeout_global(Some(timeout));
    }
    if context.insecure_skip_tls_verify {
        config = config.tls_config(
            ureq::tls::TlsConfig::builder()
                .disable_verification(true)
                .build(),
        );
    }
    config.build().into()
}

/// Absolute upload URL for a `Location` header, and whether it shares the
/// registry's origin (scheme, host and port).
fn resolve_upload_location(base: &str, location: &str) -> (String, bool) {
    if location.starts_with("http://") || location.starts_with("https://") {
        let same = origin(location).is_some_and(|o| o.eq_ignore_ascii_case(base));
        (location.to_owned(), same)
    } else {
        (format!("{base}{location}"), true)
    }
}

fn origin(url: &str) -> Option<&str> {
    let scheme_end = url.find("://")? + 3;
    let authority_len = url[scheme_end..]
        .find(['/', '?', '#'])
        .unwrap_or(url.len() - scheme_end);
    Some(&url[..scheme_end + authority_len])
}

fn read_bytes(response: Response<Body>) -> Result<Vec<u8>, RegistryError> {
    let mut data = Vec::new();
    response.into_body().into_reader().read_to_end(&mut data)?;
    Ok(data)
}

fn read_string(response: Response<Body>) -> Result<String, RegistryError> {
    let data = read_bytes(response)?;
    String::from_utf8(data).map_err(|e| RegistryError::Http(format!("non-UTF-8 response: {e}")))
}

/// Parse a `WWW-Authenticate` challenge.
fn parse_challenge(header: &str) -> Challenge {
    let header = header.trim();
    let Some((scheme, params)) = header.split_once(' ') else {
        return if header.eq_ignore_ascii_case("basic") {
            Challenge::Basic
        } else {
            Challenge::Anonymous
        };
    };
    if scheme.eq_ignore_ascii_case("basic") {
        return Challenge::Basic;
    }
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Challenge::Anonymous;
    }

    let mut realm = None;
    let mut service = String::new();
    for part in split_auth_params(params) {
        if let Some((key, value)) = part.split_once('=') {
            let value = value.trim().trim_matches('"');
            match key.trim() {
                "realm" => realm = Some(value.to_owned()),
                "service" => value.clone_into(&mut service),
                _ => {}
            }
        }
    }
    match realm {
        Some(realm) => Challenge::Bearer { realm, service },
        None => Challenge::Anonymous,
    }
}

/// Split comma-separated auth parameters, keeping quoted commas.
fn split_auth_params(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, ch) in s.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    if start < s.len() {
        parts.push(s[start..].trim());
    }
    parts
}
