//! In-process registry v2 server for tests.
//!
//! Serves manifests and blobs from memory on `127.0.0.1:{random port}` over
//! plain HTTP. Optionally requires bearer-token authentication, issuing a
//! token from `/token` in exchange for Basic credentials whose password is
//! the configured secret. Failures can be injected for retry tests.

use crate::digest::sha256_digest;
use crate::manifest::{RawManifest, OCI_MANIFEST};
use crate::BLOB_UNKNOWN_MESSAGE;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex};
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};

const ISSUED_TOKEN: &str = "fake-registry-token";
const SERVICE: &str = "fake-registry";

/// A registry served from memory. Drop it to stop the server.
pub struct FakeRegistry {
    /// `127.0.0.1:{port}`, as used in image references.
    pub host: String,
    /// `http://127.0.0.1:{port}`.
    pub url: String,
    state: Arc<State>,
    server: Arc<Server>,
    _handle: std::thread::JoinHandle<()>,
}

struct State {
    url: String,
    token_secret: Option<String>,
    manifests: Mutex<HashMap<(String, String), (String, Vec<u8>)>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    uploads: Mutex<HashMap<String, String>>,
    failures: Mutex<(u32, String)>,
    requests: Mutex<Vec<String>>,
}

impl FakeRegistry {
    /// Start an anonymous registry.
    pub fn start() -> Self {
        Self::spawn(None)
    }

    /// Start a registry that requires a bearer token obtained with `secret`.
    pub fn start_with_token(secret: &str) -> Self {
        Self::spawn(Some(secret.to_owned()))
    }

    fn spawn(token_secret: Option<String>) -> Self {
        let server =
            Arc::new(Server::http("127.0.0.1:0").expect("failed to bind fake registry"));
        let port = server.server_addr().to_ip().expect("not an IP addr").port();
        let host = format!("127.0.0.1:{port}");
        let url = format!("http://{host}");

        let state = Arc::new(State {
            url: url.clone(),
            token_secret,
            manifests: Mutex::new(HashMap::new()),
            blobs: Mutex::new(HashMap::new()),
            uploads: Mutex::new(HashMap::new()),
            failures: Mutex::new((0, String::new())),
            requests: Mutex::new(Vec::new()),
        });

        let srv = Arc::clone(&server);
        let st = Arc::clone(&state);
        let handle = std::thread::spawn(move || {
            for request in srv.incoming_requests() {
                st.handle(request);
            }
        });

        Self {
            host,
            url,
            state,
            server,
            _handle: handle,
        }
    }

    /// Push an OCI image built from `layers` and tag it. Returns the manifest
    /// digest.
    pub fn seed_image(&self, repository: &str, tag: &str, layers: &[&[u8]]) -> String {
        let config = br#"{"architecture":"amd64","os":"linux"}"#;
        let config_digest = self.seed_blob(config);
        let layer_descriptors: Vec<serde_json::Value> = layers
            .iter()
            .map(|layer| {
                serde_json::json!({
                    "mediaType": "application/vnd.oci.image.layer.v1.tar",
                    "digest": self.seed_blob(layer),
                    "size": layer.len(),
                })
            })
            .collect();
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST,
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": config_digest,
                "size": config.len(),
            },
            "layers": layer_descriptors,
        });
        let data = serde_json::to_vec(&manifest).expect("serializable manifest");
        self.state.store_manifest(repository, tag, OCI_MANIFEST, data)
    }

    pub fn seed_blob(&self, data: &[u8]) -> String {
        let digest = sha256_digest(data);
        self.state
            .blobs
            .lock()
            .unwrap()
            .insert(digest.clone(), data.to_vec());
        digest
    }

    /// Manifest bytes stored under a tag or digest.
    pub fn manifest(&self, repository: &str, reference: &str) -> Option<Vec<u8>> {
        self.state
            .manifests
            .lock()
            .unwrap()
            .get(&(repository.to_owned(), reference.to_owned()))
            .map(|(_, data)| data.clone())
    }

    pub fn has_blob(&self, digest: &str) -> bool {
        self.state.blobs.lock().unwrap().contains_key(digest)
    }

    /// Answer the next `count` registry API requests with HTTP 500 carrying
    /// `message`.
    pub fn fail_next(&self, count: u32, message: &str) {
        *self.state.failures.lock().unwrap() = (count, message.to_owned());
    }

    /// `METHOD /path` of every request served so far.
    pub fn requests(&self) -> Vec<String> {
        self.state.requests.lock().unwrap().clone()
    }
}

impl Drop for FakeRegistry {
    fn drop(&mut self) {
        self.server.unblock();
    }
}

impl State {
    fn store_manifest(
        &self,
        repository: &str,
        reference: &str,
        media_type: &str,
        data: Vec<u8>,
    ) -> String {
        let digest = sha256_digest(&data);
        let mut manifests = self.manifests.lock().unwrap();
        let entry = (media_type.to_owned(), data);
        manifests.insert((repository.to_owned(), digest.clone()), entry.clone());
        manifests.insert((repository.to_owned(), reference.to_owned()), entry);
        digest
    }

    fn take_failure(&self) -> Option<String> {
        let mut failures = self.failures.lock().unwrap();
        if failures.0 == 0 {
            return None;
        }
        failures.0 -= 1;
        Some(failures.1.clone())
    }

    fn authorized(&self, req: &Request) -> bool {
        if self.token_secret.is_none() {
            return true;
        }
        let expected = format!("Bearer {ISSUED_TOKEN}");
        header_value(req, "Authorization").is_some_and(|v| v == expected)
    }

    fn handle(&self, req: Request) {
        let method = req.method().clone();
        let url = req.url().to_owned();
        let (path, query) = url.split_once('?').unwrap_or((url.as_str(), ""));
        self.requests
            .lock()
            .unwrap()
            .push(format!("{method} {path}"));

        if path == "/token" {
            return self.issue_token(req);
        }
        if !self.authorized(&req) {
            let challenge = format!(r#"Bearer realm="{}/token",service="{SERVICE}""#, self.url);
            return respond_error(
                req,
                401,
                "UNAUTHORIZED",
                "authentication required",
                vec![header("WWW-Authenticate", &challenge)],
            );
        }
        if path == "/v2/" || path == "/v2" {
            return respond(req, 200, b"{}".to_vec(), vec![json_header()]);
        }
        if let Some(message) = self.take_failure() {
            return respond_error(req, 500, "UNKNOWN", &message, Vec::new());
        }

        let Some(rest) = path.strip_prefix("/v2/") else {
            return respond_error(req, 404, "NOT_FOUND", "no such route", Vec::new());
        };
        if let Some((repository, reference)) = rest.rsplit_once("/manifests/") {
            let (repository, reference) = (repository.to_owned(), reference.to_owned());
            self.manifests_route(req, &method, &repository, &reference);
        } else if let Some((repository, id)) = rest.split_once("/blobs/uploads/") {
            let (repository, id) = (repository.to_owned(), id.to_owned());
            let digest = query
                .split('&')
                .find_map(|kv| kv.strip_prefix("digest="))
                .map(|d| d.replace("%3A", ":"));
            self.uploads_route(req, &method, &repository, &id, digest.as_deref());
        } else if let Some((_, digest)) = rest.rsplit_once("/blobs/") {
            let digest = digest.to_owned();
            self.blobs_route(req, &method, &digest);
        } else {
            respond_error(req, 404, "NOT_FOUND", "no such route", Vec::new());
        }
    }

    fn issue_token(&self, req: Request) {
        let Some(secret) = &self.token_secret else {
            return respond_error(req, 404, "NOT_FOUND", "no token service", Vec::new());
        };
        let password = header_value(&req, "Authorization")
            .and_then(|v| v.strip_prefix("Basic ").map(str::to_owned))
            .and_then(|encoded| STANDARD.decode(encoded).ok())
            .and_then(|decoded| String::from_utf8(decoded).ok())
            .and_then(|creds| creds.split_once(':').map(|(_, p)| p.to_owned()));
        if password.as_deref() == Some(secret.as_str()) {
            let body = serde_json::json!({ "token": ISSUED_TOKEN }).to_string();
            respond(req, 200, body.into_bytes(), vec![json_header()]);
        } else {
            respond_error(req, 401, "DENIED", "bad credentials", Vec::new());
        }
    }

    fn manifests_route(&self, mut req: Request, method: &Method, repository: &str, reference: &str) {
        match method {
            Method::Get | Method::Head => {
                let found = self
                    .manifests
                    .lock()
                    .unwrap()
                    .get(&(repository.to_owned(), reference.to_owned()))
                    .cloned();
                match found {
                    Some((media_type, data)) => {
                        let digest = sha256_digest(&data);
                        respond(
                            req,
                            200,
                            data,
                            vec![
                                header("Content-Type", &media_type),
                                header("Docker-Content-Digest", &digest),
                            ],
                        );
                    }
                    None => respond_error(
                        req,
                        404,
                        "MANIFEST_UNKNOWN",
                        "manifest unknown",
                        Vec::new(),
                    ),
                }
            }
            Method::Put => {
                let media_type = header_value(&req, "Content-Type")
                    .unwrap_or_else(|| OCI_MANIFEST.to_owned());
                let data = read_body(&mut req);
                let missing = RawManifest::new(media_type.clone(), data.clone())
                    .references()
                    .map(|refs| {
                        let blobs = self.blobs.lock().unwrap();
                        refs.blobs.into_iter().any(|b| !blobs.contains_key(&b))
                    });
                match missing {
                    Ok(false) => {
                        let digest = self.store_manifest(repository, reference, &media_type, data);
                        respond(
                            req,
                            201,
                            Vec::new(),
                            vec![header("Docker-Content-Digest", &digest)],
                        );
                    }
                    Ok(true) => respond_error(
                        req,
                        400,
                        "BLOB_UNKNOWN",
                        BLOB_UNKNOWN_MESSAGE,
                        Vec::new(),
                    ),
                    Err(e) => respond_error(
                        req,
                        400,
                        "MANIFEST_INVALID",
                        &e.to_string(),
                        Vec::new(),
                    ),
                }
            }
            _ => respond_error(req, 405, "UNSUPPORTED", "method not allowed", Vec::new()),
        }
    }

    fn uploads_route(
        &self,
        mut req: Request,
        method: &Method,
        repository: &str,
        id: &str,
        digest: Option<&str>,
    ) {
        match (method, id.is_empty()) {
            (Method::Post, true) => {
                let mut uploads = self.uploads.lock().unwrap();
                let id = format!("upload-{}", uploads.len() + 1);
                uploads.insert(id.clone(), repository.to_owned());
                let location = format!("/v2/{repository}/blobs/uploads/{id}");
                respond(req, 202, Vec::new(), vec![header("Location", &location)]);
            }
            (Method::Put, false) => {
                if !self.uploads.lock().unwrap().contains_key(id) {
                    return respond_error(
                        req,
                        404,
                        "BLOB_UPLOAD_UNKNOWN",
                        "upload unknown",
                        Vec::new(),
                    );
                }
                let data = read_body(&mut req);
                let actual = sha256_digest(&data);
                if digest != Some(actual.as_str()) {
                    return respond_error(
                        req,
                        400,
                        "DIGEST_INVALID",
                        "provided digest did not match uploaded content",
                        Vec::new(),
                    );
                }
                self.blobs.lock().unwrap().insert(actual.clone(), data);
                respond(
                    req,
                    201,
                    Vec::new(),
                    vec![header("Docker-Content-Digest", &actual)],
                );
            }
            _ => respond_error(req, 405, "UNSUPPORTED", "method not allowed", Vec::new()),
        }
    }

    fn blobs_route(&self, req: Request, method: &Method, digest: &str) {
        let found = self.blobs.lock().unwrap().get(digest).cloned();
        match (method, found) {
            (Method::Head, Some(_)) => respond(req, 200, Vec::new(), Vec::new()),
            (Method::Get, Some(data)) => respond(
                req,
                200,
                data,
                vec![header("Content-Type", "application/octet-stream")],
            ),
            (Method::Head | Method::Get, None) => {
                respond_error(req, 404, "BLOB_UNKNOWN", BLOB_UNKNOWN_MESSAGE, Vec::new());
            }
            _ => respond_error(req, 405, "UNSUPPORTED", "method not allowed", Vec::new()),
        }
    }
}

fn header(name: &str, value: &str) -> Header {
    Header::from_bytes(name, value).expect("valid header")
}

fn json_header() -> Header {
    header("Content-Type", "application/json")
}

fn header_value(req: &Request, name: &str) -> Option<String> {
    req.headers()
        .iter()
        .find(|h| h.field.to_string().eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str().to_owned())
}

fn read_body(req: &mut Request) -> Vec<u8> {
    let mut body = Vec::new();
    let _ = req.as_reader().read_to_end(&mut body);
    body
}

fn respond(req: Request, status: u16, body: Vec<u8>, headers: Vec<Header>) {
    let mut response = Response::from_data(body).with_status_code(StatusCode(status));
    for h in headers {
        response.add_header(h);
    }
    let _ = req.respond(response);
}

fn respond_error(req: Request, status: u16, code: &str, message: &str, headers: Vec<Header>) {
    let body = serde_json::json!({
        "errors": [{ "code": code, "message": message }]
    })
    .to_string();
    let mut headers = headers;
    headers.push(json_header());
    respond(req, status, body.into_bytes(), headers);
}
