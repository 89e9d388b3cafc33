//! Transport-qualified image locators.
//!
//! Grammar: `{transport}://{registry-or-empty}/{namespace}/{repo}[:{tag}|@{digest}]`.
//! `docker` names the direct registry protocol. Any other transport name must
//! belong to the virtual transport the locator was built against, and carries
//! an empty registry component (`objstore-loc://ns/app:tag`).

use crate::{RegistryError, TransportHandle, TransportResolver};
use std::fmt;

/// Prefix of a registry selector that routes through a virtual transport.
pub const VIRTUAL_ROUTE_MARKER: &str = "bsl://";
/// Transport name of the registry v2 protocol.
pub const DIRECT_TRANSPORT: &str = "docker";
/// Tag used when a locator carries neither tag nor digest.
pub const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFamily {
    Direct,
    Virtual,
}

#[derive(Clone)]
pub enum Transport {
    Direct,
    Virtual(TransportHandle),
}

impl Transport {
    pub fn family(&self) -> TransportFamily {
        match self {
            Self::Direct => TransportFamily::Direct,
            Self::Virtual(_) => TransportFamily::Virtual,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Direct => DIRECT_TRANSPORT,
            Self::Virtual(handle) => handle.name(),
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => f.write_str("Direct"),
            Self::Virtual(handle) => f.debug_tuple("Virtual").field(&handle.name()).finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Tag(String),
    Digest(String),
}

impl Reference {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Tag(s) | Self::Digest(s) => s,
        }
    }
}

/// Registry selector from an annotation: a literal host, or a virtual route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrySelector<'a> {
    Direct(&'a str),
    /// Storage-location key with the route marker stripped.
    Virtual(&'a str),
}

impl<'a> RegistrySelector<'a> {
    pub fn parse(selector: &'a str) -> Self {
        match selector.strip_prefix(VIRTUAL_ROUTE_MARKER) {
            Some(key) => Self::Virtual(key),
            None => Self::Direct(selector),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Locator {
    transport: Transport,
    registry: String,
    namespace: String,
    repository: String,
    reference: Option<Reference>,
}

impl Locator {
    /// Parse a locator string. `virtual_transport` is the only non-`docker`
    /// transport accepted.
    pub fn parse(
        input: &str,
        virtual_transport: Option<&TransportHandle>,
    ) -> Result<Self, RegistryError> {
        let (scheme, rest) = input
            .split_once("://")
            .ok_or_else(|| locator_err(input, "missing '<transport>://'"))?;

        let transport = if scheme == DIRECT_TRANSPORT {
            Transport::Direct
        } else {
            match virtual_transport {
                Some(handle) if handle.name() == scheme => Transport::Virtual(handle.clone()),
                _ => return Err(locator_err(input, &format!("unknown transport '{scheme}'"))),
            }
        };

        let rest = collapse_slashes(rest);
        let (registry, path) = match transport {
            Transport::Direct => {
                let (registry, path) = rest
                    .split_once('/')
                    .ok_or_else(|| locator_err(input, "missing repository path"))?;
                if registry.is_empty() || registry.chars().any(char::is_whitespace) {
                    return Err(locator_err(input, "invalid registry host"));
                }
                (registry.to_owned(), path)
            }
            Transport::Virtual(_) => (String::new(), rest.as_str()),
        };

        let (name, reference) = split_reference(path);
        let reference = match reference {
            Some(Reference::Tag(tag)) if !valid_tag(&tag) => {
                return Err(locator_err(input, &format!("invalid tag '{tag}'")));
            }
            Some(Reference::Digest(digest)) if !valid_digest(&digest) => {
                return Err(locator_err(input, &format!("invalid digest '{digest}'")));
            }
            other => other,
        };

        let (namespace, repository) = name
            .split_once('/')
            .ok_or_else(|| locator_err(input, "expected '<namespace>/<repository>'"))?;
        if !valid_path(namespace) {
            return Err(locator_err(input, &format!("invalid namespace '{namespace}'")));
        }
        if !valid_path(repository) {
            return Err(locator_err(input, &format!("invalid repository '{repository}'")));
        }

        Ok(Self {
            transport,
            registry,
            namespace: namespace.to_owned(),
            repository: repository.to_owned(),
            reference,
        })
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn family(&self) -> TransportFamily {
        self.transport.family()
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn reference(&self) -> Option<&Reference> {
        self.reference.as_ref()
    }

    pub fn tag(&self) -> Option<&str> {
        match &self.reference {
            Some(Reference::Tag(tag)) => Some(tag),
            _ => None,
        }
    }

    /// `namespace/repository`, as addressed inside a registry.
    pub fn repository_path(&self) -> String {
        format!("{}/{}", self.namespace, self.repository)
    }

    /// Tag or digest to fetch, defaulting to `latest`.
    pub fn reference_or_default(&self) -> Reference {
        self.reference
            .clone()
            .unwrap_or_else(|| Reference::Tag(DEFAULT_TAG.to_owned()))
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.transport.name())?;
        if !self.registry.is_empty() {
            write!(f, "{}/", self.registry)?;
        }
        write!(f, "{}/{}", self.namespace, self.repository)?;
        match &self.reference {
            Some(Reference::Tag(tag)) => write!(f, ":{tag}"),
            Some(Reference::Digest(digest)) => write!(f, "@{digest}"),
            None => Ok(()),
        }
    }
}

/// Inputs to [`build_locators`].
#[derive(Debug, Clone, Copy)]
pub struct LocatorRequest<'a> {
    /// Source reference with the internal registry path stripped.
    pub relative_path: &'a str,
    pub dest_namespace: &'a str,
    pub dest_repository: &'a str,
    pub dest_tag: Option<&'a str>,
    pub source_registry: Option<&'a str>,
    pub dest_registry: Option<&'a str>,
}

/// Build source and destination locators for one local image.
///
/// A missing selector is a configuration error; it is reported before any
/// transport is resolved.
pub fn build_locators(
    request: &LocatorRequest<'_>,
    transports: &dyn TransportResolver,
) -> Result<(Locator, Locator), RegistryError> {
    let source_selector = non_empty(request.source_registry).ok_or_else(|| {
        RegistryError::Config("no source registry configured for a local image".to_owned())
    })?;
    let dest_selector = non_empty(request.dest_registry).ok_or_else(|| {
        RegistryError::Config("no destination registry configured for a local image".to_owned())
    })?;

    let (src_prefix, src_transport) = resolve_selector(source_selector, transports)?;
    let (dest_prefix, dest_transport) = resolve_selector(dest_selector, transports)?;

    let relative = request.relative_path;
    let separator = if relative.starts_with('/') { "" } else { "/" };
    let source = format!("{src_prefix}{separator}{relative}");

    let mut dest = format!(
        "{dest_prefix}/{}/{}",
        request.dest_namespace, request.dest_repository
    );
    if let Some(tag) = request.dest_tag {
        dest.push(':');
        dest.push_str(tag);
    }

    let source = Locator::parse(&normalize(&source), src_transport.as_ref())?;
    let dest = Locator::parse(&normalize(&dest), dest_transport.as_ref())?;
    Ok((source, dest))
}

/// `{transport}://{registry}` for a selector, with the virtual handle if any.
fn resolve_selector(
    selector: &str,
    transports: &dyn TransportResolver,
) -> Result<(String, Option<TransportHandle>), RegistryError> {
    match RegistrySelector::parse(selector) {
        RegistrySelector::Direct(host) => Ok((format!("{DIRECT_TRANSPORT}://{host}"), None)),
        RegistrySelector::Virtual(key) => {
            let handle = transports.resolve(key)?;
            Ok((format!("{}://", handle.name()), Some(handle)))
        }
    }
}

/// Collapse the `///` an empty registry component leaves behind, and any
/// doubled separators in the path.
pub fn normalize(locator: &str) -> String {
    match locator.split_once("://") {
        Some((scheme, rest)) => format!("{scheme}://{}", collapse_slashes(rest)),
        None => collapse_slashes(locator),
    }
}

fn collapse_slashes(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn split_reference(path: &str) -> (&str, Option<Reference>) {
    if let Some((name, digest)) = path.split_once('@') {
        return (name, Some(Reference::Digest(digest.to_owned())));
    }
    let last_slash = path.rfind('/').unwrap_or(0);
    match path.rfind(':') {
        Some(colon) if colon > last_slash => {
            (&path[..colon], Some(Reference::Tag(path[colon + 1..].to_owned())))
        }
        _ => (path, None),
    }
}

fn valid_tag(tag: &str) -> bool {
    let mut chars = tag.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    tag.len() <= 128
        && (first.is_ascii_alphanumeric() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn valid_digest(digest: &str) -> bool {
    let Some((algorithm, encoded)) = digest.split_once(':') else {
        return false;
    };
    !algorithm.is_empty()
        && algorithm
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '+' | '.' | '_' | '-'))
        && !encoded.is_empty()
        && encoded
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '=' | '_' | '-'))
}

/// Slash-separated lowercase path components, each starting and ending with
/// an alphanumeric character.
fn valid_path(path: &str) -> bool {
    !path.is_empty()
        && path.split('/').all(|component| {
            let bytes = component.as_bytes();
            match (bytes.first(), bytes.last()) {
                (Some(first), Some(last)) => {
                    is_lower_alnum(*first)
                        && is_lower_alnum(*last)
                        && bytes
                            .iter()
                            .all(|b| is_lower_alnum(*b) || matches!(b, b'.' | b'_' | b'-'))
                }
                _ => false,
            }
        })
}

fn is_lower_alnum(b: u8) -> bool {
    b.is_ascii_lowercase() || b.is_ascii_digit()
}

fn locator_err(input: &str, reason: &str) -> RegistryError {
    RegistryError::Locator(format!("'{input}': {reason}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ImageRepository, RawManifest};
    use std::sync::{Arc, Mutex};

    struct NamedRepo(String);

    impl ImageRepository for NamedRepo {
        fn name(&self) -> &str {
            &self.0
        }
        fn get_manifest(&self, _: &str, r: &str) -> Result<RawManifest, RegistryError> {
            Err(RegistryError::NotFound(r.to_owned()))
        }
        fn put_manifest(&self, _: &str, _: &str, _: &RawManifest) -> Result<(), RegistryError> {
            Ok(())
        }
        fn has_blob(&self, _: &str, _: &str) -> Result<bool, RegistryError> {
            Ok(false)
        }
        fn get_blob(&self, _: &str, d: &str) -> Result<Vec<u8>, RegistryError> {
            Err(RegistryError::NotFound(d.to_owned()))
        }
        fn put_blob(&self, _: &str, _: &str, _: &[u8]) -> Result<(), RegistryError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Resolver {
        lookups: Mutex<Vec<String>>,
    }

    impl TransportResolver for Resolver {
        fn resolve(&self, location: &str) -> Result<TransportHandle, RegistryError> {
            self.lookups.lock().unwrap().push(location.to_owned());
            Ok(Arc::new(NamedRepo(format!("objstore-{location}"))))
        }
    }

    fn request<'a>(src: Option<&'a str>, dest: Option<&'a str>) -> LocatorRequest<'a> {
        LocatorRequest {
            relative_path: "/ns/app@sha256:aaa",
            dest_namespace: "ns",
            dest_repository: "app",
            dest_tag: Some("latest"),
            source_registry: src,
            dest_registry: dest,
        }
    }

    #[test]
    fn builds_direct_locators() {
        let resolver = Resolver::default();
        let (src, dest) =
            build_locators(&request(Some("internal.reg"), Some("migration.reg")), &resolver)
                .unwrap();
        assert_eq!(src.to_string(), "docker://internal.reg/ns/app@sha256:aaa");
        assert_eq!(dest.to_string(), "docker://migration.reg/ns/app:latest");
        assert_eq!(src.family(), TransportFamily::Direct);
        assert_eq!(src.reference(), Some(&Reference::Digest("sha256:aaa".to_owned())));
        assert_eq!(dest.tag(), Some("latest"));
        assert!(resolver.lookups.lock().unwrap().is_empty());
    }

    #[test]
    fn builds_virtual_destination_without_registry() {
        let resolver = Resolver::default();
        let (src, dest) =
            build_locators(&request(Some("internal.reg"), Some("bsl://default")), &resolver)
                .unwrap();
        assert_eq!(src.family(), TransportFamily::Direct);
        assert_eq!(dest.family(), TransportFamily::Virtual);
        assert_eq!(dest.to_string(), "objstore-default://ns/app:latest");
        assert_eq!(dest.registry(), "");
        assert_eq!(*resolver.lookups.lock().unwrap(), vec!["default".to_owned()]);
    }

    #[test]
    fn builds_virtual_source() {
        let resolver = Resolver::default();
        let (src, _) =
            build_locators(&request(Some("bsl://loc"), Some("restore.reg")), &resolver).unwrap();
        assert_eq!(src.to_string(), "objstore-loc://ns/app@sha256:aaa");
        assert_eq!(src.namespace(), "ns");
        assert_eq!(src.repository(), "app");
    }

    #[test]
    fn destination_matches_request_for_both_families() {
        let resolver = Resolver::default();
        for dest_registry in ["migration.reg", "bsl://loc"] {
            let mut req = request(Some("internal.reg"), Some(dest_registry));
            req.dest_namespace = "other-ns";
            req.dest_repository = "tools/app";
            req.dest_tag = Some("v1.2");
            let (_, dest) = build_locators(&req, &resolver).unwrap();
            assert_eq!(dest.namespace(), "other-ns");
            assert_eq!(dest.repository(), "tools/app");
            assert_eq!(dest.tag(), Some("v1.2"));
        }
    }

    #[test]
    fn untagged_destination() {
        let mut req = request(Some("internal.reg"), Some("migration.reg"));
        req.dest_tag = None;
        let (_, dest) = build_locators(&req, &Resolver::default()).unwrap();
        assert_eq!(dest.reference(), None);
        assert_eq!(dest.to_string(), "docker://migration.reg/ns/app");
        assert_eq!(dest.reference_or_default(), Reference::Tag("latest".to_owned()));
    }

    #[test]
    fn missing_selector_is_config_error() {
        let resolver = Resolver::default();
        for (src, dest) in [(None, Some("m")), (Some("i"), None), (Some(""), Some("m"))] {
            let err = build_locators(&request(src, dest), &resolver).unwrap_err();
            assert!(matches!(err, RegistryError::Config(_)), "{src:?} {dest:?}");
        }
        assert!(resolver.lookups.lock().unwrap().is_empty());
    }

    #[test]
    fn bad_destination_is_locator_error() {
        let resolver = Resolver::default();
        let mut req = request(Some("internal.reg"), Some("migration.reg"));
        req.dest_namespace = "";
        assert!(matches!(
            build_locators(&req, &resolver),
            Err(RegistryError::Locator(_))
        ));

        let mut req = request(Some("internal.reg"), Some("migration.reg"));
        req.dest_tag = Some("-bad");
        assert!(matches!(
            build_locators(&req, &resolver),
            Err(RegistryError::Locator(_))
        ));

        let mut req = request(Some("internal.reg"), Some("migration.reg"));
        req.relative_path = "/ns/App@sha256:aaa";
        assert!(matches!(
            build_locators(&req, &resolver),
            Err(RegistryError::Locator(_))
        ));
    }

    #[test]
    fn relative_path_without_leading_slash() {
        let mut req = request(Some("internal.reg:5000/"), Some("migration.reg"));
        req.relative_path = "ns/app:v1";
        let (src, _) = build_locators(&req, &Resolver::default()).unwrap();
        assert_eq!(src.to_string(), "docker://internal.reg:5000/ns/app:v1");
    }

    #[test]
    fn parse_round_trips_direct() {
        for s in [
            "docker://internal.reg:5000/ns/app@sha256:aaa",
            "docker://migration.reg/ns/app:latest",
            "docker://migration.reg/ns/group/app",
        ] {
            assert_eq!(Locator::parse(s, None).unwrap().to_string(), s);
        }
    }

    #[test]
    fn parse_round_trips_virtual() {
        let handle: TransportHandle = Arc::new(NamedRepo("objstore-loc".to_owned()));
        let parsed = Locator::parse("objstore-loc:///ns/app:v1", Some(&handle)).unwrap();
        assert_eq!(parsed.to_string(), "objstore-loc://ns/app:v1");
        let again = Locator::parse(&parsed.to_string(), Some(&handle)).unwrap();
        assert_eq!(again.to_string(), parsed.to_string());
    }

    #[test]
    fn parse_rejects_unknown_transport() {
        let err = Locator::parse("oci://ns/app:v1", None).unwrap_err();
        assert!(matches!(err, RegistryError::Locator(_)));
        assert!(Locator::parse("no-scheme/ns/app", None).is_err());
        assert!(Locator::parse("docker://host/app", None).is_err());
        assert!(Locator::parse("docker://host/ns/app@nodigest", None).is_err());
    }

    #[test]
    fn normalize_collapses_triple_slash() {
        assert_eq!(normalize("objstore-x:///ns/app"), "objstore-x://ns/app");
        assert_eq!(normalize("docker://host//ns/app"), "docker://host/ns/app");
    }

    #[test]
    fn selector_parse() {
        assert_eq!(RegistrySelector::parse("bsl://loc"), RegistrySelector::Virtual("loc"));
        assert_eq!(RegistrySelector::parse("reg:5000"), RegistrySelector::Direct("reg:5000"));
    }
}
