//! URL normalization rule table.
//!
//! Rules are evaluated in order and the first match wins. The function is total:
//! anything that fails to parse is reported as [`ReasonCode::Invalid`] and left as-is.

use url::{Host, Position, Url};

use crate::{NormalizationOutcome, ReasonCode};

/// Upload subdirectories that may appear without their `/uploads/` prefix.
pub const KNOWN_UPLOAD_DIRS: [&str; 3] = ["avatars", "community", "analysis"];

struct Unparseable;

struct CanonicalOrigin {
    url: Url,
    serialized: String,
}

impl CanonicalOrigin {
    fn parse(origin: &str) -> Result<Self, Unparseable> {
        let url = Url::parse(origin.trim()).map_err(|_| Unparseable)?;
        if url.host().is_none() {
            return Err(Unparseable);
        }
        let serialized = url.origin().ascii_serialization();
        if serialized == "null" {
            return Err(Unparseable);
        }
        Ok(Self { url, serialized })
    }

    fn uploads(&self, directory: &str, name: &str) -> String {
        format!("{}/uploads/{}/{}", self.serialized, directory, name)
    }

    /// Same host, or both hosts are loopback aliases of one another.
    fn matches_host(&self, candidate: &Url) -> bool {
        match (candidate.host(), self.url.host()) {
            (Some(a), Some(b)) => a == b || (is_loopback(&a) && is_loopback(&b)),
            _ => false,
        }
    }

    fn matches_port(&self, candidate: &Url) -> bool {
        candidate.scheme() == self.url.scheme()
            && candidate.port_or_known_default() == self.url.port_or_known_default()
    }
}

fn is_loopback(host: &Host<&str>) -> bool {
    match host {
        Host::Domain(domain) => domain.eq_ignore_ascii_case("localhost"),
        Host::Ipv4(ip) => ip.is_loopback() || ip.is_unspecified(),
        Host::Ipv6(ip) => ip.is_loopback() || ip.is_unspecified(),
    }
}

fn has_http_scheme(value: &str) -> bool {
    let prefix = value.get(..8).unwrap_or(value).to_ascii_lowercase();
    prefix.starts_with("http://") || prefix.starts_with("https://")
}

fn known_upload_dir(value: &str) -> bool {
    KNOWN_UPLOAD_DIRS.iter().any(|dir| {
        value
            .strip_prefix(dir)
            .is_some_and(|rest| rest.starts_with('/'))
    })
}

/// Classify and rewrite one URL toward `canonical_origin`.
///
/// `default_directory` names the upload subdirectory used for bare filenames and
/// legacy `/images/` paths (e.g. `avatars` for avatar fields).
pub fn normalize(
    raw: &str,
    default_directory: &str,
    canonical_origin: &str,
) -> NormalizationOutcome {
    match classify(raw, default_directory, canonical_origin) {
        Ok(Some((resolved, reason))) => NormalizationOutcome::rewritten(raw, resolved, reason),
        Ok(None) => NormalizationOutcome::unchanged(raw, ReasonCode::None),
        Err(Unparseable) => NormalizationOutcome::unchanged(raw, ReasonCode::Invalid),
    }
}

fn classify(
    raw: &str,
    default_directory: &str,
    canonical_origin: &str,
) -> Result<Option<(String, ReasonCode)>, Unparseable> {
    let value = raw.trim();
    if value.is_empty() {
        return Ok(None);
    }

    let origin = CanonicalOrigin::parse(canonical_origin)?;
    let directory = default_directory.trim_matches('/');

    if has_http_scheme(value) {
        let url = Url::parse(value).map_err(|_| Unparseable)?;
        if url.host().is_none() {
            return Err(Unparseable);
        }
        if origin.matches_host(&url) && !origin.matches_port(&url) {
            let rewritten = format!("{}{}", origin.serialized, &url[Position::BeforePath..]);
            return Ok(Some((rewritten, ReasonCode::PortRewrite)));
        }
        return Ok(None);
    }

    if value.starts_with("//") {
        let rewritten = format!("{}:{}", origin.url.scheme(), value);
        return Ok(Some((rewritten, ReasonCode::ProtocolNormalized)));
    }

    if value.starts_with("/uploads/") {
        return Ok(Some((
            format!("{}{}", origin.serialized, value),
            ReasonCode::RelativeToAbsolute,
        )));
    }

    if value.starts_with("uploads/") {
        return Ok(Some((
            format!("{}/{}", origin.serialized, value),
            ReasonCode::RelativeToAbsolute,
        )));
    }

    if known_upload_dir(value) {
        return Ok(Some((
            format!("{}/uploads/{}", origin.serialized, value),
            ReasonCode::UploadsPrefixAdded,
        )));
    }

    if let Some(name) = value.strip_prefix("/images/") {
        return Ok(Some((origin.uploads(directory, name), ReasonCode::UploadsPrefixAdded)));
    }

    if !value.contains('/') {
        return Ok(Some((origin.uploads(directory, value), ReasonCode::UploadsPrefixAdded)));
    }

    if value.starts_with('/') {
        return Ok(Some((
            format!("{}{}", origin.serialized, value),
            ReasonCode::RelativeToAbsolute,
        )));
    }

    Ok(Some((
        format!("{}/{}", origin.serialized, value),
        ReasonCode::RelativeToAbsolute,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ORIGIN: &str = "http://localhost:5000";

    fn check(raw: &str, dir: &str, resolved: &str, reason: ReasonCode) {
        let out = normalize(raw, dir, ORIGIN);
        assert_eq!(out.resolved_value, resolved, "input {raw:?}");
        assert_eq!(out.reason_code, reason, "input {raw:?}");
        assert_eq!(out.changed, resolved != raw, "input {raw:?}");
    }

    #[test]
    fn rewrites_loopback_port() {
        check(
            "http://localhost:4000/uploads/a.png",
            "analysis",
            "http://localhost:5000/uploads/a.png",
            ReasonCode::PortRewrite,
        );
        check(
            "http://127.0.0.1:3000/uploads/avatars/b.png?v=2",
            "avatars",
            "http://localhost:5000/uploads/avatars/b.png?v=2",
            ReasonCode::PortRewrite,
        );
    }

    #[test]
    fn leaves_foreign_hosts_alone() {
        check(
            "https://cdn.example.com/x.png",
            "avatars",
            "https://cdn.example.com/x.png",
            ReasonCode::None,
        );
        check(
            "http://localhost:5000/uploads/a.png",
            "avatars",
            "http://localhost:5000/uploads/a.png",
            ReasonCode::None,
        );
    }

    #[test]
    fn blank_input_is_untouched() {
        check("", "avatars", "", ReasonCode::None);
        check("   ", "avatars", "   ", ReasonCode::None);
    }

    #[test]
    fn protocol_relative_gets_canonical_scheme() {
        check(
            "//img.example.com/a.png",
            "community",
            "http://img.example.com/a.png",
            ReasonCode::ProtocolNormalized,
        );
    }

    #[test]
    fn relative_upload_paths_become_absolute() {
        check(
            "/uploads/community/a.png",
            "community",
            "http://localhost:5000/uploads/community/a.png",
            ReasonCode::RelativeToAbsolute,
        );
        check(
            "uploads/community/a.png",
            "community",
            "http://localhost:5000/uploads/community/a.png",
            ReasonCode::RelativeToAbsolute,
        );
        check(
            "/static/a.png",
            "community",
            "http://localhost:5000/static/a.png",
            ReasonCode::RelativeToAbsolute,
        );
        check(
            "static/a.png",
            "community",
            "http://localhost:5000/static/a.png",
            ReasonCode::RelativeToAbsolute,
        );
    }

    #[test]
    fn upload_prefix_is_added() {
        check(
            "avatars/pic.jpg",
            "avatars",
            "http://localhost:5000/uploads/avatars/pic.jpg",
            ReasonCode::UploadsPrefixAdded,
        );
        check(
            "pic.jpg",
            "community",
            "http://localhost:5000/uploads/community/pic.jpg",
            ReasonCode::UploadsPrefixAdded,
        );
        check(
            "/images/legacy.png",
            "analysis",
            "http://localhost:5000/uploads/analysis/legacy.png",
            ReasonCode::UploadsPrefixAdded,
        );
    }

    #[test]
    fn malformed_absolute_urls_are_invalid() {
        for raw in ["http://", "http://exa mple.com/x.png", "http://localhost:99999/a.png"] {
            let out = normalize(raw, "avatars", ORIGIN);
            assert_eq!(out.reason_code, ReasonCode::Invalid, "input {raw:?}");
            assert_eq!(out.resolved_value, raw);
            assert!(!out.changed);
        }
    }

    #[test]
    fn unusable_origin_is_invalid() {
        let out = normalize("pic.jpg", "avatars", "not an origin");
        assert_eq!(out.reason_code, ReasonCode::Invalid);
        assert!(!out.changed);
    }

    #[test]
    fn canonical_output_is_stable() {
        for (raw, dir) in [
            ("http://localhost:4000/uploads/a.png", "analysis"),
            ("avatars/pic.jpg", "avatars"),
            ("pic.jpg", "community"),
            ("/images/legacy.png", "analysis"),
            ("/uploads/x.png", "community"),
        ] {
            let first = normalize(raw, dir, ORIGIN);
            assert!(first.changed);
            let second = normalize(&first.resolved_value, dir, ORIGIN);
            assert!(!second.changed, "second pass rewrote {:?}", first.resolved_value);
            assert_eq!(second.reason_code, ReasonCode::None);
        }
    }

    proptest! {
        #[test]
        fn normalize_is_total(raw in ".*", dir in "[a-z]{0,8}") {
            let out = normalize(&raw, &dir, ORIGIN);
            prop_assert_eq!(out.changed, out.resolved_value != raw);
        }

        #[test]
        fn normalize_is_total_on_url_shaped_input(
            scheme in "(http|https|HTTP|ftp)?",
            sep in "(://|//|/|)",
            rest in "[a-zA-Z0-9:./\\[\\]@%?#_ -]{0,40}",
        ) {
            let raw = format!("{scheme}{sep}{rest}");
            let out = normalize(&raw, "avatars", ORIGIN);
            prop_assert_eq!(out.changed, out.resolved_value != raw);
            if out.reason_code == ReasonCode::Invalid {
                prop_assert!(!out.changed);
            }
        }
    }
}
