//! Maps raw container-runtime error text onto an [`ErrorCode`].
//!
//! The runtime only hands back a message string, so classification is a list
//! of substring/regex rules evaluated top to bottom. The first match wins.

use std::sync::OnceLock;

use regex::Regex;

use super::types::{ClassifiedError, ErrorCode};

struct Patterns {
    port: Regex,
    image: Regex,
    container_name: Regex,
    mount: Regex,
    image_in_use: Regex,
    manifest: Regex,
    bind: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        port: Regex::new(r"Bind for [^:]+:(\d+) failed: port is already allocated").unwrap(),
        image: Regex::new(r"No such image: (\S+)").unwrap(),
        container_name: Regex::new(r#"The container name "([^"]+)" is already in use"#).unwrap(),
        mount: Regex::new(r"The path (\S+) is not shared from the host").unwrap(),
        image_in_use: Regex::new(r"image (\S+) is being used by").unwrap(),
        manifest: Regex::new(r"manifest for (\S+) not found").unwrap(),
        bind: Regex::new(r"Error parsing Bind: (\S+)").unwrap(),
    })
}

fn capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn match_rules(subject: &str, raw: &str) -> Option<(ErrorCode, Option<String>)> {
    let p = patterns();

    if let Some(port) = capture(&p.port, raw) {
        return Some((
            ErrorCode::PortConflict,
            Some(format!("port {} is already in use", port)),
        ));
    }
    if raw.contains("No such image") {
        let detail = capture(&p.image, raw).map(|image| format!("image {} does not exist", image));
        return Some((ErrorCode::ImageNotFound, detail));
    }
    if raw.contains("Conflict. The container name") {
        let detail = capture(&p.container_name, raw)
            .map(|name| format!("container name {} is already in use", name));
        return Some((ErrorCode::ContainerNameConflict, detail));
    }
    if raw.contains("Mounts denied") {
        let detail = capture(&p.mount, raw)
            .map(|path| format!("mount path {} does not exist or is not accessible", path));
        return Some((ErrorCode::MountPathNotShared, detail));
    }
    if raw.contains("image is being used by") {
        let detail = capture(&p.image_in_use, raw)
            .map(|image| format!("image {} is being used by another container", image));
        return Some((ErrorCode::ImageInUse, detail));
    }
    if raw.contains("No such container") {
        return Some((
            ErrorCode::ContainerNotFound,
            Some(format!("container {} does not exist", subject)),
        ));
    }
    if raw.contains("is already running") {
        return Some((
            ErrorCode::ContainerAlreadyRunning,
            Some(format!("container {} is already running", subject)),
        ));
    }
    // bollard renders a 304 as "status code 304"
    if raw.contains("Status 304") || raw.contains("status code 304") {
        return Some((
            ErrorCode::ContainerAlreadyStopped,
            Some(format!("container {} is already stopped", subject)),
        ));
    }
    if raw.contains("manifest for") && raw.contains("not found") {
        let detail = capture(&p.manifest, raw).map(|image| format!("unable to pull image {}", image));
        return Some((ErrorCode::ImagePullFailed, detail));
    }
    if raw.contains("Invalid container config") {
        return Some((
            ErrorCode::InvalidConfig,
            Some(format!("container {} has an invalid configuration", subject)),
        ));
    }
    if raw.contains("Cannot connect to the Docker daemon") || raw.contains("Socket not found") {
        return Some((
            ErrorCode::DaemonUnavailable,
            Some("cannot connect to the Docker daemon".to_string()),
        ));
    }
    if raw.contains("Error parsing Bind") {
        let detail = capture(&p.bind, raw).map(|bind| format!("failed to parse bind mount: {}", bind));
        return Some((ErrorCode::BindParseError, detail));
    }
    None
}

/// Classify `raw` produced while performing `action` on `subject`.
///
/// The returned message always reads `"{action} failed: {detail}"`.
pub fn classify(action: &str, subject: &str, raw: &str) -> ClassifiedError {
    let (code, detail) = match match_rules(subject, raw) {
        Some((code, detail)) => (code, detail),
        None => (ErrorCode::Unknown, Some(raw.to_string())),
    };
    let detail = detail
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| code.default_message().to_string());

    ClassifiedError {
        code,
        message: format!("{} failed: {}", action, detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_conflict_extracts_port() {
        let err = classify(
            "Start container",
            "web1",
            "Bind for 0.0.0.0:8080 failed: port is already allocated",
        );
        assert_eq!(err.code, ErrorCode::PortConflict);
        assert!(err.message.contains("8080"));
        assert_eq!(err.message, "Start container failed: port 8080 is already in use");
    }

    #[test]
    fn image_not_found_uses_reference() {
        let err = classify("Create container", "web1", "No such image: nginx:9.9");
        assert_eq!(err.code, ErrorCode::ImageNotFound);
        assert_eq!(err.message, "Create container failed: image nginx:9.9 does not exist");
    }

    #[test]
    fn name_conflict() {
        let raw = r#"Conflict. The container name "/web1" is already in use by container "abc""#;
        let err = classify("Create container", "web1", raw);
        assert_eq!(err.code, ErrorCode::ContainerNameConflict);
        assert!(err.message.contains("/web1"));
    }

    #[test]
    fn manifest_rule_is_not_shadowed() {
        let raw = "manifest for redis:nope not found: manifest unknown";
        let err = classify("Pull image", "redis", raw);
        assert_eq!(err.code, ErrorCode::ImagePullFailed);
        assert_eq!(err.message, "Pull image failed: unable to pull image redis:nope");
    }

    #[test]
    fn container_rules_use_subject() {
        let err = classify("Stop container", "db", "No such container: db");
        assert_eq!(err.code, ErrorCode::ContainerNotFound);
        assert_eq!(err.message, "Stop container failed: container db does not exist");

        let err = classify(
            "Stop container",
            "db",
            "Docker responded with status code 304: ",
        );
        assert_eq!(err.code, ErrorCode::ContainerAlreadyStopped);
    }

    #[test]
    fn matched_rule_without_capture_falls_back_to_default() {
        let err = classify("Remove image", "x", "Error: image is being used by running container");
        assert_eq!(err.code, ErrorCode::ImageInUse);
        assert_eq!(
            err.message,
            format!("Remove image failed: {}", ErrorCode::ImageInUse.default_message())
        );
    }

    #[test]
    fn unknown_keeps_raw_message() {
        let err = classify("Rename container", "web1", "something odd happened");
        assert_eq!(err.code, ErrorCode::Unknown);
        assert_eq!(err.message, "Rename container failed: something odd happened");
    }

    #[test]
    fn daemon_and_bind_rules() {
        let err = classify(
            "List containers",
            "",
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock",
        );
        assert_eq!(err.code, ErrorCode::DaemonUnavailable);

        let err = classify("Create container", "web1", "Error parsing Bind: /a:/b:zz");
        assert_eq!(err.code, ErrorCode::BindParseError);
        assert!(err.message.ends_with("/a:/b:zz"));
    }
}
