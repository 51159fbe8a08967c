//! Explains why a copy-tool invocation failed.
//!
//! The copy tool logs `level=fatal msg="..."` before exiting non-zero. That
//! line is preferred; otherwise the combined output is scanned for keywords.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    AccessDenied,
    ManifestNotFound,
    AuthRequired,
    ConnectionRefused,
    Timeout,
    DnsFailure,
    Tls,
    RateLimited,
    DiskSpace,
}

impl FailureKind {
    pub fn describe(&self) -> &'static str {
        match self {
            FailureKind::AccessDenied => "access to the image was denied",
            FailureKind::ManifestNotFound => "image or tag does not exist",
            FailureKind::AuthRequired => "registry authentication failed",
            FailureKind::ConnectionRefused => "network connection was refused",
            FailureKind::Timeout => "network connection timed out",
            FailureKind::DnsFailure => "registry host name could not be resolved",
            FailureKind::Tls => "TLS certificate error",
            FailureKind::RateLimited => "registry rate limit reached",
            FailureKind::DiskSpace => "not enough disk space",
        }
    }
}

const KEYWORDS: &[(FailureKind, &[&str])] = &[
    (
        FailureKind::AccessDenied,
        &["requested access to the resource is denied", "access denied"],
    ),
    (FailureKind::ManifestNotFound, &["manifest unknown", "not found"]),
    (
        FailureKind::AuthRequired,
        &["unauthorized", "authentication required"],
    ),
    (
        FailureKind::ConnectionRefused,
        &["connection refused", "connection reset"],
    ),
    (FailureKind::Timeout, &["timeout", "deadline exceeded"]),
    (FailureKind::DnsFailure, &["no such host", "name resolution"]),
    (FailureKind::Tls, &["certificate", "tls", "ssl"]),
    (FailureKind::RateLimited, &["too many requests", "rate limit"]),
    (FailureKind::DiskSpace, &["no space left", "disk"]),
];

/// Keyword categorisation, first matching category wins.
pub fn categorize(output: &str) -> Option<FailureKind> {
    let lower = output.to_lowercase();
    KEYWORDS
        .iter()
        .find(|(_, needles)| needles.iter().any(|n| lower.contains(n)))
        .map(|(kind, _)| *kind)
}

/// Extract the quoted message of the first `level=fatal` record.
pub fn fatal_message(output: &str) -> Option<String> {
    let fatal = output.find("level=fatal")?;
    let rest = &output[fatal..];
    let start = rest.find("msg=\"")? + 5;

    let mut msg = String::new();
    let mut chars = rest[start..].chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => return Some(msg),
            '\\' => msg.push(chars.next()?),
            c => msg.push(c),
        }
    }
    None
}

fn analyze_fatal(msg: &str) -> Option<String> {
    let lower = msg.to_lowercase();

    let reason = if lower.contains("requested access to the resource is denied") {
        "access denied: the image may not exist or requires authentication"
    } else if lower.contains("reading manifest") && lower.contains("not found") {
        "manifest not found: the image or tag does not exist"
    } else if lower.contains("initializing source") && lower.contains("connection") {
        "failed to initialize the image source: network connection problem"
    } else if lower.contains("unauthorized") {
        "unauthorized: registry login required"
    } else if lower.contains("forbidden") {
        "forbidden: insufficient permissions"
    } else if lower.contains("timeout") {
        "operation timed out: network or registry is slow"
    } else if msg.len() < 100 {
        return Some(format!("copy tool error: {}", msg));
    } else {
        return None;
    };
    Some(reason.to_string())
}

/// Human readable reason for a failed copy, if one can be determined.
pub fn analyze(stderr: &str, stdout: &str) -> Option<String> {
    let combined = format!("{} {}", stderr, stdout);

    if let Some(reason) = fatal_message(&combined).and_then(|msg| analyze_fatal(&msg)) {
        return Some(reason);
    }
    categorize(&combined).map(|kind| kind.describe().to_string())
}
