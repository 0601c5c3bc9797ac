//! Sensitive-path denylist and query-string probe detection

use once_cell::sync::Lazy;

/// Probe targets flagged when no custom list is configured.
/// A trailing `*` turns the entry into a prefix pattern.
pub static DEFAULT_SENSITIVE_PATHS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        // === Dotfiles & VCS ===
        "/.env*", "/.git*", "/.svn*", "/.hg*", "/.aws*", "/.ssh*",
        "/.htaccess", "/.htpasswd", "/.ds_store", "/.docker*", "/.vscode*",

        // === Admin panels ===
        "/admin*", "/administrator*", "/phpmyadmin*", "/pma*", "/myadmin*",
        "/wp-admin*", "/wp-login.php", "/wp-config.php*", "/xmlrpc.php",
        "/server-status", "/server-info",

        // === Config & credentials ===
        "/config*", "/configuration.php", "/settings.php", "/web.config",
        "/credentials*", "/secrets*", "/id_rsa*",

        // === Dumps & backups ===
        "/backup*", "/dump.sql", "/database.sql", "/db.sql",

        // === Webshells & exploit kits ===
        "/shell*", "/cgi-bin*", "/vendor/phpunit*", "/actuator*", "/boaform*",
    ]
});

/// Query-string fragments of common SQL injection attempts
static SQL_INJECTION_FRAGMENTS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "union select",
        "drop table",
        "insert into",
        "delete from",
        "' or '1'='1",
    ]
});

/// A single denylist entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPattern {
    /// Path must match exactly
    Exact(String),
    /// Path must start with this prefix
    Prefix(String),
}

impl PathPattern {
    /// Parse a configured pattern; blank entries yield `None`
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        let pattern = match raw.strip_suffix('*') {
            Some(prefix) => PathPattern::Prefix(normalize_path(prefix)),
            None => PathPattern::Exact(normalize_path(raw)),
        };
        Some(pattern)
    }

    fn matches(&self, normalized: &str) -> bool {
        match self {
            PathPattern::Exact(p) => normalized == p,
            PathPattern::Prefix(p) => normalized.starts_with(p.as_str()),
        }
    }

    fn as_display(&self) -> String {
        match self {
            PathPattern::Exact(p) => p.clone(),
            PathPattern::Prefix(p) => format!("{}*", p),
        }
    }
}

/// Result of classifying a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestCheck {
    /// Ordinary traffic
    Normal,
    /// Request counts as a violation
    Probe(ProbeReason),
}

impl RequestCheck {
    #[cfg(test)]
    pub fn is_probe(&self) -> bool {
        matches!(self, RequestCheck::Probe(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeReason {
    /// Path hit a denylist pattern
    SensitivePath(String),
    /// Query string carried an injection fragment
    SqlInjection(&'static str),
}

impl ProbeReason {
    pub fn message(&self) -> String {
        match self {
            ProbeReason::SensitivePath(p) => format!("sensitive path matched '{}'", p),
            ProbeReason::SqlInjection(f) => format!("query contains '{}'", f),
        }
    }
}

/// Classifies requests against the configured denylist
#[derive(Debug, Clone)]
pub struct ProbeClassifier {
    patterns: Vec<PathPattern>,
    detect_sql_injection: bool,
}

impl ProbeClassifier {
    pub fn new<S: AsRef<str>>(patterns: &[S], detect_sql_injection: bool) -> Self {
        Self {
            patterns: patterns
                .iter()
                .filter_map(|p| PathPattern::parse(p.as_ref()))
                .collect(),
            detect_sql_injection,
        }
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    /// Check a request path (and optional raw query string)
    pub fn check(&self, path: &str, query: Option<&str>) -> RequestCheck {
        let normalized = normalize_path(path);

        if let Some(pattern) = self.patterns.iter().find(|p| p.matches(&normalized)) {
            return RequestCheck::Probe(ProbeReason::SensitivePath(pattern.as_display()));
        }

        if self.detect_sql_injection {
            if let Some(fragment) = query.and_then(find_sql_injection) {
                return RequestCheck::Probe(ProbeReason::SqlInjection(fragment));
            }
        }

        RequestCheck::Normal
    }
}

impl Default for ProbeClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_SENSITIVE_PATHS.as_slice(), true)
    }
}

/// Lowercase, collapse empty and `.` segments, resolve `..` (root stays "/")
fn normalize_path(path: &str) -> String {
    let lowered = path.trim().to_ascii_lowercase();
    let mut segments: Vec<&str> = Vec::new();
    for segment in lowered.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    format!("/{}", segments.join("/"))
}

/// Scan a raw query string, decoded as form data, for injection fragments
fn find_sql_injection(query: &str) -> Option<&'static str> {
    let decoded: String = url::form_urlencoded::parse(query.as_bytes())
        .flat_map(|(k, v)| [k.into_owned(), v.into_owned()])
        .collect::<Vec<_>>()
        .join("&")
        .to_lowercase();

    SQL_INJECTION_FRAGMENTS
        .iter()
        .copied()
        .find(|fragment| decoded.contains(fragment))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_probe_paths() {
        let classifier = ProbeClassifier::default();
        assert!(classifier.check("/.env", None).is_probe());
        assert!(classifier.check("/.env.production", None).is_probe());
        assert!(classifier.check("/.git/config", None).is_probe());
        assert!(classifier.check("/phpmyadmin", None).is_probe());
        assert!(classifier.check("/wp-login.php", None).is_probe());
        assert!(classifier.check("/backup/site.tar.gz", None).is_probe());
    }

    #[test]
    fn test_normal_paths() {
        let classifier = ProbeClassifier::default();
        assert_eq!(classifier.check("/", None), RequestCheck::Normal);
        assert_eq!(classifier.check("/api/v1/health", None), RequestCheck::Normal);
        assert_eq!(classifier.check("/api/v1/cases/", Some("title=contract")), RequestCheck::Normal);
        assert_eq!(classifier.check("/api/v1/auth/register", None), RequestCheck::Normal);
    }

    #[test]
    fn test_case_and_trailing_slash() {
        let classifier = ProbeClassifier::default();
        assert!(classifier.check("/.ENV", None).is_probe());
        assert!(classifier.check("/PhpMyAdmin/", None).is_probe());
        assert!(classifier.check("/.htaccess/", None).is_probe());
    }

    #[test]
    fn test_dot_and_double_slash_segments() {
        let classifier = ProbeClassifier::default();
        assert!(classifier.check("//.env", None).is_probe());
        assert!(classifier.check("/./.env", None).is_probe());
        assert!(classifier.check("/api/../.git/config", None).is_probe());
        assert!(classifier.check("/static//..//admin", None).is_probe());
        assert!(!classifier.check("//api//v1//health", None).is_probe());
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("/../.."), "/");
        assert_eq!(normalize_path("//A//b/./c/"), "/a/b/c");
        assert_eq!(normalize_path("no-slash"), "/no-slash");
    }

    #[test]
    fn test_exact_vs_prefix() {
        let classifier = ProbeClassifier::new(&["/secret.txt", "/private*"], false);
        assert_eq!(classifier.pattern_count(), 2);

        assert!(classifier.check("/secret.txt", None).is_probe());
        assert!(!classifier.check("/secret.txt.bak", None).is_probe());
        assert!(classifier.check("/private", None).is_probe());
        assert!(classifier.check("/private/keys", None).is_probe());
        assert!(!classifier.check("/public", None).is_probe());
    }

    #[test]
    fn test_reason_names_pattern() {
        let classifier = ProbeClassifier::new(&["/.env*"], false);
        match classifier.check("/.env.local", None) {
            RequestCheck::Probe(reason) => {
                assert_eq!(reason, ProbeReason::SensitivePath("/.env*".to_string()));
                assert!(reason.message().contains("/.env*"));
            }
            RequestCheck::Normal => panic!("expected probe"),
        }
    }

    #[test]
    fn test_blank_patterns_ignored() {
        let classifier = ProbeClassifier::new(&["", "  ", "/x"], false);
        assert_eq!(classifier.pattern_count(), 1);
    }

    #[test]
    fn test_sql_injection_query() {
        let classifier = ProbeClassifier::default();
        assert_eq!(
            classifier.check("/api/v1/cases/", Some("title=%27+OR+%271%27%3D%271")),
            RequestCheck::Probe(ProbeReason::SqlInjection("' or '1'='1"))
        );
        assert!(classifier
            .check("/api/v1/users", Some("q=1 UNION SELECT password FROM users"))
            .is_probe());
    }

    #[test]
    fn test_sql_injection_detection_toggle() {
        let classifier = ProbeClassifier::new(DEFAULT_SENSITIVE_PATHS.as_slice(), false);
        assert!(!classifier
            .check("/api/v1/cases/", Some("title=' OR '1'='1"))
            .is_probe());
    }
}
