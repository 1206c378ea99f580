//! Browser cookie exports to Netscape `cookies.txt`, and validation of
//! existing cookie jars before they are handed to the downloader.

use crate::{EngineError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

pub const NETSCAPE_HEADER: &str = "# Netscape HTTP Cookie File\n\
# This file was generated by Audio Workbench from a JSON export.\n";

const REPAIR_HEADER: &str = "# Netscape HTTP Cookie File\n\
# Added header by Audio Workbench to satisfy validators.\n";

const HTTP_ONLY_PREFIX: &str = "#HttpOnly_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieRecord {
    pub domain: String,
    pub path: String,
    pub secure: bool,
    pub expiry: i64,
    pub name: String,
    pub value: String,
    pub host_only: Option<bool>,
    pub http_only: bool,
}

impl CookieRecord {
    /// Reads one entry of a Cookie-Editor / EditThisCookie export. Returns
    /// `None` for malformed entries.
    pub fn from_json(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let text = |key: &str| obj.get(key).and_then(Value::as_str);

        let domain = text("domain")
            .filter(|d| !d.trim().is_empty())
            .or_else(|| text("host"))
            .map(str::trim)
            .filter(|d| !d.is_empty())?;
        let path = text("path").filter(|p| !p.is_empty()).unwrap_or("/");
        if has_control_chars(domain) || has_control_chars(path) {
            return None;
        }
        let name = text("name")?;

        let expiry = ["expirationDate", "expires"]
            .iter()
            .filter_map(|key| obj.get(*key).and_then(parse_expiry))
            .find(|v| *v != 0)
            .unwrap_or(0);

        Some(Self {
            domain: domain.to_string(),
            path: path.to_string(),
            secure: obj.get("secure").and_then(Value::as_bool).unwrap_or(false),
            expiry,
            name: name.to_string(),
            value: text("value").unwrap_or_default().to_string(),
            host_only: obj.get("hostOnly").and_then(Value::as_bool),
            http_only: obj.get("httpOnly").and_then(Value::as_bool).unwrap_or(false),
        })
    }

    /// The seven tab-separated jar fields for this record.
    pub fn netscape_line(&self) -> String {
        let (domain, include_subdomains) = match self.host_only {
            Some(true) => (self.domain.trim_start_matches('.').to_string(), false),
            Some(false) => {
                if self.domain.starts_with('.') {
                    (self.domain.clone(), true)
                } else {
                    (format!(".{}", self.domain), true)
                }
            }
            None => (self.domain.clone(), self.domain.starts_with('.')),
        };
        let domain_field = if self.http_only {
            format!("{HTTP_ONLY_PREFIX}{domain}")
        } else {
            domain
        };

        [
            domain_field,
            flag(include_subdomains).to_string(),
            self.path.clone(),
            flag(self.secure).to_string(),
            self.expiry.to_string(),
            escape_field(&self.name),
            escape_field(&self.value),
        ]
        .join("\t")
    }
}

/// Accepts a JSON array of cookies or an object with a `cookies` array.
/// Malformed entries are skipped.
pub fn parse_json_export(text: &str) -> Result<Vec<CookieRecord>> {
    let parsed: Value = serde_json::from_str(text)
        .map_err(|e| EngineError::CookieParseFailed(e.to_string()))?;
    let entries = match &parsed {
        Value::Array(items) => items,
        Value::Object(obj) => match obj.get("cookies") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(EngineError::CookieParseFailed(
                    "expected a `cookies` array".to_string(),
                ))
            }
        },
        _ => {
            return Err(EngineError::CookieParseFailed(
                "expected an array or an object with a `cookies` array".to_string(),
            ))
        }
    };

    let records: Vec<CookieRecord> = entries.iter().filter_map(CookieRecord::from_json).collect();
    let skipped = entries.len() - records.len();
    if skipped > 0 {
        debug!(skipped, "skipped malformed cookie records");
    }
    Ok(records)
}

pub fn convert_to_netscape(records: &[CookieRecord]) -> String {
    let mut out = String::from(NETSCAPE_HEADER);
    for record in records {
        out.push_str(&record.netscape_line());
        out.push('\n');
    }
    out
}

/// Converts a JSON export on disk to a Netscape jar at `out_txt`; returns
/// the number of cookies written.
pub fn convert_json_file(json_path: &Path, out_txt: &Path) -> Result<usize> {
    let bytes = std::fs::read(json_path)?;
    let records = parse_json_export(&String::from_utf8_lossy(&bytes))?;
    std::fs::write(out_txt, convert_to_netscape(&records))?;
    info!(
        count = records.len(),
        "converted JSON cookies -> {}",
        out_txt.display()
    );
    Ok(records.len())
}

#[derive(Debug, Clone, Serialize)]
pub struct CookieValidation {
    pub ok: bool,
    pub message: String,
    /// The jar to use; a repaired sibling when the header had to be added.
    pub path: PathBuf,
    pub repaired: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JarError {
    MissingHeader,
    BadLine { line: usize, detail: String },
}

impl std::fmt::Display for JarError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JarError::MissingHeader => f.write_str("does not look like a Netscape format cookies file"),
            JarError::BadLine { line, detail } => write!(f, "invalid line {line}: {detail}"),
        }
    }
}

/// Parses Netscape jar text and returns the number of cookies it holds.
pub fn parse_jar(text: &str) -> std::result::Result<usize, JarError> {
    let mut lines = text.lines();
    let magic = lines.next().unwrap_or_default();
    if !magic_re().is_match(magic) {
        return Err(JarError::MissingHeader);
    }

    let mut count = 0;
    for (idx, raw) in lines.enumerate() {
        let line_no = idx + 2;
        let mut line = raw.trim_end_matches(['\r', '\n']);
        if let Some(rest) = line.strip_prefix(HTTP_ONLY_PREFIX) {
            line = rest;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('$') {
            continue;
        }

        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 7 {
            return Err(JarError::BadLine {
                line: line_no,
                detail: format!("expected 7 tab-separated fields, found {}", fields.len()),
            });
        }
        let (domain, include_subdomains, expires) = (fields[0], fields[1], fields[4]);
        // Anything but TRUE reads as false.
        let include_subdomains = include_subdomains == "TRUE";
        if include_subdomains != domain.starts_with('.') {
            return Err(JarError::BadLine {
                line: line_no,
                detail: format!("include-subdomains flag disagrees with domain {domain:?}"),
            });
        }
        if !expires.is_empty() && expires.trim().parse::<i64>().is_err() {
            return Err(JarError::BadLine {
                line: line_no,
                detail: format!("expiry is not an integer: {expires:?}"),
            });
        }
        count += 1;
    }
    Ok(count)
}

/// Validates a Netscape jar. A jar that only lacks the header is repaired
/// into a `<name>.withheader` sibling; the original is left untouched.
pub fn validate(path: &Path) -> CookieValidation {
    let file_name = display_name(path);
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => return invalid(path, format!("Cookie file validation failed: {err}")),
    };
    let text = String::from_utf8_lossy(&bytes);

    match parse_jar(&text) {
        Ok(count) => CookieValidation {
            ok: true,
            message: format!("Loaded {count} cookies from {file_name}"),
            path: path.to_path_buf(),
            repaired: false,
        },
        Err(JarError::MissingHeader) => repair_missing_header(path, &text),
        Err(err) => invalid(path, format!("Cookie file validation failed: {err}")),
    }
}

fn repair_missing_header(path: &Path, text: &str) -> CookieValidation {
    let mut fixed_name = path.file_name().unwrap_or_default().to_os_string();
    fixed_name.push(".withheader");
    let fixed = path.with_file_name(fixed_name);

    let mut body = String::from(REPAIR_HEADER);
    body.push_str(text);
    if !text.ends_with('\n') {
        body.push('\n');
    }
    if let Err(err) = std::fs::write(&fixed, &body) {
        return invalid(path, format!("Cookie file validation failed: {err}"));
    }

    match parse_jar(&body) {
        Ok(count) => {
            warn!("cookie file missing header, repaired: {}", fixed.display());
            CookieValidation {
                ok: true,
                message: format!("Loaded {count} cookies from {}", display_name(&fixed)),
                path: fixed,
                repaired: true,
            }
        }
        Err(err) => {
            let _ = std::fs::remove_file(&fixed);
            invalid(path, format!("Cookie file validation failed: {err}"))
        }
    }
}

/// Where the downloader gets its cookies from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum CookieSource {
    #[default]
    None,
    /// A Netscape jar, or a JSON export when the extension is `.json`.
    File(PathBuf),
    Browser(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreparedCookies {
    None,
    File(PathBuf),
    Browser(String),
}

/// Resolves a cookie source into something the downloader can consume.
/// JSON exports are converted into `<working_dir>/cookies.txt`.
pub fn prepare_cookies(source: &CookieSource, working_dir: &Path) -> Result<PreparedCookies> {
    match source {
        CookieSource::None => Ok(PreparedCookies::None),
        CookieSource::Browser(name) => {
            let name = name.trim();
            if name.is_empty() || name.eq_ignore_ascii_case("none") {
                return Ok(PreparedCookies::None);
            }
            info!("using cookies from browser: {name}");
            Ok(PreparedCookies::Browser(name.to_string()))
        }
        CookieSource::File(path) => {
            let is_json = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
            if is_json {
                std::fs::create_dir_all(working_dir)?;
                let out = working_dir.join("cookies.txt");
                convert_json_file(path, &out)?;
                return Ok(PreparedCookies::File(out));
            }

            let validation = validate(path);
            if !validation.ok {
                return Err(EngineError::CookieFileInvalid {
                    path: path.clone(),
                    detail: validation.message,
                });
            }
            Ok(PreparedCookies::File(validation.path))
        }
    }
}

fn magic_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"#( Netscape)? HTTP Cookie File").expect("valid regex"))
}

fn invalid(path: &Path, message: String) -> CookieValidation {
    CookieValidation {
        ok: false,
        message,
        path: path.to_path_buf(),
        repaired: false,
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

fn parse_expiry(value: &Value) -> Option<i64> {
    let secs = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !secs.is_finite() {
        return None;
    }
    Some(secs.trunc() as i64)
}

fn escape_field(value: &str) -> String {
    value
        .replace('\t', "%09")
        .replace('\n', "%0A")
        .replace('\r', "%0D")
}

fn has_control_chars(value: &str) -> bool {
    value.chars().any(char::is_control)
}

fn flag(value: bool) -> &'static str {
    if value {
        "TRUE"
    } else {
        "FALSE"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(json: &str) -> Option<CookieRecord> {
        CookieRecord::from_json(&serde_json::from_str(json).expect("json"))
    }

    #[test]
    fn dot_domain_converts_to_subdomain_line() {
        let records = parse_json_export(
            r#"[{"domain":".example.com","path":"/","secure":true,"expirationDate":0,"name":"sid","value":"abc"}]"#,
        )
        .expect("parse");
        let text = convert_to_netscape(&records);
        assert!(text.starts_with(NETSCAPE_HEADER));
        let body: Vec<&str> = text.lines().filter(|l| !l.starts_with('#')).collect();
        assert_eq!(body, vec![".example.com\tTRUE\t/\tTRUE\t0\tsid\tabc"]);
    }

    #[test]
    fn host_only_flag_controls_leading_dot() {
        let host_only = record(r#"{"domain":".a.com","name":"n","value":"v","hostOnly":true}"#)
            .expect("record");
        assert!(host_only.netscape_line().starts_with("a.com\tFALSE\t/\t"));

        let shared = record(r#"{"domain":"a.com","name":"n","value":"v","hostOnly":false}"#)
            .expect("record");
        assert!(shared.netscape_line().starts_with(".a.com\tTRUE\t/\t"));

        let inferred = record(r#"{"domain":"a.com","name":"n","value":"v"}"#).expect("record");
        assert!(inferred.netscape_line().starts_with("a.com\tFALSE\t"));
    }

    #[test]
    fn http_only_and_escaping() {
        let rec = record(
            r#"{"domain":".a.com","name":"x\ty","value":"line1\nline2\r","httpOnly":true,"expires":"1700000000.9"}"#,
        )
        .expect("record");
        assert_eq!(
            rec.netscape_line(),
            "#HttpOnly_.a.com\tTRUE\t/\tFALSE\t1700000000\tx%09y\tline1%0Aline2%0D"
        );
    }

    #[test]
    fn malformed_records_are_skipped() {
        let records = parse_json_export(
            r#"{"cookies":[
                {"domain":"","name":"a","value":"1"},
                {"name":"b","value":"2"},
                {"domain":"ok.com","value":"3"},
                "not an object",
                {"domain":"bad\tdomain.com","name":"c","value":"4"},
                {"host":"fallback.com","path":"/x","name":"d","value":"5","expirationDate":"junk"}
            ]}"#,
        )
        .expect("parse");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].domain, "fallback.com");
        assert_eq!(records[0].path, "/x");
        assert_eq!(records[0].expiry, 0);

        let text = convert_to_netscape(&records);
        assert!(text.lines().count() <= records.len() + NETSCAPE_HEADER.lines().count());
    }

    #[test]
    fn non_array_export_is_rejected() {
        assert!(matches!(
            parse_json_export(r#"{"foo": 1}"#),
            Err(EngineError::CookieParseFailed(_))
        ));
        assert!(matches!(
            parse_json_export("42"),
            Err(EngineError::CookieParseFailed(_))
        ));
    }

    #[test]
    fn converted_output_validates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let records = parse_json_export(
            r#"[{"domain":".example.com","name":"sid","value":"abc","secure":true,"expirationDate":1893456000},
                {"domain":"example.com","path":"/x","name":"t","value":"1","httpOnly":true}]"#,
        )
        .expect("parse");
        let jar = dir.path().join("cookies.txt");
        std::fs::write(&jar, convert_to_netscape(&records)).expect("write");

        let v = validate(&jar);
        assert!(v.ok, "{}", v.message);
        assert!(!v.repaired);
        assert_eq!(v.message, "Loaded 2 cookies from cookies.txt");
    }

    #[test]
    fn missing_header_is_repaired_into_sibling() {
        let dir = tempfile::tempdir().expect("tempdir");
        let jar = dir.path().join("cookies.txt");
        let original = ".example.com\tTRUE\t/\tFALSE\t0\tsid\tabc";
        std::fs::write(&jar, original).expect("write");

        let v = validate(&jar);
        assert!(v.ok, "{}", v.message);
        assert!(v.repaired);
        assert_eq!(v.path, dir.path().join("cookies.txt.withheader"));
        assert_eq!(std::fs::read_to_string(&jar).expect("read"), original);
    }

    #[test]
    fn inconsistent_flags_fail_validation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let jar = dir.path().join("bad.txt");
        std::fs::write(
            &jar,
            "# Netscape HTTP Cookie File\nexample.com\tTRUE\t/\tFALSE\t0\tsid\tabc\n",
        )
        .expect("write");
        let v = validate(&jar);
        assert!(!v.ok);
        assert!(v.message.contains("line 2"), "{}", v.message);

        assert!(matches!(
            parse_jar("# HTTP Cookie File\na.com\tFALSE\t/\tFALSE\tsoon\tn\tv\n"),
            Err(JarError::BadLine { line: 2, .. })
        ));
    }

    #[test]
    fn failed_repair_leaves_no_sibling_behind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let jar = dir.path().join("cookies.txt");
        std::fs::write(&jar, "example.com\tTRUE\t/\tFALSE\t0\tsid\tabc\n").expect("write");

        let v = validate(&jar);
        assert!(!v.ok);
        assert!(!v.repaired);
        assert!(!dir.path().join("cookies.txt.withheader").exists());
        assert!(jar.exists());
    }

    #[test]
    fn indented_comments_and_loose_flags_are_accepted() {
        let text = "# Netscape HTTP Cookie File\n  # exported by hand\n\t$ marker\n\
                    example.com\ttrue\t/\tyes\t0\tsid\tabc\n\
                    .example.com\tTRUE\t/\tFALSE\t0\tuid\tdef\n";
        assert_eq!(parse_jar(text), Ok(2));

        // A lowercase flag still reads as false, so a dotted domain disagrees.
        assert!(matches!(
            parse_jar("# HTTP Cookie File\n.example.com\ttrue\t/\tFALSE\t0\tsid\tabc\n"),
            Err(JarError::BadLine { line: 2, .. })
        ));
    }

    #[test]
    fn prepare_converts_json_and_passes_browser_through() {
        let dir = tempfile::tempdir().expect("tempdir");
        let export = dir.path().join("export.json");
        std::fs::write(
            &export,
            r#"{"cookies":[{"domain":".example.com","name":"sid","value":"abc"}]}"#,
        )
        .expect("write");

        let run_dir = dir.path().join("run");
        let prepared =
            prepare_cookies(&CookieSource::File(export), &run_dir).expect("prepare");
        assert_eq!(prepared, PreparedCookies::File(run_dir.join("cookies.txt")));
        let text = std::fs::read_to_string(run_dir.join("cookies.txt")).expect("read");
        assert!(text.contains("Netscape HTTP Cookie File"));

        let browser = prepare_cookies(&CookieSource::Browser("firefox".into()), &run_dir)
            .expect("prepare");
        assert_eq!(browser, PreparedCookies::Browser("firefox".to_string()));
        let none = prepare_cookies(&CookieSource::Browser("None".into()), &run_dir)
            .expect("prepare");
        assert_eq!(none, PreparedCookies::None);
    }

    #[test]
    fn prepare_rejects_broken_jar() {
        let dir = tempfile::tempdir().expect("tempdir");
        let jar = dir.path().join("cookies.txt");
        std::fs::write(&jar, "# Netscape HTTP Cookie File\nonly\ttwo\n").expect("write");
        let err = prepare_cookies(&CookieSource::File(jar), dir.path()).expect_err("invalid");
        assert!(matches!(err, EngineError::CookieFileInvalid { .. }));
    }
}
