//! Value normalisation shared by hashing, dependent-entity naming and upserts.
//!
//! Everything here is pure: identical input always yields identical output,
//! which the fingerprint and slug invariants rely on.

use std::net::Ipv4Addr;
use std::sync::LazyLock;

use regex::Regex;

/// Placeholder used when vendor or model is missing.
pub const UNKNOWN: &str = "Unknown";

/// Maximum slug length accepted by the target system.
const MAX_SLUG_LEN: usize = 50;

/// Addresses that are never treated as a host's primary address.
const RESERVED_ADDRESSES: [&str; 3] = ["0.0.0.0", "127.0.0.1", "255.255.255.255"];

/// Known vendor spellings and their canonical names.
const VENDOR_ALIASES: [(&str, &str); 7] = [
    ("Dell Inc.", "Dell"),
    ("DELL", "Dell"),
    ("Hewlett Packard Enterprise", "HPE"),
    ("HP", "HPE"),
    ("Huawei Technologies Co., Ltd.", "Huawei"),
    ("LENOVO", "Lenovo"),
    ("VMware, Inc.", "VMware"),
];

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

static SLUG_INVALID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9-]").unwrap());

static SLUG_DASHES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-+").unwrap());

static MEMORY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*(TB|GB|MB)").unwrap());

/// Server model families recognisable inside free-text hardware descriptions.
static MODEL_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)\bPowerEdge\s+[A-Z]{1,2}\d{2,4}[a-z]*\b").unwrap(),
        Regex::new(r"(?i)\bProLiant\s+[A-Z]{2}\d{2,3}\s+Gen\s?\d{1,2}\b").unwrap(),
        Regex::new(r"(?i)\bThinkSystem\s+[A-Z]{2}\d{3}\b").unwrap(),
        Regex::new(r"(?i)\bThinkAgile\s+[A-Z]{2}\d{4}\s+Node\b").unwrap(),
        Regex::new(r"(?i)\bRH\d{4}H?\s+V\d\b").unwrap(),
        Regex::new(r"(?i)\bCH\d{3}\s+V\d\b").unwrap(),
        Regex::new(r"(?i)\bVMware\s+Virtual\s+Platform\b").unwrap(),
    ]
});

fn is_placeholder(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty() || trimmed.eq_ignore_ascii_case("N/A")
}

/// Canonical manufacturer name for a raw vendor string.
#[must_use]
pub fn normalize_vendor(vendor: &str) -> String {
    if is_placeholder(vendor) {
        return UNKNOWN.to_string();
    }
    let vendor = vendor.trim();
    VENDOR_ALIASES
        .iter()
        .find(|(alias, _)| *alias == vendor)
        .map_or_else(|| vendor.to_string(), |(_, canonical)| (*canonical).to_string())
}

/// Canonical device model name: collapsed whitespace, OEM placeholders dropped.
#[must_use]
pub fn normalize_model(model: &str) -> String {
    if is_placeholder(model) {
        return UNKNOWN.to_string();
    }
    let model = WHITESPACE.replace_all(model.trim(), " ").into_owned();
    if model.to_lowercase().contains("to be filled") {
        return UNKNOWN.to_string();
    }
    model
}

/// Deterministic slug for a display name.
#[must_use]
pub fn slugify(name: &str) -> String {
    let lowered = name.to_lowercase();
    let replaced = SLUG_INVALID.replace_all(&lowered, "-");
    let collapsed = SLUG_DASHES.replace_all(&replaced, "-");
    let mut slug = collapsed.trim_matches('-').to_string();
    if slug.len() > MAX_SLUG_LEN {
        slug.truncate(MAX_SLUG_LEN);
        slug = slug.trim_end_matches('-').to_string();
    }
    if slug.is_empty() {
        "unknown".to_string()
    } else {
        slug
    }
}

/// Memory size in whole gigabytes from text such as `"1.99 TB"` or `"512 GB"`.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn normalize_memory(memory: &str) -> Option<u64> {
    if is_placeholder(memory) {
        return None;
    }
    let captures = MEMORY.captures(memory)?;
    let value: f64 = captures[1].parse().ok()?;
    let gigabytes = match captures[2].to_uppercase().as_str() {
        "TB" => value * 1024.0,
        "GB" => value,
        _ => value / 1024.0,
    };
    Some(gigabytes as u64)
}

/// Whether `address` is a usable dotted-quad IPv4 host address.
#[must_use]
pub fn is_valid_ipv4(address: &str) -> bool {
    if address.is_empty() || RESERVED_ADDRESSES.contains(&address) {
        return false;
    }
    address.parse::<Ipv4Addr>().is_ok()
}

/// First two octets of an address (`"10.11"` for `10.11.5.5`).
#[must_use]
pub fn subnet_prefix(address: &str) -> Option<String> {
    if !is_valid_ipv4(address) {
        return None;
    }
    let mut octets = address.split('.');
    Some(format!("{}.{}", octets.next()?, octets.next()?))
}

/// Host part of an address that may carry a prefix length.
#[must_use]
pub fn host_part(address: &str) -> &str {
    address.split('/').next().unwrap_or(address)
}

/// Extract a canonical server model name from free text.
#[must_use]
pub fn extract_model(text: &str) -> Option<String> {
    MODEL_PATTERNS.iter().find_map(|pattern| {
        pattern
            .find(text)
            .map(|m| WHITESPACE.replace_all(m.as_str(), " ").into_owned())
    })
}

/// Trimmed value, or `None` for empty and placeholder text.
#[must_use]
pub fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !is_placeholder(v))
}
