use v2e_uee::core::{UeeError, Urn};

#[test]
fn test_parse_well_formed_urn() {
    let urn = Urn::parse("v2e::nvd::cve::CVE-2024-12345").unwrap();
    assert_eq!(urn.provider(), "nvd");
    assert_eq!(urn.item_type(), "cve");
    assert_eq!(urn.atomic_id(), "CVE-2024-12345");
}

#[test]
fn test_format_parse_are_inverses() {
    let urn = Urn::new("mitre", "capec", "CAPEC-66").unwrap();
    let formatted = urn.to_string();
    assert_eq!(formatted, "v2e::mitre::capec::CAPEC-66");
    assert_eq!(Urn::parse(&formatted).unwrap(), urn);
}

#[test]
fn test_parse_format_roundtrip_preserves_input() {
    for raw in [
        "v2e::nvd::cve::CVE-0001",
        "v2e::owasp::asvs::V4.0.3-1.1.1",
        "v2e::ssg::ssg_rule::rule_sshd_disable_root",
        "v2e::mitre::attack::T1059.003",
    ] {
        assert_eq!(Urn::parse(raw).unwrap().to_string(), raw);
    }
}

#[test]
fn test_key_matches_canonical_form() {
    let urn = Urn::parse("v2e::nvd::cwe::CWE-79").unwrap();
    assert_eq!(urn.key(), "v2e::nvd::cwe::CWE-79");
}

#[test]
fn test_rejects_wrong_scheme() {
    let err = Urn::parse("urn::nvd::cve::CVE-1").unwrap_err();
    assert!(matches!(err, UeeError::UrnParse(_)));
}

#[test]
fn test_rejects_missing_segments() {
    assert!(Urn::parse("v2e::nvd::cve").is_err());
    assert!(Urn::parse("v2e::nvd").is_err());
    assert!(Urn::parse("v2e").is_err());
    assert!(Urn::parse("").is_err());
}

#[test]
fn test_rejects_empty_atomic_id() {
    assert!(Urn::parse("v2e::nvd::cve::").is_err());
    assert!(Urn::new("nvd", "cve", "").is_err());
}

#[test]
fn test_rejects_uppercase_provider_and_type() {
    assert!(Urn::parse("v2e::NVD::cve::CVE-1").is_err());
    assert!(Urn::parse("v2e::nvd::CVE::CVE-1").is_err());
}

#[test]
fn test_rejects_separator_inside_atomic_id() {
    assert!(Urn::new("nvd", "cve", "CVE::1").is_err());
}

#[test]
fn test_rejects_non_printable_and_non_ascii() {
    assert!(Urn::new("nvd", "cve", "CVE\t1").is_err());
    assert!(Urn::new("nvd", "cve", "CVÉ-1").is_err());
}

#[test]
fn test_atomic_id_allows_printable_ascii() {
    let urn = Urn::new("nvd", "cve", "a b!@#$%^&*(){}[]<>/|\\'\"`~:;,.-_=+?").unwrap();
    assert_eq!(Urn::parse(&urn.to_string()).unwrap(), urn);
}

#[test]
fn test_is_valid() {
    assert!(Urn::is_valid("v2e::nvd::cve::CVE-1"));
    assert!(!Urn::is_valid("v2e::nvd::cve::"));
    assert!(!Urn::is_valid("garbage"));
}

#[test]
fn test_equality_is_byte_exact() {
    let a = Urn::parse("v2e::nvd::cve::CVE-1").unwrap();
    let b = Urn::parse("v2e::nvd::cve::CVE-1").unwrap();
    let c = Urn::parse("v2e::nvd::cve::cve-1").unwrap();
    assert_eq!(a, b);
    assert_ne!(a, c);
}

#[test]
fn test_serde_roundtrip_as_string() {
    let urn = Urn::parse("v2e::nvd::cve::CVE-2021-44228").unwrap();
    let json = serde_json::to_string(&urn).unwrap();
    assert_eq!(json, "\"v2e::nvd::cve::CVE-2021-44228\"");
    let back: Urn = serde_json::from_str(&json).unwrap();
    assert_eq!(back, urn);
}

#[test]
fn test_serde_rejects_malformed() {
    let result: Result<Urn, _> = serde_json::from_str("\"v2e::nvd\"");
    assert!(result.is_err());
}
