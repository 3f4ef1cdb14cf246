//! OCID-shaped identifier parsing: realm, region, resource-type extraction
//! and the bastion-host domain convention (§4.8, §9).
//!
//! The source this was distilled from decided gov-cloud by `contains("2")`
//! in the realm segment, which misclassifies `oc1` tenancies whose region
//! strings happen to contain "2". This repo uses the corrected rule: exact
//! equality against `"oc1"`.

/// Default realm used when an identifier is malformed or too short.
pub const DEFAULT_REALM: &str = "oc1";

/// Dot-separated segment at `index`, or `default` if the identifier is too
/// short to have that segment. Never panics on malformed input.
fn segment_or<'a>(ocid: &'a str, index: usize, default: &'a str) -> &'a str {
    ocid.split('.').nth(index).filter(|s| !s.is_empty()).unwrap_or(default)
}

/// The realm segment (3rd dot-separated field) of an OCID-shaped identifier,
/// e.g. `ocid1.bastion.oc2.us-langley-1.xxx` -> `"oc2"`.
pub fn realm(ocid: &str) -> &str {
    segment_or(ocid, 2, DEFAULT_REALM)
}

/// The region segment (4th dot-separated field), or empty string if absent.
pub fn region(ocid: &str) -> &str {
    segment_or(ocid, 3, "")
}

/// The resource-type segment (2nd dot-separated field), or empty string if
/// absent.
pub fn resource_type(ocid: &str) -> &str {
    segment_or(ocid, 1, "")
}

/// Cloud domain suffix for a realm: `oc1` is commercial, everything else is
/// government cloud. Authoritative rule per this spec: exact equality, not
/// substring matching.
pub fn domain_for_realm(realm: &str) -> &'static str {
    if realm == "oc1" {
        "oraclecloud.com"
    } else {
        "oraclegovcloud.com"
    }
}

/// Bastion host address for a STANDARD-type bastion: `host.bastion.<region>.oci.<domain>:22`.
pub fn bastion_host_address(region: &str, bastion_id: &str) -> String {
    let domain = domain_for_realm(realm(bastion_id));
    format!("host.bastion.{region}.oci.{domain}:22")
}

/// Bastion host address for an INTERNAL-type bastion (proxy jump host).
pub fn internal_bastion_proxy_address(region: &str) -> String {
    format!("ztb-internal.bastion.{region}.oci.oracleiaas.com")
}
