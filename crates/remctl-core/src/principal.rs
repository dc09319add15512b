//! Principal naming

/// Derive the default server principal for a target host.
///
/// When the caller does not name a server principal explicitly, the
/// host-based service principal of the target is used, with no
/// transformations applied to the hostname.
pub fn default_principal(host: &str) -> String {
    format!("host/{host}")
}
