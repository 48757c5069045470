//! Agent identity auto-generation.
//!
//! Prefer the Raspberry Pi board serial from `/proc/cpuinfo`, else hash a
//! machine identifier into a short, stable id.

use sha2::{Digest, Sha256};

const CPUINFO_PATH: &str = "/proc/cpuinfo";
const MACHINE_ID_PATHS: [&str; 2] = ["/etc/machine-id", "/var/lib/dbus/machine-id"];

/// Derive a stable agent id when none is configured.
#[must_use]
pub fn generate_agent_id() -> String {
    if let Some(serial) = pi_serial_from_cpuinfo(CPUINFO_PATH) {
        return format!("pi-{}", last_n(&serial, 8));
    }
    let machine_id = MACHINE_ID_PATHS
        .iter()
        .find_map(|path| std::fs::read_to_string(path).ok())
        .unwrap_or_else(fallback_machine_token);
    format!("agent-{}", hash_prefix(machine_id.trim(), 8))
}

fn pi_serial_from_cpuinfo(path: &str) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    for line in contents.lines() {
        if let Some((key, value)) = line.split_once(':') {
            if key.trim().eq_ignore_ascii_case("serial") {
                let serial = value.trim();
                if !serial.is_empty() && !serial.chars().all(|c| c == '0') {
                    return Some(serial.to_string());
                }
            }
        }
    }
    None
}

fn last_n(s: &str, n: usize) -> String {
    if s.len() <= n {
        s.to_string()
    } else {
        s[s.len() - n..].to_string()
    }
}

fn hash_prefix(input: &str, len: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..len].to_string()
}

fn fallback_machine_token() -> String {
    format!("{}-{}", std::process::id(), hostname_or_unknown())
}

fn hostname_or_unknown() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_serial_from_cpuinfo_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cpuinfo");
        std::fs::write(
            &path,
            "processor\t: 0\nmodel name\t: ARMv7\nSerial\t\t: 00000000abcdef1234567890\n",
        )
        .unwrap();
        let serial = pi_serial_from_cpuinfo(path.to_str().unwrap()).unwrap();
        assert_eq!(serial, "00000000abcdef1234567890");
    }

    #[test]
    fn all_zero_serial_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cpuinfo");
        std::fs::write(&path, "Serial\t\t: 0000000000000000\n").unwrap();
        assert!(pi_serial_from_cpuinfo(path.to_str().unwrap()).is_none());
    }

    #[test]
    fn missing_cpuinfo_file_returns_none() {
        assert!(pi_serial_from_cpuinfo("/nonexistent/cpuinfo").is_none());
    }

    #[test]
    fn last_n_truncates_from_the_right() {
        assert_eq!(last_n("0123456789abcdef", 8), "89abcdef");
        assert_eq!(last_n("ab", 8), "ab");
    }

    #[test]
    fn hash_prefix_is_stable_and_hex() {
        let a = hash_prefix("same-input", 8);
        let b = hash_prefix("same-input", 8);
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn generate_agent_id_is_nonempty() {
        let id = generate_agent_id();
        assert!(id.starts_with("pi-") || id.starts_with("agent-"));
    }
}
