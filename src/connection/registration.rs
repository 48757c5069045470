//! Registration envelope payload builder.

use serde_json::{json, Value};

use crate::config::ResolvedAgent;

/// Default interpreter version string reported when `"python"` is in the
/// configured capability list.
const DEFAULT_PYTHON_VERSION: &str = "3.11";

/// Build the `register` envelope payload from resolved agent config:
/// `id`, `hostname`, `display_name`, `roles`, configured tags, and
/// derived `capabilities`.
#[must_use]
pub fn build_registration_payload(agent: &ResolvedAgent) -> Value {
    let has = |name: &str| agent.capabilities.iter().any(|c| c == name);

    json!({
        "id": agent.id,
        "hostname": agent.hostname,
        "display_name": agent.display_name,
        "roles": [agent.agent_type.clone()],
        "tags": agent.tags.clone(),
        "capabilities": {
            "docker": has("docker"),
            "python": if has("python") { Value::String(DEFAULT_PYTHON_VERSION.to_string()) } else { Value::Null },
            "node": Value::Null,
            "git": has("git"),
            "disk_gb": Value::Null,
            "memory_mb": Value::Null,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(capabilities: Vec<&str>) -> ResolvedAgent {
        ResolvedAgent {
            id: "pi-abc12345".to_string(),
            agent_type: "raspberry-pi".to_string(),
            hostname: "garage-pi".to_string(),
            display_name: "garage-pi".to_string(),
            tags: vec!["garage".to_string(), "sensor".to_string()],
            capabilities: capabilities.into_iter().map(str::to_string).collect(),
        }
    }

    #[test]
    fn builds_expected_shape() {
        let payload = build_registration_payload(&agent(vec!["docker", "git"]));
        assert_eq!(payload["id"], "pi-abc12345");
        assert_eq!(payload["hostname"], "garage-pi");
        assert_eq!(payload["roles"], json!(["raspberry-pi"]));
        assert_eq!(payload["tags"], json!(["garage", "sensor"]));
        assert_eq!(payload["capabilities"]["docker"], true);
        assert_eq!(payload["capabilities"]["git"], true);
        assert_eq!(payload["capabilities"]["python"], Value::Null);
        assert_eq!(payload["capabilities"]["node"], Value::Null);
    }

    #[test]
    fn python_capability_reports_default_version() {
        let payload = build_registration_payload(&agent(vec!["python"]));
        assert_eq!(payload["capabilities"]["python"], "3.11");
    }

    #[test]
    fn no_capabilities_are_all_false_or_null() {
        let payload = build_registration_payload(&agent(vec![]));
        assert_eq!(payload["capabilities"]["docker"], false);
        assert_eq!(payload["capabilities"]["git"], false);
        assert_eq!(payload["capabilities"]["python"], Value::Null);
    }
}
