//! Minimal robots.txt handling for polite traversal.
//!
//! Only the Disallow-prefix subset is honored, for groups addressing `*` or
//! our product token. An unreadable robots.txt means allow-all.

/// Product token matched against robots.txt user-agent groups.
pub const ROBOTS_AGENT: &str = "rummage";

#[derive(Debug, Clone, Default)]
pub struct RobotsRules {
    disallow: Vec<String>,
}

impl RobotsRules {
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn parse(body: &str) -> Self {
        let mut disallow = Vec::new();
        let mut group_applies = false;
        // Consecutive user-agent lines form one group header
        let mut in_group_header = false;

        for line in body.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let Some((field, value)) = line.split_once(':') else {
                continue;
            };
            let field = field.trim().to_ascii_lowercase();
            let value = value.trim();

            match field.as_str() {
                "user-agent" => {
                    if !in_group_header {
                        group_applies = false;
                        in_group_header = true;
                    }
                    let agent = value.to_ascii_lowercase();
                    if agent == "*" || agent.contains(ROBOTS_AGENT) {
                        group_applies = true;
                    }
                }
                "disallow" => {
                    in_group_header = false;
                    if group_applies && !value.is_empty() {
                        disallow.push(value.to_string());
                    }
                }
                _ => {
                    in_group_header = false;
                }
            }
        }

        Self { disallow }
    }

    pub fn is_allowed(&self, path: &str) -> bool {
        !self.disallow.iter().any(|prefix| path.starts_with(prefix))
    }
}
