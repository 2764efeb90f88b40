//! Framework variants and the commands each one needs to install, build,
//! and serve a live preview.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framework {
    #[default]
    #[serde(rename = "nextjs", alias = "next")]
    NextJs,
    Vite,
}

impl Framework {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NextJs => "nextjs",
            Self::Vite => "vite",
        }
    }

    /// Built-in profile for this framework.
    pub fn profile(&self) -> FrameworkProfile {
        match self {
            Self::NextJs => FrameworkProfile {
                install: "npm install".to_string(),
                dependency_marker: "node_modules".to_string(),
                dev: "exec npx next dev -p {port}".to_string(),
                build: "npm run build".to_string(),
                manifest: "package.json".to_string(),
                ready_pattern: r"(?:Local:\s+https?://[^\s:]+|started server on [^\s:]+|localhost):(\d{2,5})"
                    .to_string(),
            },
            Self::Vite => FrameworkProfile {
                install: "npm install".to_string(),
                dependency_marker: "node_modules".to_string(),
                dev: "exec npx vite --port {port} --host 127.0.0.1".to_string(),
                build: "npm run build".to_string(),
                manifest: "package.json".to_string(),
                ready_pattern: r"Local:\s+https?://[^\s:]+:(\d{2,5})".to_string(),
            },
        }
    }

    /// Minimal manifest written when a workspace is first materialized.
    pub fn scaffold_manifest(&self, name: &str) -> String {
        let manifest = match self {
            Self::NextJs => serde_json::json!({
                "name": name.to_lowercase(),
                "private": true,
                "scripts": {"dev": "next dev", "build": "next build", "start": "next start"},
                "dependencies": {"next": "^15.0.0", "react": "^19.0.0", "react-dom": "^19.0.0"},
                "devDependencies": {"typescript": "^5.6.0", "@types/react": "^19.0.0", "@types/node": "^22.0.0"}
            }),
            Self::Vite => serde_json::json!({
                "name": name.to_lowercase(),
                "private": true,
                "type": "module",
                "scripts": {"dev": "vite", "build": "tsc -b && vite build", "preview": "vite preview"},
                "dependencies": {"react": "^19.0.0", "react-dom": "^19.0.0"},
                "devDependencies": {"vite": "^6.0.0", "@vitejs/plugin-react": "^4.3.0", "typescript": "^5.6.0"}
            }),
        };
        serde_json::to_string_pretty(&manifest).unwrap_or_else(|_| "{}".to_string())
    }
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Framework {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nextjs" | "next" | "next.js" => Ok(Self::NextJs),
            "vite" | "react" | "vite-react" => Ok(Self::Vite),
            _ => Err(format!("Invalid framework '{}'. Valid values: nextjs, vite", s)),
        }
    }
}

/// Shell commands and patterns for one framework.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameworkProfile {
    pub install: String,
    /// Path whose presence means dependencies are already installed
    pub dependency_marker: String,
    /// Dev server command; `{port}` is replaced with the allocated port
    pub dev: String,
    pub build: String,
    pub manifest: String,
    /// Regex whose first capture group is the port the server reports
    pub ready_pattern: String,
}

impl FrameworkProfile {
    pub fn dev_command(&self, port: u16) -> String {
        self.dev.replace("{port}", &port.to_string())
    }

    pub fn ready_regex(&self) -> Result<Regex, regex::Error> {
        Regex::new(&self.ready_pattern)
    }

    /// The port announced by `line`, if it is a readiness line.
    pub fn detect_ready_port(regex: &Regex, line: &str) -> Option<u16> {
        regex
            .captures(line)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }
}

/// Partial profile from `[preview.frameworks.<name>]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileOverride {
    #[serde(default)]
    pub install: Option<String>,
    #[serde(default)]
    pub dependency_marker: Option<String>,
    #[serde(default)]
    pub dev: Option<String>,
    #[serde(default)]
    pub build: Option<String>,
    #[serde(default)]
    pub ready_pattern: Option<String>,
}

impl ProfileOverride {
    pub fn apply(&self, mut profile: FrameworkProfile) -> FrameworkProfile {
        if let Some(v) = &self.install {
            profile.install = v.clone();
        }
        if let Some(v) = &self.dependency_marker {
            profile.dependency_marker = v.clone();
        }
        if let Some(v) = &self.dev {
            profile.dev = v.clone();
        }
        if let Some(v) = &self.build {
            profile.build = v.clone();
        }
        if let Some(v) = &self.ready_pattern {
            profile.ready_pattern = v.clone();
        }
        profile
    }
}

/// Resolves the effective profile for each framework.
#[derive(Debug, Clone, Default)]
pub struct Profiles {
    overrides: HashMap<Framework, ProfileOverride>,
}

impl Profiles {
    pub fn new(overrides: HashMap<Framework, ProfileOverride>) -> Self {
        Self { overrides }
    }

    pub fn get(&self, framework: Framework) -> FrameworkProfile {
        let base = framework.profile();
        match self.overrides.get(&framework) {
            Some(o) => o.apply(base),
            None => base,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framework_from_str_aliases() {
        assert_eq!("nextjs".parse::<Framework>().unwrap(), Framework::NextJs);
        assert_eq!("Next.js".parse::<Framework>().unwrap(), Framework::NextJs);
        assert_eq!("vite".parse::<Framework>().unwrap(), Framework::Vite);
        assert!("rails".parse::<Framework>().is_err());
    }

    #[test]
    fn test_dev_command_substitutes_port() {
        let profile = Framework::NextJs.profile();
        assert_eq!(profile.dev_command(3105), "exec npx next dev -p 3105");
    }

    #[test]
    fn test_next_ready_line_reports_actual_port() {
        let regex = Framework::NextJs.profile().ready_regex().unwrap();
        assert_eq!(
            FrameworkProfile::detect_ready_port(&regex, "   - Local:        http://localhost:3001"),
            Some(3001)
        );
        assert_eq!(
            FrameworkProfile::detect_ready_port(
                &regex,
                "ready - started server on 0.0.0.0:3100, url: http://localhost:3100"
            ),
            Some(3100)
        );
        assert_eq!(FrameworkProfile::detect_ready_port(&regex, "compiling..."), None);
    }

    #[test]
    fn test_vite_ready_line_reports_actual_port() {
        let regex = Framework::Vite.profile().ready_regex().unwrap();
        assert_eq!(
            FrameworkProfile::detect_ready_port(&regex, "  ➜  Local:   http://127.0.0.1:5174/"),
            Some(5174)
        );
    }

    #[test]
    fn test_override_replaces_only_given_fields() {
        let mut overrides = HashMap::new();
        overrides.insert(
            Framework::Vite,
            ProfileOverride {
                dev: Some("exec pnpm vite --port {port}".into()),
                ..Default::default()
            },
        );
        let profiles = Profiles::new(overrides);
        let vite = profiles.get(Framework::Vite);
        assert_eq!(vite.dev_command(1), "exec pnpm vite --port 1");
        assert_eq!(vite.install, "npm install");
        assert_eq!(profiles.get(Framework::NextJs), Framework::NextJs.profile());
    }

    #[test]
    fn test_scaffold_manifest_is_valid_json() {
        for fw in [Framework::NextJs, Framework::Vite] {
            let manifest: serde_json::Value =
                serde_json::from_str(&fw.scaffold_manifest("Demo")).unwrap();
            assert_eq!(manifest["name"], "demo");
            assert!(manifest["scripts"]["build"].is_string());
        }
    }
}
