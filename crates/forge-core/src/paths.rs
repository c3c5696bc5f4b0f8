//! Path translation between the local device and the workstation.
//!
//! The daemon may run on a small always-on box while git repositories live
//! on the workstation. Registry files store workstation paths; transport
//! commands need them too, while local file access needs the local form.

/// Environment variable holding the local (pi-side) projects base.
pub const PI_BASE_ENV: &str = "FORGE_PROJECTS_PATH";
/// Environment variable holding the workstation (mac-side) projects base.
pub const MAC_BASE_ENV: &str = "FORGE_MAC_PROJECTS_PATH";

/// Translates paths between the two filesystem namespaces.
///
/// Passthrough mode (bases missing or equal) makes every operation the
/// identity, which covers running the daemon directly on the workstation.
#[derive(Debug, Clone)]
pub struct PathTranslator {
    pi_base: Option<String>,
    mac_base: Option<String>,
    passthrough: bool,
}

impl PathTranslator {
    /// Build a translator from the two configured bases. Trailing slashes
    /// are stripped on ingest.
    pub fn new(pi_base: Option<&str>, mac_base: Option<&str>) -> Self {
        let strip = |s: &str| {
            let trimmed = s.trim_end_matches('/');
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        };
        let pi_base = pi_base.and_then(strip);
        let mac_base = mac_base.and_then(strip);
        let passthrough = pi_base.is_none() || mac_base.is_none() || pi_base == mac_base;

        Self {
            pi_base,
            mac_base,
            passthrough,
        }
    }

    /// Build a translator from `FORGE_PROJECTS_PATH` / `FORGE_MAC_PROJECTS_PATH`.
    pub fn from_env() -> Self {
        let pi = std::env::var(PI_BASE_ENV).ok();
        let mac = std::env::var(MAC_BASE_ENV).ok();
        Self::new(pi.as_deref(), mac.as_deref())
    }

    pub fn is_passthrough(&self) -> bool {
        self.passthrough
    }

    /// Convert a local-device path into the workstation namespace.
    pub fn pi_to_mac(&self, path: &str) -> String {
        if self.passthrough {
            return path.to_string();
        }
        let (pi, mac) = (self.pi_base.as_deref().unwrap_or(""), self.mac_base.as_deref().unwrap_or(""));
        match path.strip_prefix(pi) {
            Some(rest) => format!("{mac}{rest}"),
            None => path.to_string(),
        }
    }

    /// Convert a workstation path into the local-device namespace.
    pub fn mac_to_pi(&self, path: &str) -> String {
        if self.passthrough {
            return path.to_string();
        }
        let (pi, mac) = (self.pi_base.as_deref().unwrap_or(""), self.mac_base.as_deref().unwrap_or(""));
        match path.strip_prefix(mac) {
            Some(rest) => format!("{pi}{rest}"),
            None => path.to_string(),
        }
    }

    /// Strip whichever configured base prefixes the path, for portable
    /// storage in registries.
    pub fn to_relative(&self, path: &str) -> String {
        if let Some(pi) = &self.pi_base {
            if let Some(rest) = path.strip_prefix(pi.as_str()) {
                return rest.trim_start_matches('/').to_string();
            }
        }
        if let Some(mac) = &self.mac_base {
            if let Some(rest) = path.strip_prefix(mac.as_str()) {
                return rest.trim_start_matches('/').to_string();
            }
        }
        path.to_string()
    }

    /// Resolve a path for local use: join relative paths onto the local
    /// base, translate absolute workstation paths.
    pub fn resolve_for_pi(&self, path: &str) -> String {
        if self.passthrough {
            return self.resolve_passthrough(path);
        }
        if !path.starts_with('/') {
            return join_base(self.pi_base.as_deref().unwrap_or(""), path);
        }
        if self
            .mac_base
            .as_deref()
            .is_some_and(|mac| path.starts_with(mac))
        {
            return self.mac_to_pi(path);
        }
        path.to_string()
    }

    /// Resolve a path for workstation use (transport commands).
    pub fn resolve_for_mac(&self, path: &str) -> String {
        if self.passthrough {
            return self.resolve_passthrough(path);
        }
        if !path.starts_with('/') {
            return join_base(self.mac_base.as_deref().unwrap_or(""), path);
        }
        if self
            .pi_base
            .as_deref()
            .is_some_and(|pi| path.starts_with(pi))
        {
            return self.pi_to_mac(path);
        }
        path.to_string()
    }

    fn resolve_passthrough(&self, path: &str) -> String {
        if path.starts_with('/') {
            return path.to_string();
        }
        let base = self
            .mac_base
            .as_deref()
            .or(self.pi_base.as_deref())
            .unwrap_or("");
        join_base(base, path)
    }
}

fn join_base(base: &str, rest: &str) -> String {
    if base.is_empty() {
        rest.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), rest.trim_start_matches('/'))
    }
}
