//! Device fingerprint sent alongside a registration.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFingerprint {
    pub user_agent: Option<String>,
    pub platform: Option<String>,
    pub language: Option<String>,
    pub timezone: Option<String>,
    pub screen: Option<String>,
    pub ip_address: Option<String>,
}

impl DeviceFingerprint {
    fn fields(&self) -> [(&'static str, Option<&str>); 6] {
        [
            ("user_agent", self.user_agent.as_deref()),
            ("platform", self.platform.as_deref()),
            ("language", self.language.as_deref()),
            ("timezone", self.timezone.as_deref()),
            ("screen", self.screen.as_deref()),
            ("ip_address", self.ip_address.as_deref()),
        ]
    }

    pub fn is_empty(&self) -> bool {
        self.fields()
            .iter()
            .all(|(_, v)| v.map_or(true, |s| s.trim().is_empty()))
    }

    /// Hex SHA-256 over `name=value` lines in fixed field order. `None` when
    /// every field is empty.
    pub fn digest(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        let mut hasher = Sha256::new();
        for (name, value) in self.fields() {
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(value.unwrap_or_default().as_bytes());
            hasher.update(b"\n");
        }
        let hash = hasher.finalize();
        Some(format!("{hash:x}"))
    }

    /// Fingerprint of the host the daemon runs on.
    pub fn collect_local() -> Self {
        let env = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
        Self {
            user_agent: Some(concat!("likeness/", env!("CARGO_PKG_VERSION")).to_string()),
            platform: Some(format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)),
            language: env("LC_ALL").or_else(|| env("LANG")),
            timezone: env("TZ").or_else(|| Some(chrono::Local::now().format("%:z").to_string())),
            screen: None,
            ip_address: None,
        }
    }
}
