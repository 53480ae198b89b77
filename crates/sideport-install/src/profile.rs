use serde::{Deserialize, Serialize};

pub const DEFAULT_PROFILE: &str = "balanced";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
    pub refresh_rate: u32,
    pub density: u32,
}

/// Resources requested for the guest. Checked against the host before any
/// guest work starts; the guest is assumed to honor what it is given.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceProfile {
    pub name: String,
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub storage_mb: u64,
    pub display: DisplayConfig,
}

impl ResourceProfile {
    pub fn minimal() -> Self {
        Self {
            name: "minimal".into(),
            cpu_cores: 2,
            memory_mb: 2048,
            storage_mb: 8192,
            display: DisplayConfig {
                width: 720,
                height: 1280,
                refresh_rate: 60,
                density: 320,
            },
        }
    }

    pub fn balanced() -> Self {
        Self {
            name: "balanced".into(),
            cpu_cores: 4,
            memory_mb: 4096,
            storage_mb: 16384,
            display: DisplayConfig {
                width: 1080,
                height: 1920,
                refresh_rate: 60,
                density: 420,
            },
        }
    }

    pub fn performance() -> Self {
        Self {
            name: "performance".into(),
            cpu_cores: 8,
            memory_mb: 8192,
            storage_mb: 32768,
            display: DisplayConfig {
                width: 1440,
                height: 2560,
                refresh_rate: 90,
                density: 560,
            },
        }
    }

    pub fn presets() -> Vec<ResourceProfile> {
        vec![Self::minimal(), Self::balanced(), Self::performance()]
    }

    pub fn preset(name: &str) -> Option<ResourceProfile> {
        match name.trim().to_ascii_lowercase().as_str() {
            "minimal" => Some(Self::minimal()),
            "balanced" => Some(Self::balanced()),
            "performance" => Some(Self::performance()),
            _ => None,
        }
    }

    /// Starts from the balanced preset under a new name.
    pub fn custom(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::balanced()
        }
    }

    pub fn with_cpu_cores(mut self, cores: u32) -> Self {
        self.cpu_cores = cores;
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    pub fn with_storage_mb(mut self, storage_mb: u64) -> Self {
        self.storage_mb = storage_mb;
        self
    }

    pub fn with_display(mut self, display: DisplayConfig) -> Self {
        self.display = display;
        self
    }

    /// Launch flags understood by Cuttlefish's `launch_cvd`.
    pub fn launch_args(&self) -> Vec<String> {
        vec![
            format!("--cpus={}", self.cpu_cores),
            format!("--memory_mb={}", self.memory_mb),
            format!("--x_res={}", self.display.width),
            format!("--y_res={}", self.display.height),
            format!("--dpi={}", self.display.density),
            format!("--refresh_rate_hz={}", self.display.refresh_rate),
        ]
    }
}

impl Default for ResourceProfile {
    fn default() -> Self {
        Self::balanced()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_resolve_by_name() {
        for profile in ResourceProfile::presets() {
            assert_eq!(ResourceProfile::preset(&profile.name), Some(profile.clone()));
        }
        assert_eq!(
            ResourceProfile::preset(" Performance ").map(|p| p.cpu_cores),
            Some(8)
        );
        assert_eq!(ResourceProfile::preset("huge"), None);
        assert_eq!(ResourceProfile::default().name, DEFAULT_PROFILE);
    }

    #[test]
    fn custom_profile_overrides_balanced() {
        let profile = ResourceProfile::custom("ci")
            .with_cpu_cores(1)
            .with_memory_mb(1024);
        assert_eq!(profile.name, "ci");
        assert_eq!(profile.cpu_cores, 1);
        assert_eq!(profile.memory_mb, 1024);
        assert_eq!(profile.storage_mb, ResourceProfile::balanced().storage_mb);
    }

    #[test]
    fn launch_args_carry_display() {
        let args = ResourceProfile::minimal().launch_args();
        assert_eq!(
            args,
            [
                "--cpus=2",
                "--memory_mb=2048",
                "--x_res=720",
                "--y_res=1280",
                "--dpi=320",
                "--refresh_rate_hz=60"
            ]
        );
    }
}
