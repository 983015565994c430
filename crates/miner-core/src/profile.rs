//! Operator profile: pool address and API key remembered between runs.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Pool credentials stored in `$XDG_CONFIG_HOME/hds-miner/config.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinerProfile {
    /// Pool address as `host:port`.
    #[serde(default)]
    pub server: Option<String>,
    /// Pool API key.
    #[serde(default)]
    pub api_key: Option<String>,
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl MinerProfile {
    fn normalize(&mut self) {
        self.server = trimmed(self.server.take());
        self.api_key = trimmed(self.api_key.take());
    }

    /// Whether both the server and the key are known.
    pub fn is_complete(&self) -> bool {
        self.server.is_some() && self.api_key.is_some()
    }

    /// Fill fields that are unset here from `other`.
    pub fn fill_from(&mut self, other: &MinerProfile) {
        if self.server.is_none() {
            self.server.clone_from(&other.server);
        }
        if self.api_key.is_none() {
            self.api_key.clone_from(&other.api_key);
        }
    }
}

fn xdg_config_home() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME") {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            anyhow::bail!("XDG_CONFIG_HOME is set but empty");
        }
        return Ok(dir);
    }

    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        anyhow::bail!("HOME is set but empty");
    }
    Ok(home.join(".config"))
}

/// Default location of the profile file.
pub fn profile_path() -> anyhow::Result<PathBuf> {
    Ok(xdg_config_home()?.join("hds-miner").join("config.json"))
}

/// Read a profile from `path`; a missing file is `Ok(None)`.
pub fn load_profile_from(path: &Path) -> anyhow::Result<Option<MinerProfile>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    let mut profile: MinerProfile = serde_json::from_str(&raw)?;
    profile.normalize();
    Ok(Some(profile))
}

/// Write `profile` to `path` through a temporary file and a rename.
pub fn save_profile_to(path: &Path, profile: &MinerProfile) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid profile path: {}", path.display()))?;
    std::fs::create_dir_all(dir)?;

    let mut profile = profile.clone();
    profile.normalize();

    let json = serde_json::to_string_pretty(&profile)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

/// Load the profile from its default location.
pub fn load_profile() -> anyhow::Result<Option<MinerProfile>> {
    load_profile_from(&profile_path()?)
}

/// Complete `given` from the stored profile, asking on the terminal for
/// anything still missing when `interactive` is set. Answers are saved.
pub fn ensure_profile(given: MinerProfile, interactive: bool) -> anyhow::Result<MinerProfile> {
    let mut profile = given;
    profile.normalize();
    if profile.is_complete() {
        return Ok(profile);
    }

    let path = profile_path()?;
    match load_profile_from(&path) {
        Ok(Some(stored)) => profile.fill_from(&stored),
        Ok(None) => {}
        Err(err) => {
            if !interactive {
                return Err(err);
            }
            eprintln!("warning: failed to read miner profile (will recreate): {err:#}");
        }
    }
    if profile.is_complete() || !interactive {
        return Ok(profile);
    }

    prompt_missing(&mut profile, &path)?;
    save_profile_to(&path, &profile)?;
    Ok(profile)
}

fn prompt_line(prompt: &str) -> anyhow::Result<String> {
    let mut out = std::io::stdout();
    out.write_all(prompt.as_bytes())?;
    out.flush()?;

    let mut buf = String::new();
    std::io::stdin().read_line(&mut buf)?;
    Ok(buf.trim().to_string())
}

fn prompt_missing(profile: &mut MinerProfile, path: &Path) -> anyhow::Result<()> {
    println!("First-run setup (saved to {}).", path.display());

    while profile.server.is_none() {
        let v = prompt_line("Pool server (host:port): ")?;
        if v.rsplit_once(':').is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok()) {
            profile.server = Some(v);
        } else {
            println!("Invalid server: expected host:port.");
        }
    }
    while profile.api_key.is_none() {
        profile.api_key = trimmed(Some(prompt_line("API key: ")?));
    }
    Ok(())
}
