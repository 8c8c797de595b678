//! Runtime configuration: the IO path set and the VU1 per-kick cycle budget,
//! loaded from an optional `ps2_runtime.toml` beside the executable (or
//! `$PS2_RUNTIME_CONFIG`) and overridable by CLI flags. Absence of the file
//! is not an error; a malformed one is.

use std::env;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use serde::Deserialize;

use crate::error::{Ps2Error, Result};

/// Matches the bound `Vu1Interpreter::execute`/`resume` are called with by
/// default: large enough that a well-formed microprogram never trips it,
/// small enough that a runaway one can't starve the host thread.
const DEFAULT_MAX_VU1_CYCLES_PER_KICK: u32 = 1 << 16;

lazy_static! {
    /// Relative candidates the CLI walks, in order, when no ELF path is
    /// given on the command line.
    pub static ref DEFAULT_ELF_SEARCH_PATHS: Vec<&'static str> =
        vec!["game.elf", "SLUS_000.00", "SLES_000.00", "boot/game.elf"];
}

/// The IO path set plus the VU1 cycle budget. Field names match the config
/// file's keys one-to-one so `toml`'s derive can deserialize it directly.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub elf_directory: PathBuf,
    pub host_root: PathBuf,
    pub cd_root: PathBuf,
    pub mc_root: PathBuf,
    pub max_vu1_cycles_per_kick: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        RuntimeConfig {
            elf_directory: PathBuf::from("."),
            host_root: home.join("ps2_runtime"),
            cd_root: PathBuf::from("."),
            mc_root: home.join("ps2_runtime").join("mc0"),
            max_vu1_cycles_per_kick: DEFAULT_MAX_VU1_CYCLES_PER_KICK,
        }
    }
}

impl RuntimeConfig {
    /// Loads `ps2_runtime.toml` from `exe_dir`, or from the path named by
    /// `$PS2_RUNTIME_CONFIG` when that's set. A missing file yields the
    /// compiled-in defaults; a present-but-malformed one is a
    /// `ConfigurationError`.
    pub fn load(exe_dir: &Path) -> Result<Self> {
        let path = env::var_os("PS2_RUNTIME_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| exe_dir.join("ps2_runtime.toml"));

        match std::fs::read_to_string(&path) {
            Ok(text) => toml::from_str(&text)
                .map_err(|e| Ps2Error::configuration(path.display().to_string(), e.to_string())),
            Err(_) => Ok(Self::default()),
        }
    }

    /// Applies `--host-root`, `--cd-root`, `--mc-root` overrides, each
    /// consuming the argument that follows it.
    pub fn apply_cli_overrides(&mut self, args: &[String]) {
        let mut i = 0;
        while i < args.len() {
            let consumed = match args[i].as_str() {
                "--host-root" if i + 1 < args.len() => {
                    self.host_root = PathBuf::from(&args[i + 1]);
                    true
                }
                "--cd-root" if i + 1 < args.len() => {
                    self.cd_root = PathBuf::from(&args[i + 1]);
                    true
                }
                "--mc-root" if i + 1 < args.len() => {
                    self.mc_root = PathBuf::from(&args[i + 1]);
                    true
                }
                _ => false,
            };
            i += if consumed { 2 } else { 1 };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RuntimeConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.max_vu1_cycles_per_kick, DEFAULT_MAX_VU1_CYCLES_PER_KICK);
    }

    #[test]
    fn present_config_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("ps2_runtime.toml"),
            "max_vu1_cycles_per_kick = 512\nhost_root = \"/srv/ps2\"\n",
        )
        .unwrap();
        let cfg = RuntimeConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.max_vu1_cycles_per_kick, 512);
        assert_eq!(cfg.host_root, PathBuf::from("/srv/ps2"));
    }

    #[test]
    fn malformed_config_file_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ps2_runtime.toml"), "not = [valid").unwrap();
        let err = RuntimeConfig::load(dir.path()).unwrap_err();
        assert!(matches!(err, Ps2Error::ConfigurationError { .. }));
    }

    #[test]
    fn cli_overrides_replace_individual_fields_only() {
        let mut cfg = RuntimeConfig::default();
        let default_cd_root = cfg.cd_root.clone();
        cfg.apply_cli_overrides(&["--host-root".to_string(), "/tmp/host".to_string()]);
        assert_eq!(cfg.host_root, PathBuf::from("/tmp/host"));
        assert_eq!(cfg.cd_root, default_cd_root);
    }
}
