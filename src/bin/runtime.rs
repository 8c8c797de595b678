//! CLI entry point: `runtime <elf_path?>`. Loads the named ELF (or the first
//! hit in [`ps2_runtime::config::DEFAULT_ELF_SEARCH_PATHS`]) into a fresh
//! [`Runtime`], then pumps it once so the caller can see the DMA/VIF/GIF/GS
//! pipeline is wired up. Windowing and audio-backend glue live outside the
//! core and are not started here.

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use ps2_runtime::config::{RuntimeConfig, DEFAULT_ELF_SEARCH_PATHS};
use ps2_runtime::Runtime;

fn resolve_elf_path(args: &[String], elf_directory: &PathBuf) -> Option<PathBuf> {
    if let Some(explicit) = args.first() {
        return Some(PathBuf::from(explicit));
    }
    DEFAULT_ELF_SEARCH_PATHS
        .iter()
        .map(|candidate| elf_directory.join(candidate))
        .find(|path| path.is_file())
}

fn main() -> ExitCode {
    ps2_runtime::logging::install();

    let args: Vec<String> = env::args().skip(1).collect();
    let exe_dir = env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."));

    let mut config = match RuntimeConfig::load(&exe_dir) {
        Ok(c) => c,
        Err(e) => {
            ps2_runtime::error::log_and_continue(&e);
            return ExitCode::FAILURE;
        }
    };
    config.apply_cli_overrides(&args);

    let positional: Vec<String> = args.iter().filter(|a| !a.starts_with("--")).cloned().collect();
    let Some(elf_path) = resolve_elf_path(&positional, &config.elf_directory) else {
        eprintln!("runtime: no ELF path given and none of the default search paths exist");
        return ExitCode::FAILURE;
    };

    let bytes = match std::fs::read(&elf_path) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("runtime: failed to read {}: {e}", elf_path.display());
            return ExitCode::FAILURE;
        }
    };

    let mut runtime = Runtime::new(config);
    let elf_path_str = elf_path.display().to_string();
    if let Err(e) = runtime.load_elf(&elf_path_str, &bytes) {
        eprintln!("runtime: failed to load {elf_path_str}: {e}");
        return ExitCode::FAILURE;
    }

    runtime.pump();
    log::info!(target: "ps2", "registry holds {} bound addresses", runtime.registry.len());
    ExitCode::SUCCESS
}
