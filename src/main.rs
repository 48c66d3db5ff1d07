//! Emulator entry point
//!
//! Usage: `cyber60 [config-name]`
//!
//! The profile file is `cyber.ini` in the working directory; the
//! argument selects a section in it and defaults to `cyber`. The full
//! operator interface lives in the front-end; this binary accepts a
//! bare `shutdown` line on standard input so the machine can be brought
//! down cleanly, flushing extended memory and device files.

use std::env;
use std::io::BufRead;
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use log::info;

use cyber60::{config, System};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().collect();
    let config_name = args.get(1).map(String::as_str).unwrap_or("cyber");

    let profile = Path::new("cyber.ini");
    let cfg = config::load(profile, config_name)
        .with_context(|| format!("loading section [{}] of {}", config_name, profile.display()))?;

    info!("starting {} with section [{}]", cfg.model, config_name);

    let mut system = System::new(cfg).context("assembling the system")?;
    system.start().context("starting emulation threads")?;

    // Watch standard input for a shutdown request. The thread parks on a
    // closed stdin, which is fine: the flag is what everything honours.
    {
        let active = system.active_flag();
        thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(line) if line.trim().eq_ignore_ascii_case("shutdown") => {
                        info!("shutdown requested");
                        active.store(false, std::sync::atomic::Ordering::Relaxed);
                        break;
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        });
    }

    while system.is_active() {
        thread::sleep(Duration::from_millis(100));
    }

    system.terminate();
    Ok(())
}
