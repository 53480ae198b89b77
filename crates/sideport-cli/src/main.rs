mod agent_client;
mod config;
mod failure;
mod install;

use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use serde::Serialize;
use sideport_agent::{Point, Request, Response};
use sideport_bridge::{AdbBridge, DeviceBridge, InstallOptions};
use sideport_install::{
    provisioner_for, validate, HostCapacity, Orchestrator, OrchestratorConfig, ResourceProfile,
    SystemHost,
};
use sideport_util::{
    finish_app_telemetry, init_app_telemetry, init_tracing, locks_dir, scratch_dir,
};

use crate::agent_client::AgentClient;
use crate::config::{config_path, Settings};
use crate::failure::Failure;
use crate::install::{follow_install, resolve_profile, ProfileOverrides};

#[derive(Parser)]
#[command(name = "sideport", version, about = "Install Android packages into a local guest")]
struct Cli {
    /// adb executable (overrides SIDEPORT_ADB_PATH and config.json)
    #[arg(long, global = true)]
    adb: Option<PathBuf>,
    /// Target this device serial instead of the first ready one
    #[arg(long, global = true)]
    serial: Option<String>,
    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(clap::Args, Clone, Copy, Debug)]
struct ProfileArgs {
    /// Override the preset's CPU cores
    #[arg(long)]
    cpus: Option<u32>,
    /// Override the preset's memory
    #[arg(long)]
    memory_mb: Option<u64>,
    /// Override the preset's storage
    #[arg(long)]
    storage_mb: Option<u64>,
}

impl From<ProfileArgs> for ProfileOverrides {
    fn from(args: ProfileArgs) -> Self {
        Self {
            cpus: args.cpus,
            memory_mb: args.memory_mb,
            storage_mb: args.storage_mb,
        }
    }
}

#[derive(Subcommand)]
enum Cmd {
    /// Install an .apk or .xapk into the guest and follow the job
    Install {
        source: PathBuf,
        /// Resource preset (minimal, balanced, performance)
        #[arg(long)]
        profile: Option<String>,
        #[command(flatten)]
        overrides: ProfileArgs,
        /// Guest address for adb connect
        #[arg(long)]
        guest: Option<String>,
        /// Command that boots the guest when it is not reachable
        #[arg(long)]
        start_cmd: Option<String>,
        #[arg(long)]
        boot_timeout_secs: Option<u64>,
        /// Allow installing a lower version code
        #[arg(long)]
        downgrade: bool,
        /// Grant all runtime permissions
        #[arg(long)]
        grant: bool,
    },
    /// Show what an archive contains without installing it
    Inspect { source: PathBuf },
    /// List resource presets
    Profiles,
    /// Check a profile against this host
    Validate {
        #[arg(long)]
        profile: Option<String>,
        #[command(flatten)]
        overrides: ProfileArgs,
    },
    /// List devices known to adb
    Devices,
    /// adb connect to the guest
    Connect { addr: Option<String> },
    /// adb disconnect
    Disconnect,
    /// List installed packages
    Packages,
    Uninstall {
        package_id: String,
        /// Keep data and cache directories
        #[arg(long)]
        keep_data: bool,
    },
    /// Copy a file into the guest
    Push { local: PathBuf, remote: String },
    /// Run a shell command in the guest
    Shell {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Dump recent log lines
    Logcat {
        #[arg(long, default_value_t = 200)]
        lines: u32,
    },
    /// Talk to the guest agent
    Agent {
        /// Agent address (overrides SIDEPORT_AGENT_ADDR and config.json)
        #[arg(long)]
        addr: Option<String>,
        #[command(subcommand)]
        cmd: AgentCmd,
    },
}

#[derive(Subcommand)]
enum AgentCmd {
    Ping,
    Tap {
        x: i32,
        y: i32,
        /// Hold time in milliseconds
        #[arg(long)]
        duration: Option<u64>,
    },
    Swipe {
        start_x: i32,
        start_y: i32,
        end_x: i32,
        end_y: i32,
        #[arg(long)]
        duration: Option<u64>,
    },
    /// Simultaneous touches, each given as X,Y
    MultiTouch {
        #[arg(required = true, value_parser = parse_point)]
        points: Vec<Point>,
        #[arg(long)]
        duration: Option<u64>,
    },
    Status,
}

fn parse_point(value: &str) -> Result<Point, String> {
    let (x, y) = value
        .split_once(',')
        .ok_or_else(|| format!("expected X,Y, got {value:?}"))?;
    let coord = |s: &str| {
        s.trim()
            .parse::<i32>()
            .map_err(|e| format!("bad coordinate {s:?}: {e}"))
    };
    Ok(Point {
        x: coord(x)?,
        y: coord(y)?,
    })
}

struct Context {
    settings: Settings,
    serial: Option<String>,
    json: bool,
}

impl Context {
    fn bridge(&self) -> AdbBridge {
        let bridge = match &self.settings.adb_path {
            Some(path) => AdbBridge::with_adb_path(path),
            None => AdbBridge::new(),
        };
        match &self.serial {
            Some(serial) => bridge.with_serial(serial),
            None => bridge,
        }
    }

    /// Bridge for an install. A guest we start is only ever reached at its own
    /// address, so it pins the bridge unless `--serial` already did.
    fn install_bridge(&self, guest_addr: &str, start_cmd: Option<&str>) -> AdbBridge {
        match (&self.serial, start_cmd) {
            (None, Some(_)) => self.bridge().with_serial(guest_addr),
            _ => self.bridge(),
        }
    }

    fn print<T: Serialize>(&self, value: &T, human: impl FnOnce(&T)) -> Result<(), Failure> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            human(value);
        }
        Ok(())
    }
}

async fn blocking<T, F>(f: F) -> Result<T, Failure>
where
    F: FnOnce() -> Result<T, Failure> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Failure::new("internal", e.to_string()))?
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing()?;
    init_app_telemetry("sideport", env!("CARGO_PKG_VERSION"), "cli");

    let mut settings = Settings::load();
    if let Some(adb) = cli.adb {
        settings.adb_path = Some(adb);
    }
    tracing::debug!("settings from {}: {settings:?}", config_path().display());
    let ctx = Context {
        settings,
        serial: cli.serial,
        json: cli.json,
    };

    if let Err(failure) = run(&ctx, cli.cmd).await {
        eprintln!("{failure}");
        if let Some(detail) = failure.detail.as_deref() {
            eprintln!("{}", detail.trim_end());
        }
        // exit skips destructors; the writer must be drained first.
        finish_app_telemetry("cli", &failure.kind);
        std::process::exit(1);
    }
    finish_app_telemetry("cli", "ok");
    Ok(())
}

async fn run(ctx: &Context, cmd: Cmd) -> Result<(), Failure> {
    match cmd {
        Cmd::Install {
            source,
            profile,
            overrides,
            guest,
            start_cmd,
            boot_timeout_secs,
            downgrade,
            grant,
        } => {
            let profile = resolve_profile(
                profile.as_deref().unwrap_or(&ctx.settings.profile),
                overrides.into(),
            )?;
            let guest_addr = guest.unwrap_or_else(|| ctx.settings.guest_addr.clone());
            let start_cmd = start_cmd.or_else(|| ctx.settings.guest_start_cmd.clone());
            let bridge = ctx.install_bridge(&guest_addr, start_cmd.as_deref());
            let provisioner = provisioner_for(&guest_addr, start_cmd);
            let config = OrchestratorConfig {
                scratch_root: scratch_dir(),
                lock_dir: locks_dir(),
                boot_timeout: boot_timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(ctx.settings.boot_timeout),
                install_options: InstallOptions {
                    replace: true,
                    allow_downgrade: downgrade,
                    grant_permissions: grant,
                },
            };
            let orchestrator = Orchestrator::new(
                Arc::new(bridge),
                provisioner,
                Arc::new(SystemHost),
                config,
            );

            let snapshot = follow_install(&orchestrator, &source, profile, ctx.json).await?;
            for warning in &snapshot.warnings {
                eprintln!("warning: {warning}");
            }
            if ctx.json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            }
            match snapshot.failure {
                Some(failure) => Err(failure.into()),
                None => Ok(()),
            }
        }
        Cmd::Inspect { source } => {
            let descriptor = blocking(move || {
                let scratch = tempfile::tempdir()?;
                Ok(sideport_package::parse(&source, scratch.path())?)
            })
            .await?;
            ctx.print(&descriptor, |d| {
                println!("package:  {}", d.package_id());
                if d.has_placeholder_id() {
                    println!("          (derived from the file name)");
                }
                if let Some(name) = d.display_name() {
                    println!("name:     {name}");
                }
                if let Some(version) = d.version_name() {
                    println!("version:  {version}");
                }
                if let Some(code) = d.version_code() {
                    println!("code:     {code}");
                }
                if let Some(sdk) = d.min_sdk_version() {
                    println!("min sdk:  {sdk}");
                }
                println!("kind:     {}", d.source_kind().as_str());
                for unit in d.units() {
                    let name = unit.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
                    println!("unit:     {name}");
                }
                for aux in d.auxiliary_files() {
                    println!("aux:      {} -> {}", aux.file_name(), aux.remote_path());
                }
            })
        }
        Cmd::Profiles => ctx.print(&ResourceProfile::presets(), |presets| {
            for p in presets {
                println!(
                    "{:<12} {} cores  {} MB RAM  {} MB disk  {}x{} @{}Hz {}dpi",
                    p.name,
                    p.cpu_cores,
                    p.memory_mb,
                    p.storage_mb,
                    p.display.width,
                    p.display.height,
                    p.display.refresh_rate,
                    p.display.density
                );
            }
        }),
        Cmd::Validate { profile, overrides } => {
            let profile = resolve_profile(
                profile.as_deref().unwrap_or(&ctx.settings.profile),
                overrides.into(),
            )?;
            let host = HostCapacity::detect();
            #[derive(Serialize)]
            struct Report<'a> {
                profile: &'a ResourceProfile,
                host: HostCapacity,
                usable_memory_mb: u64,
            }
            ctx.print(
                &Report {
                    profile: &profile,
                    host,
                    usable_memory_mb: host.usable_memory_mb(),
                },
                |r| {
                    println!(
                        "host: {} cores, {} MB RAM ({} MB usable)",
                        r.host.logical_cores, r.host.memory_mb, r.usable_memory_mb
                    );
                },
            )?;
            validate(&profile, &host)?;
            if !ctx.json {
                println!("profile {} fits", profile.name);
            }
            Ok(())
        }
        Cmd::Devices => {
            let devices = ctx.bridge().list_devices().await?;
            ctx.print(&devices, |devices| {
                if devices.is_empty() {
                    println!("no devices");
                }
                for d in devices {
                    println!("{}\t{}", d.identifier, d.status.as_str());
                }
            })
        }
        Cmd::Connect { addr } => {
            let addr = addr.unwrap_or_else(|| ctx.settings.guest_addr.clone());
            let serial = ctx.bridge().connect(&addr).await?;
            println!("connected to {serial}");
            Ok(())
        }
        Cmd::Disconnect => {
            ctx.bridge().disconnect().await?;
            Ok(())
        }
        Cmd::Packages => {
            let packages = ctx.bridge().list_packages().await?;
            ctx.print(&packages, |packages| {
                for p in packages {
                    println!("{p}");
                }
            })
        }
        Cmd::Uninstall {
            package_id,
            keep_data,
        } => {
            ctx.bridge().uninstall(&package_id, keep_data).await?;
            println!("uninstalled {package_id}");
            Ok(())
        }
        Cmd::Push { local, remote } => {
            let outcome = ctx.bridge().push_file(&local, &remote).await?;
            match outcome.bytes {
                Some(bytes) => println!("pushed {bytes} bytes to {remote}"),
                None => println!("pushed to {remote}"),
            }
            Ok(())
        }
        Cmd::Shell { command } => {
            let output = ctx.bridge().run_shell(&command.join(" ")).await?;
            print!("{output}");
            Ok(())
        }
        Cmd::Logcat { lines } => {
            let output = ctx.bridge().logcat(lines).await?;
            print!("{output}");
            Ok(())
        }
        Cmd::Agent { addr, cmd } => {
            let addr = addr.unwrap_or_else(|| ctx.settings.agent_addr.clone());
            run_agent(ctx, &addr, cmd).await
        }
    }
}

async fn run_agent(ctx: &Context, addr: &str, cmd: AgentCmd) -> Result<(), Failure> {
    let request = match cmd {
        AgentCmd::Ping => Request::Ping,
        AgentCmd::Tap { x, y, duration } => Request::Tap { x, y, duration },
        AgentCmd::Swipe {
            start_x,
            start_y,
            end_x,
            end_y,
            duration,
        } => Request::Swipe {
            start_x,
            start_y,
            end_x,
            end_y,
            duration,
        },
        AgentCmd::MultiTouch { points, duration } => Request::MultiTouch { points, duration },
        AgentCmd::Status => Request::Status,
    };

    let mut client = AgentClient::connect(addr).await?;
    if let Response::Welcome { version, .. } = client.welcome() {
        tracing::debug!("agent {addr} version {version}");
    }
    let response = client.request(&request).await?;
    ctx.print(&response, |r| println!("{}", serde_json::to_string(r).unwrap_or_default()))?;

    match response {
        Response::Error { message } => Err(Failure::new("agent.error", message)),
        Response::TapResponse { success: false, .. }
        | Response::SwipeResponse { success: false, .. }
        | Response::MultiTouchResponse { success: false, .. } => Err(Failure::new(
            "agent.gesture_failed",
            "the guest agent could not inject the gesture",
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(serial: Option<&str>) -> Context {
        let mut settings = Settings::resolve(Default::default(), |_| None);
        settings.adb_path = Some(PathBuf::from("adb"));
        Context {
            settings,
            serial: serial.map(str::to_string),
            json: false,
        }
    }

    #[test]
    fn install_bridge_pins_managed_guests() {
        let managed = context(None).install_bridge("localhost:6521", Some("launch_cvd"));
        assert_eq!(managed.pinned_serial(), Some("127.0.0.1:6521"));

        let attached = context(None).install_bridge("localhost:6521", None);
        assert_eq!(attached.pinned_serial(), None);

        let explicit =
            context(Some("emulator-5554")).install_bridge("localhost:6521", Some("launch_cvd"));
        assert_eq!(explicit.pinned_serial(), Some("emulator-5554"));
    }

    #[test]
    fn points_parse_from_pairs() {
        assert_eq!(parse_point("10, 20"), Ok(Point { x: 10, y: 20 }));
        assert!(parse_point("10").is_err());
        assert!(parse_point("a,1").is_err());
    }

    #[test]
    fn cli_parses_nested_agent_commands() {
        let cli = Cli::try_parse_from([
            "sideport",
            "agent",
            "--addr",
            "127.0.0.1:9100",
            "multi-touch",
            "1,2",
            "3,4",
            "--duration",
            "80",
        ])
        .unwrap();
        match cli.cmd {
            Cmd::Agent {
                addr,
                cmd: AgentCmd::MultiTouch { points, duration },
            } => {
                assert_eq!(addr.as_deref(), Some("127.0.0.1:9100"));
                assert_eq!(points.len(), 2);
                assert_eq!(duration, Some(80));
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn install_accepts_profile_overrides() {
        let cli = Cli::try_parse_from([
            "sideport",
            "install",
            "game.xapk",
            "--profile",
            "minimal",
            "--memory-mb",
            "3072",
            "--downgrade",
            "--json",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.cmd {
            Cmd::Install {
                source,
                profile,
                overrides,
                downgrade,
                grant,
                ..
            } => {
                assert_eq!(source, PathBuf::from("game.xapk"));
                assert_eq!(profile.as_deref(), Some("minimal"));
                assert_eq!(overrides.memory_mb, Some(3072));
                assert!(downgrade);
                assert!(!grant);
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn shell_keeps_trailing_arguments() {
        let cli = Cli::try_parse_from(["sideport", "shell", "ls", "-la", "/sdcard"]).unwrap();
        match cli.cmd {
            Cmd::Shell { command } => assert_eq!(command, ["ls", "-la", "/sdcard"]),
            _ => panic!("wrong command"),
        }
    }
}
