//! CLI entry point for framecap.
//!
//! Thin front end over the library: wires configuration into the capture
//! server, hooks ctrl-c to the graceful-shutdown handle, and exposes the
//! validation engine and session listing for finished captures.

use anyhow::Result;
use clap::{Parser, Subcommand};
use framecap::config::Settings;
use framecap::error::CaptureError;
use framecap::network::server::CaptureServer;
use framecap::store;
use framecap::validate::{validate_session, ValidationReport};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "framecap")]
#[command(about = "Capture server for phone-to-workstation 3D scanning", long_about = None)]
struct Cli {
    /// Optional TOML config file (defaults apply without one)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the capture server
    Serve {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to bind to
        #[arg(long, short)]
        port: Option<u16>,

        /// Directory for saving captured sessions
        #[arg(long, short = 'd')]
        captures_dir: Option<PathBuf>,
    },

    /// Validate a capture session and print its quality report
    Validate {
        /// Session directory, or a session id under the captures directory
        session: Option<String>,

        /// Validate the most recent session
        #[arg(long)]
        latest: bool,

        /// Output the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// List recorded sessions, newest first
    Sessions,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve {
            host,
            port,
            captures_dir,
        } => {
            if let Some(host) = host {
                settings.server.host = host;
            }
            if let Some(port) = port {
                settings.server.port = port;
            }
            if let Some(dir) = captures_dir {
                settings.server.captures_dir = dir;
            }
            serve(settings).await
        }
        Commands::Validate {
            session,
            latest,
            json,
        } => validate_cmd(&settings, session, latest, json),
        Commands::Sessions => sessions_cmd(&settings),
    }
}

async fn serve(settings: Settings) -> Result<()> {
    let server = CaptureServer::bind(settings).await?;

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.shutdown();
        }
    });

    server.run().await?;
    Ok(())
}

fn validate_cmd(
    settings: &Settings,
    session: Option<String>,
    latest: bool,
    json: bool,
) -> Result<()> {
    let captures_dir = &settings.server.captures_dir;

    let session_path = if latest {
        store::list_sessions(captures_dir)?
            .into_iter()
            .next()
            .map(|s| s.path)
            .ok_or(CaptureError::NoSessions)?
    } else if let Some(session) = session {
        let direct = PathBuf::from(&session);
        if direct.exists() {
            direct
        } else {
            let nested = captures_dir.join(&session);
            if !nested.exists() {
                return Err(CaptureError::SessionNotFound(session).into());
            }
            nested
        }
    } else {
        anyhow::bail!("pass a session path or --latest");
    };

    let report = validate_session(&session_path, &settings.validation);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if !report.is_valid {
        std::process::exit(1);
    }
    Ok(())
}

fn print_report(report: &ValidationReport) {
    println!();
    println!("Session: {}", report.session_id);
    println!("{}", "=".repeat(50));

    println!("Frames:      {}", report.frame_count);
    println!("Duration:    {:.1}s", report.duration_sec);
    println!("Avg FPS:     {:.1}", report.avg_fps);
    if report.min_fps > 0.0 {
        println!("FPS Range:   {:.1} - {:.1}", report.min_fps, report.max_fps);
    }

    let res_status = if report.resolution_consistent {
        "consistent"
    } else {
        "INCONSISTENT"
    };
    println!(
        "Resolution:  {}x{} ({res_status})",
        report.width, report.height
    );

    if report.imu_records > 0 {
        let sync_status = if report.imu_synced {
            format!("offset: {:.1}ms", report.imu_avg_offset_ms)
        } else {
            "NOT SYNCED".to_string()
        };
        println!("IMU Records: {} ({sync_status})", report.imu_records);
    } else {
        println!("IMU Records: None");
    }

    if let Some(intrinsics) = &report.intrinsics {
        let fx = intrinsics.get("fx").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let fy = intrinsics.get("fy").and_then(|v| v.as_f64()).unwrap_or(0.0);
        println!("Intrinsics:  fx={fx:.0}, fy={fy:.0}");
    } else {
        println!("Intrinsics:  Not found");
    }

    println!();
    println!("Quality Score: {}/100", report.quality_score);
    println!();

    if !report.errors.is_empty() {
        println!("ERRORS:");
        for error in &report.errors {
            println!("  [X] {error}");
        }
    }
    if !report.warnings.is_empty() {
        println!("WARNINGS:");
        for warning in &report.warnings {
            println!("  [!] {warning}");
        }
    }
    if !report.info.is_empty() {
        println!("INFO:");
        for note in &report.info {
            println!("  [i] {note}");
        }
    }

    println!();
    let ready = if report.is_valid { "YES" } else { "NO" };
    println!("Ready for reconstruction: {ready}");
    println!();
}

fn sessions_cmd(settings: &Settings) -> Result<()> {
    let sessions = store::list_sessions(&settings.server.captures_dir)?;
    if sessions.is_empty() {
        println!(
            "No sessions found in {}",
            settings.server.captures_dir.display()
        );
        return Ok(());
    }

    println!("Available sessions:");
    for session in sessions {
        match &session.stats {
            Some(stats) => println!(
                "  {}  {} frames, {:.1}s, {:.1} fps",
                session.session_id, session.frame_count, stats.duration_sec, stats.fps
            ),
            None => println!(
                "  {}  {} frames (not cleanly ended)",
                session.session_id, session.frame_count
            ),
        }
    }
    Ok(())
}
