//! Daemon management for Hostwarden

use crate::config::Config;
use crate::detector::{Event, Finding};
use crate::scheduler::EngineKind;
use crate::store::{ConfigEdit, Section};
use crate::Agent;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;
use tracing::{error, info, warn};

/// Largest accepted IPC frame
const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Commands that can be sent to the daemon
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Command {
    /// Get current status
    Status,
    /// Start one engine loop
    EngineStart(EngineKind),
    /// Stop one engine loop, leaving the others running
    EngineStop(EngineKind),
    /// Run a cycle of one engine now
    EngineRun(EngineKind),
    /// Apply a policy edit
    Edit(ConfigEdit),
    /// Re-read a policy file edited by hand
    Reload(Section),
    /// List accumulated scanner findings
    Findings,
    /// Forget all scanner findings
    ClearFindings,
    /// Lift flapping suppression for a service
    ClearService(String),
    /// Shutdown the daemon
    Shutdown,
}

/// Response from daemon
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Response {
    Ok,
    Error(String),
    Status(DaemonStatus),
    Events(Vec<Event>),
    Findings(Vec<Finding>),
    Revision(u64),
}

/// Daemon status information
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: u32,
    pub uptime_secs: u64,
    pub policy_revision: u64,
    pub engines: Vec<(EngineKind, bool)>,
    pub monitored_paths: usize,
    pub monitored_services: usize,
    pub findings: usize,
    pub recent_events: Vec<Event>,
}

/// Detach from the terminal. Must run before the async runtime starts.
pub fn daemonize(config: &Config) -> anyhow::Result<()> {
    use daemonize::Daemonize;

    if let Some(parent) = config.daemon.log_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let stdout = std::fs::File::create(&config.daemon.log_file)?;
    let stderr = stdout.try_clone()?;

    let daemonize = Daemonize::new()
        .pid_file(&config.daemon.pid_file)
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr);

    daemonize.start()?;

    Ok(())
}

/// Run the Hostwarden daemon until SIGTERM, SIGINT or a shutdown command
pub async fn start(config: Config) -> anyhow::Result<()> {
    // Check if already running
    if is_running(&config) && read_pid_file(&config.daemon.pid_file)? != std::process::id() {
        anyhow::bail!("Hostwarden is already running");
    }

    let agent = Arc::new(Agent::new(config.clone())?);

    // Write PID file
    write_pid_file(&config.daemon.pid_file)?;

    // Setup signal handlers
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    // Create Unix socket for IPC
    let _ = std::fs::remove_file(&config.daemon.socket);
    let listener = UnixListener::bind(&config.daemon.socket)?;

    info!("Hostwarden daemon started, listening on {:?}", config.daemon.socket);

    agent.start().await;

    let started = Instant::now();
    let shutdown = Arc::new(Notify::new());

    // Main event loop
    loop {
        tokio::select! {
            // Handle incoming IPC commands
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let agent = agent.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, &agent, started, &shutdown).await {
                            warn!("IPC client error: {}", e);
                        }
                    });
                }
                Err(e) => error!("Failed to accept IPC connection: {}", e),
            },

            _ = shutdown.notified() => {
                info!("Shutdown requested over IPC");
                break;
            }

            // Handle SIGTERM
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                break;
            }

            // Handle SIGINT
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down...");
                break;
            }
        }
    }

    agent.shutdown().await;

    // Cleanup
    cleanup(&config);

    Ok(())
}

/// Stop the Hostwarden daemon
pub async fn stop(config: &Config) -> anyhow::Result<()> {
    if !is_running(config) {
        println!("Hostwarden is not running");
        return Ok(());
    }

    // Read PID and send SIGTERM
    let pid = read_pid_file(&config.daemon.pid_file)?;

    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGTERM,
    )?;

    println!("Sent shutdown signal to Hostwarden (PID {})", pid);

    // Wait for process to exit
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        if !is_running(config) {
            println!("Hostwarden stopped");
            return Ok(());
        }
    }

    warn!("Hostwarden did not stop gracefully, sending SIGKILL");
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGKILL,
    )?;
    cleanup(config);

    Ok(())
}

/// Check daemon status
pub async fn status(config: &Config) -> anyhow::Result<()> {
    if !is_running(config) {
        println!("Hostwarden is not running");
        return Ok(());
    }

    // Connect to daemon and get status
    match send_command(config, Command::Status).await {
        Ok(response) => print_response(&response),
        Err(e) => println!("Hostwarden is running but not responding: {}", e),
    }

    Ok(())
}

/// Send a command to the running daemon and wait for its response
pub async fn send_command(config: &Config, cmd: Command) -> anyhow::Result<Response> {
    let mut stream = UnixStream::connect(&config.daemon.socket).await?;

    write_frame(&mut stream, &serde_json::to_vec(&cmd)?).await?;
    let response_bytes = read_frame(&mut stream).await?;

    Ok(serde_json::from_slice(&response_bytes)?)
}

/// Print a daemon response for the terminal
pub fn print_response(response: &Response) {
    match response {
        Response::Ok => println!("OK"),
        Response::Error(e) => println!("Error: {}", e),
        Response::Status(status) => print_status(status),
        Response::Events(events) => print_events(events),
        Response::Findings(findings) => print_findings(findings),
        Response::Revision(revision) => println!("Policy updated (revision {})", revision),
    }
}

pub fn print_events(events: &[Event]) {
    if events.is_empty() {
        println!("No events");
    }
    for event in events {
        println!("{}", event);
    }
}

pub fn print_findings(findings: &[Finding]) {
    if findings.is_empty() {
        println!("No findings");
        return;
    }
    for finding in findings {
        println!(
            "{}  {:<12} {:<20} {}",
            finding.timestamp.format("%Y-%m-%d %H:%M:%S"),
            finding.category,
            finding.keyword,
            finding.file.display()
        );
    }
}

/// Show the event log
pub async fn show_logs(config: &Config, lines: usize, follow: bool) -> anyhow::Result<()> {
    let log_path = &config.daemon.event_log;

    if !log_path.exists() {
        println!("No event log found at {:?}", log_path);
        return Ok(());
    }

    if follow {
        // Use tail -f equivalent
        let mut cmd = tokio::process::Command::new("tail")
            .args(["-f", "-n", &lines.to_string()])
            .arg(log_path)
            .spawn()?;

        cmd.wait().await?;
    } else {
        // Just print last N lines
        let output = tokio::process::Command::new("tail")
            .args(["-n", &lines.to_string()])
            .arg(log_path)
            .output()
            .await?;

        print!("{}", String::from_utf8_lossy(&output.stdout));
    }

    Ok(())
}

/// Whether a live daemon owns the pid file
pub fn is_running(config: &Config) -> bool {
    if !config.daemon.pid_file.exists() {
        return false;
    }

    if let Ok(pid) = read_pid_file(&config.daemon.pid_file) {
        // Check if process exists
        let proc_path = format!("/proc/{}", pid);
        return Path::new(&proc_path).exists();
    }

    false
}

/// Refuse an offline operation on state the running daemon owns
pub fn ensure_stopped(config: &Config, action: &str) -> anyhow::Result<()> {
    if is_running(config) {
        anyhow::bail!("Hostwarden is running; stop it before you {}", action);
    }
    Ok(())
}

// Helper functions

async fn write_frame(stream: &mut UnixStream, payload: &[u8]) -> anyhow::Result<()> {
    let len = payload.len() as u32;
    stream.write_all(&len.to_le_bytes()).await?;
    stream.write_all(payload).await?;
    Ok(())
}

async fn read_frame(stream: &mut UnixStream) -> anyhow::Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME {
        anyhow::bail!("IPC frame of {} bytes exceeds limit", len);
    }

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

async fn handle_client(
    mut stream: UnixStream,
    agent: &Agent,
    started: Instant,
    shutdown: &Notify,
) -> anyhow::Result<()> {
    let cmd: Command = serde_json::from_slice(&read_frame(&mut stream).await?)?;

    let response = dispatch(cmd, agent, started, shutdown).await;

    write_frame(&mut stream, &serde_json::to_vec(&response)?).await
}

async fn dispatch(cmd: Command, agent: &Agent, started: Instant, shutdown: &Notify) -> Response {
    let coordinator = agent.coordinator();

    match cmd {
        Command::Status => {
            let policy = agent.store().snapshot();
            let recent = agent.log().recent();
            let skip = recent.len().saturating_sub(10);

            Response::Status(DaemonStatus {
                running: true,
                pid: std::process::id(),
                uptime_secs: started.elapsed().as_secs(),
                policy_revision: policy.revision,
                engines: coordinator.status().await,
                monitored_paths: policy.paths.len(),
                monitored_services: policy.services.len(),
                findings: agent.findings().len(),
                recent_events: recent.into_iter().skip(skip).collect(),
            })
        }
        Command::EngineStart(kind) => {
            if coordinator.start(kind).await {
                Response::Ok
            } else {
                Response::Error(format!("{} is already running", kind))
            }
        }
        Command::EngineStop(kind) => {
            if coordinator.stop(kind).await {
                Response::Ok
            } else {
                Response::Error(format!("{} is not running", kind))
            }
        }
        Command::EngineRun(kind) => match coordinator.run_once(kind).await {
            Some(events) => Response::Events(events),
            None => Response::Ok,
        },
        Command::Edit(edit) => match coordinator.apply_edit(&edit).await {
            Ok(policy) => Response::Revision(policy.revision),
            Err(e) => Response::Error(e.to_string()),
        },
        Command::Reload(section) => match coordinator.reload(section).await {
            Ok(policy) => Response::Revision(policy.revision),
            Err(e) => Response::Error(e.to_string()),
        },
        Command::Findings => Response::Findings(agent.findings().list()),
        Command::ClearFindings => {
            agent.findings().clear();
            Response::Ok
        }
        Command::ClearService(name) => {
            if coordinator.clear_service(&name).await {
                Response::Ok
            } else {
                Response::Error(format!("service {} is not monitored", name))
            }
        }
        Command::Shutdown => {
            shutdown.notify_one();
            Response::Ok
        }
    }
}

fn write_pid_file(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let pid = std::process::id();
    std::fs::write(path, pid.to_string())?;
    Ok(())
}

fn read_pid_file(path: &Path) -> anyhow::Result<u32> {
    let content = std::fs::read_to_string(path)?;
    let pid: u32 = content.trim().parse()?;
    Ok(pid)
}

fn cleanup(config: &Config) {
    let _ = std::fs::remove_file(&config.daemon.pid_file);
    let _ = std::fs::remove_file(&config.daemon.socket);
}

fn print_status(status: &DaemonStatus) {
    println!("Hostwarden Status");
    println!("───────────────────────────────");
    println!("Status:          {}", if status.running { "● Running" } else { "○ Stopped" });
    println!("PID:             {}", status.pid);
    println!("Uptime:          {} seconds", status.uptime_secs);
    println!("Policy revision: {}", status.policy_revision);
    println!("Engines:");
    for (kind, running) in &status.engines {
        println!("                 {} {}", if *running { "●" } else { "○" }, kind);
    }
    println!("Paths:           {}", status.monitored_paths);
    println!("Services:        {}", status.monitored_services);
    println!("Findings:        {}", status.findings);
    if !status.recent_events.is_empty() {
        println!("Recent events:");
        for event in &status.recent_events {
            println!("  {}", event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::testing::FakePlatform;
    use tempfile::tempdir;

    fn agent(dir: &Path) -> Agent {
        let mut config = Config::default();
        config.policy.paths = dir.join("paths.conf");
        config.policy.services = dir.join("services.conf");
        config.policy.patterns = dir.join("patterns.conf");
        config.policy.scan_dirs = dir.join("scan-dirs.conf");
        config.integrity.database = None;
        config.daemon.event_log = dir.join("events.log");
        for file in ["paths.conf", "services.conf", "patterns.conf", "scan-dirs.conf"] {
            std::fs::write(dir.join(file), "").unwrap();
        }
        std::fs::write(dir.join("services.conf"), "nginx\n").unwrap();

        Agent::with_platform(config, Arc::new(FakePlatform::new())).unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_edit_and_status() {
        let dir = tempdir().unwrap();
        let agent = agent(dir.path());
        let shutdown = Notify::new();
        let started = Instant::now();

        let edit = Command::Edit(ConfigEdit::Add {
            section: Section::Services,
            line: "sshd".to_string(),
        });
        match dispatch(edit, &agent, started, &shutdown).await {
            Response::Revision(revision) => assert_eq!(revision, 1),
            other => panic!("unexpected response {:?}", other),
        }
        assert_eq!(
            std::fs::read_to_string(dir.path().join("services.conf")).unwrap(),
            "nginx\nsshd\n"
        );

        match dispatch(Command::Status, &agent, started, &shutdown).await {
            Response::Status(status) => {
                assert_eq!(status.policy_revision, 1);
                assert_eq!(status.monitored_services, 2);
                assert!(status.engines.iter().all(|(_, running)| !running));
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dispatch_engine_control() {
        let dir = tempdir().unwrap();
        let agent = agent(dir.path());
        let shutdown = Notify::new();
        let started = Instant::now();

        let run = dispatch(Command::EngineRun(EngineKind::Watchdog), &agent, started, &shutdown).await;
        assert!(matches!(run, Response::Events(_)));

        let start = dispatch(Command::EngineStart(EngineKind::Scanner), &agent, started, &shutdown).await;
        assert!(matches!(start, Response::Ok));
        let again = dispatch(Command::EngineStart(EngineKind::Scanner), &agent, started, &shutdown).await;
        assert!(matches!(again, Response::Error(_)));

        let stop = dispatch(Command::EngineStop(EngineKind::Scanner), &agent, started, &shutdown).await;
        assert!(matches!(stop, Response::Ok));

        let bad = dispatch(
            Command::Edit(ConfigEdit::Remove {
                section: Section::Paths,
                index: 3,
            }),
            &agent,
            started,
            &shutdown,
        )
        .await;
        assert!(matches!(bad, Response::Error(_)));
    }

    #[test]
    fn test_offline_actions_refused_while_running() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.daemon.pid_file = dir.path().join("hostwarden.pid");

        assert!(ensure_stopped(&config, "record a baseline").is_ok());

        write_pid_file(&config.daemon.pid_file).unwrap();
        let err = ensure_stopped(&config, "record a baseline").unwrap_err();
        assert!(err.to_string().contains("record a baseline"));

        // A stale pid file does not count
        std::fs::write(&config.daemon.pid_file, u32::MAX.to_string()).unwrap();
        assert!(ensure_stopped(&config, "record a baseline").is_ok());
    }

    #[tokio::test]
    async fn test_ipc_round_trip() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("hw.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let agent = agent(dir.path());

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let shutdown = Notify::new();
            handle_client(stream, &agent, Instant::now(), &shutdown).await.unwrap();
        });

        let mut config = Config::default();
        config.daemon.socket = socket;
        let response = send_command(&config, Command::Findings).await.unwrap();
        assert!(matches!(response, Response::Findings(ref f) if f.is_empty()));

        server.await.unwrap();
    }
}
