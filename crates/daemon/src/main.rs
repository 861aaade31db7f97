//! TermHub
//!
//! Session daemon and command-line client.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// TermHub - run and observe shell sessions through a local daemon.
#[derive(Parser, Debug)]
#[command(name = "termhub")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the daemon in the foreground
    Serve,

    /// Start a session on the daemon
    Run {
        /// Working directory (defaults to the current directory)
        #[arg(long, short)]
        workspace: Option<PathBuf>,

        /// Stream output until the session ends and exit with its code
        #[arg(long, short)]
        follow: bool,

        /// Command to run; omit for an interactive login shell
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// List sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Print a session's output
    Tail {
        /// Session ID
        session_id: String,

        /// Only print entries after this sequence number
        #[arg(long, default_value = "0")]
        since: u64,

        /// Keep streaming until the session ends
        #[arg(long, short)]
        follow: bool,
    },

    /// Send input to a session
    Send {
        /// Session ID
        session_id: String,

        /// Text to send
        text: String,

        /// Do not append a newline
        #[arg(long, short = 'n')]
        no_newline: bool,
    },

    /// Resize a PTY session
    Resize {
        /// Session ID
        session_id: String,
        /// Rows
        rows: u16,
        /// Columns
        cols: u16,
    },

    /// Send a signal to a session
    Signal {
        /// Session ID
        session_id: String,

        /// Signal name or number, e.g. INT, SIGUSR1, 15
        signal: String,
    },

    /// Gracefully stop a session
    Cancel {
        /// Session ID
        session_id: String,
    },

    /// Immediately stop a session
    Kill {
        /// Session ID
        session_id: String,
    },

    /// Release a finished session
    Cleanup {
        /// Session ID
        session_id: String,
    },

    /// Check whether the daemon is running
    Ping,

    /// Stop the daemon
    Stop,
}

#[cfg(not(unix))]
fn main() {
    let _ = Cli::parse();
    eprintln!("termhub requires Unix domain sockets and is not supported on this platform");
    std::process::exit(1);
}

#[cfg(unix)]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(config_path) => daemon::Config::load(config_path)?,
        None => daemon::Config::load_default()?,
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Validate configuration
    config.validate()?;

    // Initialize tracing
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.clone()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Some(config_path) = &cli.config {
        tracing::debug!("Using config file: {:?}", config_path);
    }

    let code = cli::run(cli.command, config).await?;
    std::process::exit(code);
}

#[cfg(unix)]
mod cli {
    use std::sync::Arc;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use daemon::ipc::{self, socket_path_for, IpcClient, IpcServer};
    use daemon::protocol::{OutputEntry, SessionEvent, SessionSnapshot, SessionStatus};
    use daemon::{parse_signal, Config, SessionRegistry};
    use tokio_util::sync::CancellationToken;

    use super::Commands;

    /// Executes a command and returns the process exit code.
    pub async fn run(command: Commands, config: Config) -> anyhow::Result<i32> {
        match command {
            Commands::Serve => {
                serve(config).await?;
                Ok(0)
            }
            Commands::Run {
                workspace,
                follow,
                command,
            } => {
                let workspace = match workspace {
                    Some(path) => path,
                    None => std::env::current_dir()?,
                };
                let mut client = connect(&config).await?;
                let session_id = client
                    .create(&workspace.to_string_lossy(), &command.join(" "))
                    .await?;

                if !follow {
                    println!("{}", session_id);
                    return Ok(0);
                }

                eprintln!("session {}", session_id);
                follow_session(&config, &session_id, 0).await
            }
            Commands::List { json } => {
                let sessions = connect(&config).await?.list_sessions().await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&sessions)?);
                } else {
                    print_sessions_table(&sessions);
                }
                Ok(0)
            }
            Commands::Tail {
                session_id,
                since,
                follow,
            } => {
                if follow {
                    return follow_session(&config, &session_id, since).await;
                }

                let mut client = connect(&config).await?;
                if client.get_session(&session_id).await?.is_none() {
                    anyhow::bail!("Unknown session: {}", session_id);
                }
                for entry in client.buffer_since(&session_id, since).await? {
                    print_entry(&entry);
                }
                Ok(0)
            }
            Commands::Send {
                session_id,
                text,
                no_newline,
            } => {
                let data = if no_newline { text } else { format!("{}\n", text) };
                let ok = connect(&config).await?.write(&session_id, &data).await?;
                report(ok, "write", &session_id)
            }
            Commands::Resize {
                session_id,
                rows,
                cols,
            } => {
                let ok = connect(&config).await?.resize(&session_id, rows, cols).await?;
                report(ok, "resize", &session_id)
            }
            Commands::Signal { session_id, signal } => {
                let signal_num = parse_signal(&signal)?;
                let ok = connect(&config).await?.signal(&session_id, signal_num).await?;
                report(ok, "signal", &session_id)
            }
            Commands::Cancel { session_id } => {
                let ok = connect(&config).await?.cancel(&session_id).await?;
                report(ok, "cancel", &session_id)
            }
            Commands::Kill { session_id } => {
                let ok = connect(&config).await?.kill(&session_id).await?;
                report(ok, "kill", &session_id)
            }
            Commands::Cleanup { session_id } => {
                let ok = connect(&config).await?.cleanup(&session_id).await?;
                report(ok, "clean up", &session_id)
            }
            Commands::Ping => {
                if ping_daemon(&config).await {
                    println!("Daemon is running");
                    Ok(0)
                } else {
                    println!("Daemon is not running");
                    Ok(1)
                }
            }
            Commands::Stop => {
                connect(&config).await?.stop().await?;
                println!("Daemon stopping");
                Ok(0)
            }
        }
    }

    async fn connect(config: &Config) -> anyhow::Result<IpcClient> {
        let socket_path = socket_path_for(config);
        IpcClient::connect_with_timeout(&socket_path, Duration::from_secs(5))
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "Daemon is not running (cannot connect to {})",
                    socket_path.display()
                )
            })
    }

    /// Returns true if a daemon answers on the configured socket.
    pub(crate) async fn ping_daemon(config: &Config) -> bool {
        match connect(config).await {
            Ok(mut client) => client.ping().await.unwrap_or(false),
            Err(_) => false,
        }
    }

    fn report(ok: bool, action: &str, session_id: &str) -> anyhow::Result<i32> {
        if ok {
            Ok(0)
        } else {
            eprintln!("Could not {} session {}", action, session_id);
            Ok(1)
        }
    }

    /// Runs the daemon until SIGTERM, SIGINT or a `Stop` request.
    async fn serve(config: Config) -> anyhow::Result<()> {
        let socket_path = socket_path_for(&config);

        // Check for existing daemon BEFORE binding
        if IpcClient::connect_with_timeout(&socket_path, Duration::from_secs(1))
            .await
            .is_ok()
        {
            anyhow::bail!("Daemon already running at {}", socket_path.display());
        }

        tracing::info!("TermHub daemon starting...");

        let registry = Arc::new(SessionRegistry::from_config(&config));
        let server = IpcServer::bind(&socket_path).await?;
        let shutdown = CancellationToken::new();

        let signal_token = shutdown.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            signal_token.cancel();
        });

        ipc::serve(server, Arc::clone(&registry), shutdown).await?;

        let released = registry.shutdown().await;
        tracing::info!(sessions = released, "TermHub daemon stopped");
        Ok(())
    }

    /// Wait for a shutdown signal (SIGTERM or SIGINT).
    async fn wait_for_shutdown_signal() {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::error!(error = %e, "Failed to register signal handlers");
                    std::future::pending::<()>().await;
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT");
            }
        }
    }

    /// Interval between catch-up polls once the event stream is gone.
    const CATCH_UP_INTERVAL: Duration = Duration::from_millis(100);

    /// Prints history after `since`, then live output until the session ends.
    ///
    /// Subscribes before reading history so nothing falls in between. If
    /// the daemon drops the stream before the exit event (a subscriber that
    /// falls behind is disconnected), the rest is recovered by polling.
    pub(crate) async fn follow_session(config: &Config, session_id: &str, since: u64) -> anyhow::Result<i32> {
        let mut events = connect(config).await?;
        events.subscribe(session_id).await?;

        let mut last_seq = since;
        let mut client = connect(config).await?;
        for entry in client.buffer_since(session_id, since).await? {
            print_entry(&entry);
            last_seq = entry.seq;
        }

        while let Some(event) = events.next_event().await? {
            match event {
                SessionEvent::Output(entry) if entry.seq > last_seq => {
                    print_entry(&entry);
                    last_seq = entry.seq;
                }
                SessionEvent::Output(_) | SessionEvent::Media(_) => {}
                SessionEvent::Exited {
                    status,
                    return_code,
                } => return Ok(report_exit(session_id, status, return_code)),
            }
        }

        tracing::debug!(session_id = %session_id, last_seq, "Event stream closed early, polling");
        let (status, return_code) =
            catch_up(&mut client, session_id, last_seq, CATCH_UP_INTERVAL, print_entry).await?;
        Ok(report_exit(session_id, status, return_code))
    }

    /// Polls output after `last_seq` until the session reaches a terminal status.
    ///
    /// The snapshot is read before the buffer on every round, so once it
    /// reports a terminal status the buffer read that follows is complete.
    pub(crate) async fn catch_up<F>(
        client: &mut IpcClient,
        session_id: &str,
        mut last_seq: u64,
        interval: Duration,
        mut emit: F,
    ) -> anyhow::Result<(SessionStatus, Option<i32>)>
    where
        F: FnMut(&OutputEntry),
    {
        loop {
            let Some(snapshot) = client.get_session(session_id).await? else {
                anyhow::bail!("Session {} was removed before it finished", session_id);
            };

            for entry in client.buffer_since(session_id, last_seq).await? {
                emit(&entry);
                last_seq = entry.seq;
            }

            if snapshot.status.is_terminal() {
                return Ok((snapshot.status, snapshot.return_code));
            }
            tokio::time::sleep(interval).await;
        }
    }

    fn report_exit(session_id: &str, status: SessionStatus, return_code: Option<i32>) -> i32 {
        eprintln!(
            "session {} {} (exit code {})",
            session_id,
            status,
            return_code.map_or_else(|| "-".to_string(), |c| c.to_string())
        );
        return_code.unwrap_or(1)
    }

    fn print_entry(entry: &OutputEntry) {
        use std::io::Write;

        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(entry.text.as_bytes());
        let _ = stdout.flush();
    }

    /// Print sessions in a formatted ASCII table.
    pub(crate) fn print_sessions_table(sessions: &[SessionSnapshot]) {
        if sessions.is_empty() {
            println!("No sessions.");
            return;
        }

        let id_width = sessions.iter().map(|s| s.id.len()).max().unwrap_or(8).max(8);

        println!(
            "{:<id_width$}  {:<9}  {:>4}  {:<7}  {:>8}  COMMAND",
            "ID",
            "STATUS",
            "CODE",
            "BACKEND",
            "CREATED",
            id_width = id_width
        );
        println!("{}", "-".repeat(id_width + 50));

        for session in sessions {
            let code = session
                .return_code
                .map_or_else(|| "-".to_string(), |c| c.to_string());
            let command = if session.command.is_empty() {
                "(shell)"
            } else {
                session.command.as_str()
            };

            println!(
                "{:<id_width$}  {:<9}  {:>4}  {:<7}  {:>8}  {}",
                session.id,
                session.status,
                code,
                session.backend,
                format_relative_time(session.created_at),
                truncate_str(command, 40),
                id_width = id_width
            );
        }

        println!();
        println!("Total: {} session(s)", sessions.len());
    }

    /// Format a Unix timestamp in milliseconds as relative time (e.g., "5m ago").
    pub(crate) fn format_relative_time(timestamp_ms: u64) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let elapsed = now.saturating_sub(timestamp_ms) / 1000;

        if elapsed < 60 {
            format!("{}s ago", elapsed)
        } else if elapsed < 3600 {
            format!("{}m ago", elapsed / 60)
        } else if elapsed < 86400 {
            format!("{}h ago", elapsed / 3600)
        } else {
            format!("{}d ago", elapsed / 86400)
        }
    }

    /// Truncate a string to a maximum number of characters, adding "..." if truncated.
    pub(crate) fn truncate_str(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{}...", kept)
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use daemon::config::BackendPreference;
    use daemon::ipc::{self, IpcClient, IpcServer};
    use daemon::protocol::SessionStatus;
    use daemon::{Config, SessionRegistry};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn daemon_config(temp_dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.daemon.socket_path = Some(temp_dir.path().join("daemon.sock"));
        config.session.default_shell = "/bin/sh".to_string();
        config.session.backend = BackendPreference::Pipe;
        config.session.poll_interval_ms = 10;
        config
    }

    async fn start_daemon(config: &Config) -> CancellationToken {
        let shutdown = CancellationToken::new();
        let registry = Arc::new(SessionRegistry::from_config(config));
        let server = IpcServer::bind(&ipc::socket_path_for(config)).await.unwrap();
        tokio::spawn(ipc::serve(server, registry, shutdown.clone()));
        shutdown
    }

    #[test]
    fn test_cli_debug_assert() {
        // Verify the CLI structure is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_command() {
        let cli = Cli::try_parse_from(["termhub", "serve"]).unwrap();
        assert!(matches!(cli.command, Commands::Serve));
    }

    #[test]
    fn test_run_collects_trailing_command() {
        let cli = Cli::try_parse_from(["termhub", "run", "-w", "/tmp", "ls", "-la", "/"]).unwrap();
        match cli.command {
            Commands::Run {
                workspace,
                follow,
                command,
            } => {
                assert_eq!(workspace, Some(PathBuf::from("/tmp")));
                assert!(!follow);
                assert_eq!(command, vec!["ls", "-la", "/"]);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_without_command_is_shell() {
        let cli = Cli::try_parse_from(["termhub", "run", "--follow"]).unwrap();
        match cli.command {
            Commands::Run { follow, command, .. } => {
                assert!(follow);
                assert!(command.is_empty());
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_list_json() {
        let cli = Cli::try_parse_from(["termhub", "list", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::List { json: true }));
    }

    #[test]
    fn test_tail_options() {
        let cli = Cli::try_parse_from(["termhub", "tail", "abc", "--since", "7", "-f"]).unwrap();
        match cli.command {
            Commands::Tail {
                session_id,
                since,
                follow,
            } => {
                assert_eq!(session_id, "abc");
                assert_eq!(since, 7);
                assert!(follow);
            }
            _ => panic!("Expected Tail command"),
        }
    }

    #[test]
    fn test_send_no_newline() {
        let cli = Cli::try_parse_from(["termhub", "send", "abc", "y", "-n"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Send { no_newline: true, .. }
        ));
    }

    #[test]
    fn test_signal_requires_signal() {
        assert!(Cli::try_parse_from(["termhub", "signal", "abc"]).is_err());
        let cli = Cli::try_parse_from(["termhub", "signal", "abc", "SIGINT"]).unwrap();
        match cli.command {
            Commands::Signal { signal, .. } => assert_eq!(signal, "SIGINT"),
            _ => panic!("Expected Signal command"),
        }
    }

    #[test]
    fn test_resize_requires_numbers() {
        assert!(Cli::try_parse_from(["termhub", "resize", "abc", "x", "80"]).is_err());
        assert!(Cli::try_parse_from(["termhub", "resize", "abc", "24", "80"]).is_ok());
    }

    #[test]
    fn test_global_flags_after_command() {
        let cli = Cli::try_parse_from(["termhub", "ping", "-v", "-c", "/etc/termhub.toml"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/termhub.toml")));
    }

    #[test]
    fn test_missing_subcommand_fails() {
        assert!(Cli::try_parse_from(["termhub"]).is_err());
    }

    #[test]
    fn test_truncate_str() {
        assert_eq!(cli::truncate_str("short", 10), "short");
        assert_eq!(cli::truncate_str("a long command line", 10), "a long ...");
        assert_eq!(cli::truncate_str("ééééééé", 5), "éé...");
    }

    #[test]
    fn test_format_relative_time() {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        assert_eq!(cli::format_relative_time(now), "0s ago");
        assert_eq!(cli::format_relative_time(now - 120_000), "2m ago");
        assert_eq!(cli::format_relative_time(now - 7_200_000), "2h ago");
    }

    #[tokio::test]
    async fn test_ping_without_daemon() {
        let temp_dir = TempDir::new().unwrap();
        let config = daemon_config(&temp_dir);
        assert!(!cli::ping_daemon(&config).await);
    }

    #[tokio::test]
    async fn test_ping_running_daemon() {
        let temp_dir = TempDir::new().unwrap();
        let config = daemon_config(&temp_dir);
        let shutdown = start_daemon(&config).await;

        assert!(cli::ping_daemon(&config).await);
        assert_eq!(cli::run(Commands::Ping, config).await.unwrap(), 0);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_catch_up_polls_until_finished() {
        let temp_dir = TempDir::new().unwrap();
        let config = daemon_config(&temp_dir);
        let shutdown = start_daemon(&config).await;

        let mut client = IpcClient::connect(&ipc::socket_path_for(&config)).await.unwrap();
        let id = client
            .create(
                temp_dir.path().to_str().unwrap(),
                "echo first; sleep 0.3; echo second; exit 5",
            )
            .await
            .unwrap();

        let mut text = String::new();
        let (status, return_code) = cli::catch_up(
            &mut client,
            &id,
            0,
            Duration::from_millis(20),
            |entry| text.push_str(&entry.text),
        )
        .await
        .unwrap();

        assert_eq!(status, SessionStatus::Failed);
        assert_eq!(return_code, Some(5));
        assert!(text.contains("first") && text.contains("second"), "got {text:?}");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_catch_up_unknown_session_fails() {
        let temp_dir = TempDir::new().unwrap();
        let config = daemon_config(&temp_dir);
        let shutdown = start_daemon(&config).await;

        let mut client = IpcClient::connect(&ipc::socket_path_for(&config)).await.unwrap();
        let result = cli::catch_up(&mut client, "missing", 0, Duration::from_millis(20), |_| {}).await;
        assert!(result.is_err());
        shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_follow_reports_exit_code_when_subscriber_falls_behind() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = daemon_config(&temp_dir);
        config.session.subscriber_capacity = 1;
        let shutdown = start_daemon(&config).await;

        let mut client = IpcClient::connect(&ipc::socket_path_for(&config)).await.unwrap();
        let id = client
            .create(
                temp_dir.path().to_str().unwrap(),
                "sleep 0.2; i=0; while [ $i -lt 2000 ]; do echo line_$i; i=$((i+1)); done; exit 3",
            )
            .await
            .unwrap();

        let code = cli::follow_session(&config, &id, 0).await.unwrap();
        assert_eq!(code, 3);
        shutdown.cancel();
    }
}
