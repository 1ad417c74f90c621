use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use dashguard::clock::SystemClock;
use dashguard::guard::ProtectedEntry;
use dashguard::http::{ApiError, ReqwestTransport};
use dashguard::navigation::{MemoryNavigator, Navigator};
use dashguard::storage::FileStorage;
use dashguard::{AuthState, GuardConfig};
use serde_json::Value;

const SESSION_FILE: &str = "session.json";
const TAB_FILE: &str = "tab.json";
const WATCH_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("api request failed: {0}")]
    Api(#[from] ApiError),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("not signed in; run `dashguard login` first")]
    NotSignedIn,
}

#[derive(Parser, Debug)]
#[command(name = "dashguard", about = "Session lifecycle and route guard CLI")]
struct Cli {
    #[arg(long, env = "DASHGUARD_API_BASE_URL")]
    base_url: Option<String>,

    #[arg(long, env = "DASHGUARD_STATE_DIR", help = "Directory holding the persisted session")]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long, default_value_t = false)]
        remember: bool,
    },
    Logout,
    Status,
    Get {
        path: String,
        #[arg(long, default_value = "/dashboard", help = "Location the request is issued from")]
        from: String,
    },
    Watch {
        #[arg(long, default_value_t = 60)]
        seconds: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let mut config = GuardConfig::from_env();
    if let Some(base_url) = cli.base_url {
        config.api_base_url = base_url.trim().trim_end_matches('/').to_owned();
    }
    let state_dir = cli.state_dir.unwrap_or_else(default_state_dir);

    match cli.command {
        Command::Login { email, password, remember } => {
            let (state, _) = build_state(config, &state_dir, "/login")?;
            let destination = state.account.login(&email, &password, remember).await?;
            println!("{destination}");
            Ok(())
        }
        Command::Logout => {
            let (state, navigator) = build_state(config, &state_dir, "/dashboard")?;
            state.account.logout();
            println!("logged out; now at {}", navigator.location());
            Ok(())
        }
        Command::Status => {
            let (state, _) = build_state(config, &state_dir, "/dashboard")?;
            run_status(&state)
        }
        Command::Get { path, from } => {
            let (state, navigator) = build_state(config, &state_dir, &from)?;
            run_get(&state, &navigator, &path, &from).await
        }
        Command::Watch { seconds } => {
            let (state, navigator) = build_state(config, &state_dir, "/dashboard")?;
            run_watch(&state, &navigator, Duration::from_secs(seconds)).await
        }
    }
}

fn default_state_dir() -> PathBuf {
    dirs::data_dir().map_or_else(|| PathBuf::from(".dashguard"), |dir| dir.join("dashguard"))
}

fn build_state(
    config: GuardConfig,
    state_dir: &std::path::Path,
    location: &str,
) -> Result<(AuthState, Arc<MemoryNavigator>), CliError> {
    let transport =
        ReqwestTransport::with_timeouts(&config.api_base_url, config.request_timeout, config.connect_timeout)?;
    let navigator = Arc::new(MemoryNavigator::new(location));
    let state = AuthState::new(
        config,
        Arc::new(FileStorage::new(state_dir.join(SESSION_FILE))),
        Arc::new(FileStorage::new(state_dir.join(TAB_FILE))),
        Arc::new(SystemClock),
        navigator.clone(),
        Arc::new(transport),
    );
    Ok((state, navigator))
}

fn run_status(state: &AuthState) -> Result<(), CliError> {
    let Some(session) = state.session.read() else {
        println!("{}", serde_json::json!({ "valid": false }));
        return Ok(());
    };
    let valid = state.session.is_valid();
    let status = serde_json::json!({
        "valid": valid,
        "user": session.user,
        "expiresAt": session.expires_at,
        "resumePath": state.redirect.peek(),
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn run_get(state: &AuthState, navigator: &MemoryNavigator, path: &str, from: &str) -> Result<(), CliError> {
    let result = state.api.get_json::<Value>(path).await;
    let location = navigator.location();
    if location != from {
        eprintln!("navigated to {location}");
    }
    let json = result?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

async fn run_watch(state: &AuthState, navigator: &MemoryNavigator, duration: Duration) -> Result<(), CliError> {
    let handle = match state.guard.enter_protected(&state.watcher) {
        ProtectedEntry::Mounted(handle) => handle,
        ProtectedEntry::Redirected(to) => {
            eprintln!("navigated to {to}");
            return Err(CliError::NotSignedIn);
        }
    };

    let deadline = tokio::time::Instant::now() + duration;
    while !handle.is_finished() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(WATCH_POLL).await;
    }

    if handle.is_finished() {
        println!("session expired; navigated to {}", navigator.location());
    } else {
        println!("session still valid after {}s", duration.as_secs());
    }
    handle.stop();
    Ok(())
}
