use std::process::ExitCode;

use academy::{
    BackendConfig, ConfigError, Gate, GateDecision, LoginError, MemoryTokenStore, RemoteVerifier, SessionState,
    SessionStore, VerifyError,
};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("verifier setup failed: {0}")]
    Verifier(#[from] VerifyError),
    #[error("missing password; pass --password or set ACADEMY_PASSWORD")]
    MissingPassword,
    #[error("sign-in failed: {0}")]
    Login(#[from] LoginError),
    #[error("invalid JSON output: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "academy-cli", about = "Check sessions, roles and route gates against the hosted backend")]
struct Cli {
    #[arg(long, env = "ACADEMY_BACKEND_URL")]
    base_url: Option<String>,

    #[arg(long, env = "ACADEMY_BACKEND_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve the session behind an access token and print the user.
    Whoami {
        #[arg(long, env = "ACADEMY_ACCESS_TOKEN", hide_env_values = true)]
        access_token: Option<String>,
    },
    /// Sign in and print the resulting user and role flags.
    Login {
        identifier: String,
        #[arg(long, env = "ACADEMY_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Sign in, then print what a gate decides for that user.
    Gate {
        #[arg(value_enum)]
        gate: GateArg,
        identifier: String,
        #[arg(long, env = "ACADEMY_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum GateArg {
    Auth,
    Director,
    Instructor,
}

impl From<GateArg> for Gate {
    fn from(arg: GateArg) -> Self {
        match arg {
            GateArg::Auth => Self::Authenticated,
            GateArg::Director => Self::Director,
            GateArg::Instructor => Self::Instructor,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = load_config(cli.base_url.as_deref(), cli.api_key.as_deref())?;

    match cli.command {
        Command::Whoami { access_token } => {
            let tokens = access_token.map_or_else(MemoryTokenStore::default, |t| MemoryTokenStore::with_token(t));
            let store = SessionStore::new(RemoteVerifier::new(config, tokens)?);
            store.initialize().await;
            print_json(&state_json(&store.state(), None))
        }
        Command::Login { identifier, password } => {
            let password = password.ok_or(CliError::MissingPassword)?;
            let store = SessionStore::new(RemoteVerifier::new(config, MemoryTokenStore::default())?);
            store.initialize().await;
            store.login(&identifier, &password).await?;
            print_json(&state_json(&store.state(), None))
        }
        Command::Gate { gate, identifier, password } => {
            let password = password.ok_or(CliError::MissingPassword)?;
            let store = SessionStore::new(RemoteVerifier::new(config, MemoryTokenStore::default())?);
            store.initialize().await;
            if let Err(e) = store.login(&identifier, &password).await {
                tracing::warn!(error = %e, "sign-in failed; evaluating gate as signed out");
            }
            let decision = Gate::from(gate).settle(&mut store.subscribe()).await;
            print_json(&state_json(&store.state(), Some(decision)))
        }
    }
}

/// Flag values win over the environment for the two connection settings.
fn load_config(base_url: Option<&str>, api_key: Option<&str>) -> Result<BackendConfig, ConfigError> {
    BackendConfig::from_lookup(|key| match key {
        "ACADEMY_BACKEND_URL" if base_url.is_some() => base_url.map(str::to_owned),
        "ACADEMY_BACKEND_KEY" if api_key.is_some() => api_key.map(str::to_owned),
        _ => std::env::var(key).ok(),
    })
}

fn state_json(state: &SessionState, decision: Option<GateDecision>) -> Value {
    let flags = state.flags();
    let mut out = json!({
        "user": state.user,
        "loading": state.loading,
        "flags": {
            "is_authenticated": flags.is_authenticated,
            "is_director": flags.is_director,
            "is_instructor": flags.is_instructor,
        },
    });
    if let Some(decision) = decision {
        out["decision"] = Value::String(decision.to_string());
    }
    out
}

fn print_json(value: &Value) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use academy::User;

    use super::*;

    #[test]
    fn parses_gate_command() {
        let cli = Cli::try_parse_from([
            "academy-cli",
            "--base-url",
            "https://p.example",
            "--api-key",
            "k",
            "gate",
            "director",
            "A123",
            "--password",
            "secret",
        ])
        .unwrap();
        match cli.command {
            Command::Gate { gate, identifier, password } => {
                assert_eq!(gate, GateArg::Director);
                assert_eq!(identifier, "A123");
                assert_eq!(password.as_deref(), Some("secret"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn gate_arg_maps_to_gate() {
        assert_eq!(Gate::from(GateArg::Auth), Gate::Authenticated);
        assert_eq!(Gate::from(GateArg::Director), Gate::Director);
        assert_eq!(Gate::from(GateArg::Instructor), Gate::Instructor);
    }

    #[test]
    fn flags_override_environment() {
        let cfg = load_config(Some("https://flag.example/"), Some("flag-key")).unwrap();
        assert_eq!(cfg.base_url, "https://flag.example");
        assert_eq!(cfg.api_key, "flag-key");
    }

    #[test]
    fn state_json_includes_flags_and_decision() {
        let state = SessionState::settled(Some(User::new("u1", "Dupont", "direction")));
        let out = state_json(&state, Some(GateDecision::Render));
        assert_eq!(out["user"]["name"], "Dupont");
        assert_eq!(out["user"]["role"], "direction");
        assert_eq!(out["flags"]["is_director"], true);
        assert_eq!(out["decision"], "render");
    }

    #[test]
    fn state_json_signed_out() {
        let out = state_json(&SessionState::settled(None), None);
        assert!(out["user"].is_null());
        assert_eq!(out["flags"]["is_authenticated"], false);
        assert!(out.get("decision").is_none());
    }
}
