mod config;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use veriface_core::{
    pipeline, EnrollmentStore, MatchOutcome, OnnxFaceProvider, SpoofStrategy, StoreError,
};
use veriface_store::SqliteEnrollmentStore;

use crate::config::Config;

#[derive(Parser)]
#[command(name = "veriface", about = "Face verification with match-triggered enrollment")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify a captured image against an identity's enrollment history
    Verify {
        /// Captured image file
        #[arg(short, long)]
        image: PathBuf,
        /// Claimed identity id
        #[arg(long)]
        identity: String,
        /// Override the configured match threshold
        #[arg(long)]
        threshold: Option<f32>,
    },
    /// Register a face for an existing identity
    Enroll {
        /// Image file to enroll
        #[arg(short, long)]
        image: PathBuf,
        /// Identity id to enroll under
        #[arg(long)]
        identity: String,
    },
    /// Create an identity
    AddIdentity {
        /// Identity id
        identity: String,
        /// Human-readable display name
        #[arg(long)]
        name: Option<String>,
    },
    /// Report whether enrollment data exists for an identity
    Check {
        #[arg(long)]
        identity: String,
    },
    /// List enrollment history for an identity
    List {
        #[arg(long)]
        identity: String,
    },
}

fn main() -> ExitCode {
    // Logs go to stderr; stdout carries exactly one JSON result record.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(message) => {
            emit(&json!({ "error": "InvalidConfig", "message": message }));
            return ExitCode::FAILURE;
        }
    };
    tracing::debug!(
        db = %config.db_path.display(),
        models = %config.model_dir.display(),
        threshold = config.pipeline.match_threshold,
        "configuration loaded"
    );

    run(cli, config)
}

fn run(cli: Cli, mut config: Config) -> ExitCode {
    match cli.command {
        Commands::Verify {
            image,
            identity,
            threshold,
        } => {
            if let Some(threshold) = threshold {
                config.pipeline.match_threshold = threshold;
            }
            verify(&config, &image, &identity)
        }
        Commands::Enroll { image, identity } => enroll(&config, &image, &identity),
        Commands::AddIdentity { identity, name } => add_identity(&config, &identity, name),
        Commands::Check { identity } => check(&config, &identity),
        Commands::List { identity } => list(&config, &identity),
    }
}

fn verify(config: &Config, image: &PathBuf, identity: &str) -> ExitCode {
    let mut store = match open_store(config) {
        Ok(store) => store,
        Err(code) => return code,
    };
    let mut provider = match load_provider(config) {
        Ok(provider) => provider,
        Err(code) => return code,
    };

    match pipeline::run_match(&mut provider, &mut store, &config.pipeline, image, identity) {
        Ok(outcome) => {
            emit(&outcome);
            // A write failure after a genuine match is a partial success:
            // the record says matched, the exit status still signals failure.
            match outcome.error.as_deref() {
                None => ExitCode::SUCCESS,
                Some(code) => exit_code_for(code),
            }
        }
        Err(err) => {
            emit(&MatchOutcome::failure(err.to_string(), err.code()));
            exit_code_for(err.code())
        }
    }
}

fn enroll(config: &Config, image: &PathBuf, identity: &str) -> ExitCode {
    let mut store = match open_store(config) {
        Ok(store) => store,
        Err(code) => return code,
    };
    let mut provider = match load_provider(config) {
        Ok(provider) => provider,
        Err(code) => return code,
    };

    match pipeline::run_registration(&mut provider, &mut store, &config.pipeline, image, identity)
    {
        Ok(outcome) => {
            emit(&outcome);
            ExitCode::SUCCESS
        }
        Err(err) => {
            emit(&json!({ "error": err.code(), "message": err.to_string() }));
            exit_code_for(err.code())
        }
    }
}

fn add_identity(config: &Config, identity: &str, name: Option<String>) -> ExitCode {
    let mut store = match open_store(config) {
        Ok(store) => store,
        Err(code) => return code,
    };

    match store.register_identity(identity, name.as_deref()) {
        Ok(created) => {
            emit(&json!({ "identity_id": identity, "created": created }));
            ExitCode::SUCCESS
        }
        Err(err) => emit_store_error(&err),
    }
}

fn check(config: &Config, identity: &str) -> ExitCode {
    let store = match open_store(config) {
        Ok(store) => store,
        Err(code) => return code,
    };

    let registered = match store.identity_exists(identity) {
        Ok(registered) => registered,
        Err(err) => return emit_store_error(&err),
    };
    match store.list_records(identity) {
        Ok(records) => {
            emit(&json!({
                "identity_id": identity,
                "registered": registered,
                "records": records.len(),
            }));
            ExitCode::SUCCESS
        }
        Err(err) => emit_store_error(&err),
    }
}

fn list(config: &Config, identity: &str) -> ExitCode {
    let store = match open_store(config) {
        Ok(store) => store,
        Err(code) => return code,
    };

    match store.list_records(identity) {
        Ok(records) => {
            emit(&json!({ "identity_id": identity, "records": records }));
            ExitCode::SUCCESS
        }
        Err(err) => emit_store_error(&err),
    }
}

fn open_store(config: &Config) -> Result<SqliteEnrollmentStore, ExitCode> {
    SqliteEnrollmentStore::open(&config.db_path).map_err(|err| emit_store_error(&err))
}

fn load_provider(config: &Config) -> Result<OnnxFaceProvider, ExitCode> {
    let liveness_path = match config.pipeline.spoof_strategy {
        SpoofStrategy::Provider => Some(config.liveness_model_path()),
        SpoofStrategy::Heuristic => None,
    };
    OnnxFaceProvider::load(
        &config.detector_model_path(),
        &config.embedder_model_path(),
        liveness_path.as_deref(),
    )
    .map_err(|err| {
        emit(&json!({ "error": "ProviderFailed", "message": err.to_string() }));
        exit_code_for("ProviderFailed")
    })
}

fn emit_store_error(err: &StoreError) -> ExitCode {
    emit(&json!({ "error": err.code(), "message": err.to_string() }));
    exit_code_for(err.code())
}

fn emit<T: serde::Serialize>(record: &T) {
    match serde_json::to_string(record) {
        Ok(payload) => println!("{payload}"),
        Err(e) => eprintln!("error: failed to serialize result: {e}"),
    }
}

/// One exit code per error kind; zero means a completed attempt regardless
/// of match outcome.
fn exit_code_for(code: &str) -> ExitCode {
    match code {
        "InvalidImage" => ExitCode::from(2),
        "SpoofDetected" => ExitCode::from(3),
        "NoFaceDetected" => ExitCode::from(4),
        "MultipleFacesDetected" => ExitCode::from(5),
        "DimensionMismatch" => ExitCode::from(6),
        "NoEnrollmentHistory" => ExitCode::from(7),
        "StoreUnavailable" => ExitCode::from(8),
        "StoreWriteFailed" => ExitCode::from(9),
        "UnknownIdentity" => ExitCode::from(10),
        _ => ExitCode::FAILURE,
    }
}
