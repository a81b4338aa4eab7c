use std::fs;
use std::path::{Path, PathBuf};
use std::process::{exit, Command, ExitStatus};

use clap::{Parser, Subcommand, ValueEnum};
use ingest_core::artifact::{build, Artifact, BuildRequest};
use ingest_core::config::DeploymentConfig;
use ingest_core::graph::{ingestion_graph, Resource};
use ingest_core::identity::permission_document;
use ingest_core::orchestrator::{Orchestrator, SimulatedPlatform};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "xtask",
    about = "Task runner for the email ingestion workspace",
    long_about = "A unified CLI for packaging the receiver Lambda, rendering the\n\
                  provisioning plan, and running CI checks."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the receiver Lambda and package it as a deployable artifact
    Package {
        /// Compilation target triple for the Lambda binary
        #[arg(long, env = "INGEST_LAMBDA_TARGET", default_value = "x86_64-unknown-linux-gnu")]
        target: String,
        /// Build profile used for the binary
        #[arg(value_enum, long, default_value_t = BuildProfile::Release)]
        profile: BuildProfile,
        /// Package an already built binary instead of invoking cargo
        #[arg(long)]
        binary: Option<PathBuf>,
        /// Pinned dependency lock (`name==version` per line)
        #[arg(long)]
        dependency_lock: Option<PathBuf>,
        /// Directory holding `<name>-<version>/` package trees
        #[arg(long)]
        dependency_root: Option<PathBuf>,
        /// Artifact output path
        #[arg(long, default_value = "dist/email_receiver.zip")]
        output: PathBuf,
    },
    /// Print the ordered provisioning plan for a deployment config
    Plan {
        /// Deployment config file
        #[arg(long, env = "INGEST_CONFIG", default_value = "config/ingest.example.json")]
        config: PathBuf,
        /// Artifact to deploy; defaults to the config's artifact_path
        #[arg(long)]
        artifact: Option<PathBuf>,
    },
    /// Run CI checks (fmt, clippy, tests, packaging)
    Ci {
        /// Job to run
        #[arg(value_enum, default_value_t = CiJob::Check)]
        job: CiJob,
    },
}

#[derive(Clone, ValueEnum)]
enum CiJob {
    /// Formatting, clippy, and tests
    Check,
    /// Debug build of the receiver packaged into dist/
    Package,
    /// Run check + package
    All,
}

#[derive(Clone, Copy, ValueEnum)]
enum BuildProfile {
    Debug,
    Release,
}

impl BuildProfile {
    fn dir_name(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Release => "release",
        }
    }

    fn as_cargo_flag(self) -> Option<&'static str> {
        match self {
            Self::Debug => None,
            Self::Release => Some("--release"),
        }
    }
}

const RECEIVER_BIN: &str = "email_receiver";
const STAGING_DIR: &str = "target/lambda-staging/email_receiver";

// ── helpers ────────────────────────────────────────────────────────

fn step(label: &str) {
    eprintln!("\n=== {label} ===");
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("error: {message}");
    exit(1);
}

fn cargo(args: &[&str]) -> ExitStatus {
    eprintln!("+ cargo {}", args.join(" "));
    Command::new("cargo")
        .args(args)
        .status()
        .unwrap_or_else(|error| fail(format!("failed to execute cargo: {error}")))
}

fn run_cargo(args: &[&str]) {
    let status = cargo(args);
    if !status.success() {
        exit(status.code().unwrap_or(1));
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

// ── package ────────────────────────────────────────────────────────

struct PackageOptions {
    target: String,
    profile: BuildProfile,
    binary: Option<PathBuf>,
    dependency_lock: Option<PathBuf>,
    dependency_root: Option<PathBuf>,
    output: PathBuf,
}

fn package_receiver(options: PackageOptions) {
    let binary = match options.binary {
        Some(binary) => binary,
        None => {
            ensure_rust_target_installed(&options.target);

            step("Build receiver lambda binary");
            let mut cargo_args = vec![
                "build",
                "-p",
                "ingest_lambda",
                "--target",
                options.target.as_str(),
                "--bin",
                RECEIVER_BIN,
            ];
            if let Some(flag) = options.profile.as_cargo_flag() {
                cargo_args.push(flag);
            }
            run_cargo(&cargo_args);

            Path::new("target")
                .join(&options.target)
                .join(options.profile.dir_name())
                .join(binary_name(RECEIVER_BIN, &options.target))
        }
    };
    if !binary.is_file() {
        fail(format!("expected lambda binary at '{}'", binary.display()));
    }

    step("Stage bootstrap");
    let staging = Path::new(STAGING_DIR);
    if staging.exists() {
        fs::remove_dir_all(staging).unwrap_or_else(|error| {
            fail(format!("failed to clear '{}': {error}", staging.display()))
        });
    }
    fs::create_dir_all(staging)
        .unwrap_or_else(|error| fail(format!("failed to create '{}': {error}", staging.display())));
    fs::copy(&binary, staging.join("bootstrap"))
        .unwrap_or_else(|error| fail(format!("failed to stage '{}': {error}", binary.display())));

    step("Build deployment artifact");
    let artifact = build(&BuildRequest {
        source_dir: staging.to_path_buf(),
        entry_point: "bootstrap".to_string(),
        dependency_lock: options.dependency_lock,
        dependency_root: options.dependency_root,
        output_path: options.output,
    })
    .unwrap_or_else(|error| fail(error));

    eprintln!(
        "\nPackaged artifact:\n- {}\n- sha256 {}",
        artifact.path.display(),
        artifact.content_hash()
    );
}

fn ensure_rust_target_installed(target: &str) {
    let output = Command::new("rustup")
        .args(["target", "list", "--installed"])
        .output();

    let output = match output {
        Ok(value) => value,
        Err(error) => {
            eprintln!(
                "warning: failed to run `rustup target list --installed` ({error}); continuing without target preflight"
            );
            return;
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        fail(format!(
            "failed to list installed rust targets; run `rustup target list --installed` manually. details: {}",
            stderr.trim()
        ));
    }

    let installed = String::from_utf8_lossy(&output.stdout);
    if !installed.lines().any(|line| line.trim() == target) {
        fail(format!(
            "required rust target `{target}` is not installed. install it with `rustup target add {target}` and re-run `cargo run -p xtask -- package`"
        ));
    }
}

fn binary_name(bin_name: &str, target: &str) -> String {
    if target.contains("windows") {
        format!("{bin_name}.exe")
    } else {
        bin_name.to_string()
    }
}

// ── plan ───────────────────────────────────────────────────────────

fn render_plan(config_path: &Path, artifact_path: Option<PathBuf>) -> Value {
    let config = DeploymentConfig::load(config_path).unwrap_or_else(|error| fail(error));
    let artifact_path = artifact_path.unwrap_or_else(|| config.artifact_path.clone());
    let artifact = Artifact::load(&artifact_path).unwrap_or_else(|error| fail(error));

    let graph =
        ingestion_graph(&config, artifact.content_hash()).unwrap_or_else(|error| fail(error));
    let order = graph.apply_order().unwrap_or_else(|error| fail(error));

    // Dry run against an empty simulated platform: every step must apply.
    let report = SimulatedPlatform::new()
        .apply(&graph)
        .unwrap_or_else(|error| fail(error));
    if let Some(halted_at) = &report.halted_at {
        fail(format!("plan does not apply cleanly: halted at {halted_at}"));
    }

    let mut trust_policy = Value::Null;
    let mut permission_policy = Value::Null;
    let steps: Vec<Value> = order
        .iter()
        .enumerate()
        .filter_map(|(index, id)| {
            let resource = graph.get(id)?;
            match resource {
                Resource::Identity { trust, .. } => trust_policy = trust.document(),
                Resource::Grant { statements, .. } => {
                    permission_policy = permission_document(statements)
                }
                _ => {}
            }
            Some(json!({
                "step": index + 1,
                "id": id.to_string(),
                "resource": resource,
                "outcome": report.outcome(id),
            }))
        })
        .collect();

    json!({
        "deployment": {
            "bucket": config.bucket_name,
            "stage": config.stage,
            "function": config.function_name,
        },
        "artifact": {
            "path": artifact.path.display().to_string(),
            "content_hash": artifact.content_hash(),
            "built_at": artifact.manifest.built_at,
        },
        "steps": steps,
        "trust_policy": trust_policy,
        "permission_policy": permission_policy,
    })
}

// ── CI jobs ────────────────────────────────────────────────────────

fn ci_check() {
    step("Check formatting");
    run_cargo(&["fmt", "--all", "--", "--check"]);

    step("Clippy");
    run_cargo(&[
        "clippy",
        "--all-targets",
        "--all-features",
        "--",
        "-D",
        "warnings",
    ]);

    step("Test ingest_core");
    run_cargo(&["test", "-p", "ingest_core"]);

    step("Test ingest_lambda");
    run_cargo(&["test", "-p", "ingest_lambda"]);
}

fn ci_package() {
    step("Build receiver (debug, host target)");
    run_cargo(&["build", "-p", "ingest_lambda", "--bin", RECEIVER_BIN]);

    package_receiver(PackageOptions {
        target: String::new(),
        profile: BuildProfile::Debug,
        binary: Some(
            Path::new("target")
                .join(BuildProfile::Debug.dir_name())
                .join(binary_name(RECEIVER_BIN, std::env::consts::OS)),
        ),
        dependency_lock: None,
        dependency_root: None,
        output: PathBuf::from("dist/email_receiver.zip"),
    });
}

// ── main ───────────────────────────────────────────────────────────

fn main() {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Package {
            target,
            profile,
            binary,
            dependency_lock,
            dependency_root,
            output,
        } => {
            package_receiver(PackageOptions {
                target,
                profile,
                binary,
                dependency_lock,
                dependency_root,
                output,
            });
        }
        Commands::Plan { config, artifact } => {
            let plan = render_plan(&config, artifact);
            match serde_json::to_string_pretty(&plan) {
                Ok(text) => println!("{text}"),
                Err(error) => fail(format!("failed to render plan: {error}")),
            }
        }
        Commands::Ci { job } => {
            match job {
                CiJob::Check => ci_check(),
                CiJob::Package => ci_package(),
                CiJob::All => {
                    ci_check();
                    ci_package();
                }
            }
            eprintln!("\nCI job passed.");
        }
    }
}
