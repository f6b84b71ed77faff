//! pkrguard command line
//!
//! `analyze`, `validate`, `diagnose` and `optimize` over Packer templates
//! and build logs. Results go to the given writer, logs to stderr.
//!
//! Exit codes: 0 success, 1 findings or refusal, 2 operational error.

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod render;

use anyhow::Context as _;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use pkrguard_core::{logging, Certification, Toolkit, ToolkitSettings};
use pkrguard_validation::BuildResult;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const EXIT_OK: u8 = 0;
/// Blocking findings, refused certificate, or partial analysis
pub const EXIT_FINDINGS: u8 = 1;
pub const EXIT_ERROR: u8 = 2;

fn config_arg() -> Arg {
    Arg::new("config")
        .required(true)
        .value_parser(value_parser!(PathBuf))
        .help("Packer template (JSON or YAML; HCL gets textual analysis only)")
}

/// The command tree
#[must_use]
pub fn cli() -> Command {
    Command::new("pkrguard")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Configuration analysis, failure recovery and certification for Packer templates")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("settings")
                .long("settings")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("TOML settings file"),
        )
        .arg(
            Arg::new("state-dir")
                .long("state-dir")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Override the directory holding patterns, certificates and logs"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Output as JSON"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .global(true)
                .action(ArgAction::Count)
                .help("More logging (-v info, -vv debug, -vvv trace)"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .global(true)
                .value_parser(["text", "json"])
                .default_value("text")
                .help("Log line format on stderr"),
        )
        .subcommand(
            Command::new("analyze")
                .about("Detect delusion patterns in a configuration")
                .arg(config_arg()),
        )
        .subcommand(
            Command::new("validate")
                .about("Score a configuration and issue a certificate when it passes")
                .arg(config_arg())
                .arg(
                    Arg::new("build")
                        .long("build")
                        .value_parser(value_parser!(PathBuf))
                        .help("JSON build result with metrics and artifact checksums"),
                )
                .arg(
                    Arg::new("artifact-dir")
                        .long("artifact-dir")
                        .value_parser(value_parser!(PathBuf))
                        .help("Directory relative artifact paths resolve against"),
                ),
        )
        .subcommand(
            Command::new("diagnose")
                .about("Diagnose a failed build log and show the recovery plan")
                .arg(
                    Arg::new("log")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Packer build output"),
                )
                .arg(
                    Arg::new("config")
                        .long("config")
                        .value_parser(value_parser!(PathBuf))
                        .help("Template the build used, for pattern correlation"),
                ),
        )
        .subcommand(
            Command::new("optimize")
                .about("Show performance hints for a configuration")
                .arg(config_arg()),
        )
}

fn emit<T: Serialize>(out: &mut dyn Write, value: &T) -> anyhow::Result<()> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}

fn settings_from(matches: &ArgMatches) -> anyhow::Result<ToolkitSettings> {
    let mut settings = match matches.get_one::<PathBuf>("settings") {
        Some(path) => ToolkitSettings::load(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => ToolkitSettings::default(),
    };
    if let Some(dir) = matches.get_one::<PathBuf>("state-dir") {
        settings.state_dir.clone_from(dir);
    }
    Ok(settings)
}

/// Run a parsed command line, returning the exit code
///
/// # Errors
/// Operational failures: unreadable inputs, bad settings, unavailable
/// state. Findings and refusals are exit codes, not errors.
pub async fn run(matches: &ArgMatches, out: &mut dyn Write) -> anyhow::Result<u8> {
    let log_json = matches
        .get_one::<String>("log-format")
        .is_some_and(|f| f == "json");
    logging::init(matches.get_count("verbose"), log_json);

    let settings = settings_from(matches)?;
    let toolkit = Toolkit::open(settings)
        .await
        .context("opening pkrguard state")?;
    let json = matches.get_flag("json");
    debug!(command = matches.subcommand_name(), json, "dispatching");

    let result = match matches.subcommand() {
        Some(("analyze", args)) => analyze(&toolkit, args, json, out).await,
        Some(("validate", args)) => validate(&toolkit, args, json, out).await,
        Some(("diagnose", args)) => diagnose(&toolkit, args, json, out).await,
        Some(("optimize", args)) => optimize(&toolkit, args, json, out).await,
        _ => Ok(EXIT_ERROR),
    };
    toolkit.shutdown().await.context("flushing pkrguard state")?;
    result
}

fn required_path<'a>(args: &'a ArgMatches, name: &str) -> anyhow::Result<&'a Path> {
    args.get_one::<PathBuf>(name)
        .map(PathBuf::as_path)
        .with_context(|| format!("missing <{name}>"))
}

async fn analyze(
    toolkit: &Toolkit,
    args: &ArgMatches,
    json: bool,
    out: &mut dyn Write,
) -> anyhow::Result<u8> {
    let path = required_path(args, "config")?;
    let outcome = toolkit
        .analyze_path(path)
        .await
        .with_context(|| format!("analyzing {}", path.display()))?;
    if json {
        emit(out, &outcome)?;
    } else {
        render::analysis(out, &outcome)?;
    }
    Ok(if outcome.analysis.has_blocking_findings() {
        EXIT_FINDINGS
    } else {
        EXIT_OK
    })
}

async fn validate(
    toolkit: &Toolkit,
    args: &ArgMatches,
    json: bool,
    out: &mut dyn Write,
) -> anyhow::Result<u8> {
    let path = required_path(args, "config")?;
    let config = match toolkit.load_configuration(path).await {
        Ok(config) => config,
        Err(e) if e.allows_textual_fallback() => {
            let outcome = toolkit
                .analyze_path(path)
                .await
                .with_context(|| format!("analyzing {}", path.display()))?;
            if json {
                emit(out, &outcome)?;
            } else {
                render::analysis(out, &outcome)?;
                writeln!(out, "no certificate: the configuration could not be parsed")?;
            }
            return Ok(EXIT_FINDINGS);
        }
        Err(e) => return Err(e).with_context(|| format!("loading {}", path.display())),
    };

    let build = match args.get_one::<PathBuf>("build") {
        Some(build_path) => {
            let text = tokio::fs::read_to_string(build_path)
                .await
                .with_context(|| format!("reading build result {}", build_path.display()))?;
            let build: BuildResult = serde_json::from_str(&text)
                .with_context(|| format!("parsing build result {}", build_path.display()))?;
            let dir = args
                .get_one::<PathBuf>("artifact-dir")
                .cloned()
                .or_else(|| build_path.parent().map(Path::to_path_buf));
            Some((build, dir))
        }
        None => None,
    };

    let outcome = toolkit
        .certify(
            &config,
            build.as_ref().map(|(b, dir)| (b, dir.as_deref())),
        )
        .await
        .with_context(|| format!("validating {}", path.display()))?;
    if json {
        emit(out, &outcome)?;
    } else {
        render::validation(out, &outcome)?;
    }
    Ok(match outcome.certification {
        Certification::Issued { .. } => EXIT_OK,
        Certification::Refused { .. } => EXIT_FINDINGS,
    })
}

async fn diagnose(
    toolkit: &Toolkit,
    args: &ArgMatches,
    json: bool,
    out: &mut dyn Write,
) -> anyhow::Result<u8> {
    let log_path = required_path(args, "log")?;
    let log = tokio::fs::read_to_string(log_path)
        .await
        .with_context(|| format!("reading build log {}", log_path.display()))?;
    let config = args.get_one::<PathBuf>("config").map(PathBuf::as_path);
    let outcome = toolkit
        .diagnose(&log, config)
        .await
        .context("diagnosing build log")?;
    if json {
        emit(out, &outcome)?;
    } else {
        render::diagnosis(out, &outcome)?;
    }
    Ok(EXIT_OK)
}

async fn optimize(
    toolkit: &Toolkit,
    args: &ArgMatches,
    json: bool,
    out: &mut dyn Write,
) -> anyhow::Result<u8> {
    let path = required_path(args, "config")?;
    let config = toolkit
        .load_configuration(path)
        .await
        .with_context(|| format!("loading {}", path.display()))?;
    let report = toolkit.validation().optimize(&config);
    if json {
        emit(out, &report)?;
    } else {
        render::optimization(out, &report)?;
    }
    Ok(EXIT_OK)
}
